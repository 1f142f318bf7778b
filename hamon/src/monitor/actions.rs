use crate::cluster::{Change, ServiceLocalExpect, ServiceStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
  Start,
  Stop,
  Freeze,
  Thaw,
  Provision,
}
impl ActionKind {
  pub fn as_str(self) -> &'static str {
    match self {
      ActionKind::Start => "start",
      ActionKind::Stop => "stop",
      ActionKind::Freeze => "freeze",
      ActionKind::Thaw => "thaw",
      ActionKind::Provision => "provision",
    }
  }
}
impl fmt::Display for ActionKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// An external command to run against a service instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
  pub path: String,
  pub kind: ActionKind,
  /// Restricts the action to these resources. Empty means the whole service.
  pub rids: Vec<String>,
}
impl Action {
  pub fn new(path: &str, kind: ActionKind) -> Action {
    Action {
      path: path.to_string(),
      kind: kind,
      rids: Vec::new(),
    }
  }

  pub fn on_resource(path: &str, kind: ActionKind, rid: &str) -> Action {
    Action {
      path: path.to_string(),
      kind: kind,
      rids: vec![rid.to_string()],
    }
  }

  /// What the service monitor record becomes once the action ends, decided at launch.
  pub fn outcome(&self) -> Outcome {
    let (success, failure, expect) = match self.kind {
      ActionKind::Start => (
        ServiceStatus::Idle,
        ServiceStatus::StartFailed,
        Change::Set(ServiceLocalExpect::Started),
      ),
      ActionKind::Stop => (ServiceStatus::Idle, ServiceStatus::StopFailed, Change::Clear),
      ActionKind::Freeze => (ServiceStatus::Idle, ServiceStatus::FreezeFailed, Change::Keep),
      ActionKind::Thaw => (ServiceStatus::Idle, ServiceStatus::ThawFailed, Change::Keep),
      ActionKind::Provision => {
        (ServiceStatus::Idle, ServiceStatus::ProvisionFailed, Change::Keep)
      }
    };
    Outcome {
      success: success,
      failure: failure,
      success_expect: expect,
    }
  }
}
impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.path, self.kind)?;
    for rid in self.rids.iter() {
      write!(f, " --rid {}", rid)?;
    }
    Ok(())
  }
}

/// Monitor record changes applied when an action ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Outcome {
  pub success: ServiceStatus,
  pub failure: ServiceStatus,
  pub success_expect: Change<ServiceLocalExpect>,
}

#[derive(Error, Debug)]
pub enum LaunchError {
  #[error("action command {0} not found")]
  NotFound(PathBuf),
  #[error("action command {0} is not executable")]
  NotExecutable(PathBuf),
  #[error("cannot spawn action: {0}")]
  Spawn(#[from] std::io::Error),
}

/// A running action.
pub trait ActionHandle: Send {
  /// The exit code once the action is over. Never blocks.
  fn poll(&mut self) -> Option<i32>;
  fn pid(&self) -> Option<u32>;
  /// Asks the action to stop.
  fn terminate(&mut self);
  fn kill(&mut self);
}

pub trait Launcher: Send + Sync {
  fn launch(&self, action: &Action) -> Result<Box<dyn ActionHandle>, LaunchError>;
}

/// Runs actions as `<command> <path> <action> [--rid <rid>]...`, each in its own process group so
/// a stop can signal whatever the action spawned.
pub struct ProcessLauncher {
  command: PathBuf,
}
impl ProcessLauncher {
  pub fn new(command: PathBuf) -> ProcessLauncher {
    ProcessLauncher { command: command }
  }

  fn check_command(&self) -> Result<(), LaunchError> {
    let meta = std::fs::metadata(&self.command)
      .map_err(|_| LaunchError::NotFound(self.command.clone()))?;
    if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
      return Err(LaunchError::NotExecutable(self.command.clone()));
    }
    Ok(())
  }
}
impl Launcher for ProcessLauncher {
  fn launch(&self, action: &Action) -> Result<Box<dyn ActionHandle>, LaunchError> {
    self.check_command()?;
    let mut cmd = Command::new(&self.command);
    cmd.arg(&action.path).arg(action.kind.as_str());
    for rid in action.rids.iter() {
      cmd.arg("--rid").arg(rid);
    }
    cmd
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .process_group(0);
    let child = cmd.spawn()?;
    debug!(%action, pid = child.id(), "action spawned");
    Ok(Box::new(ProcessHandle {
      child: child,
      code: None,
    }))
  }
}

struct ProcessHandle {
  child: Child,
  code: Option<i32>,
}
impl ProcessHandle {
  fn signal_group(&self, sig: libc::c_int) {
    let pgid = self.child.id() as libc::pid_t;
    // The child leads its own process group.
    let rc = unsafe { libc::kill(-pgid, sig) };
    if rc != 0 {
      debug!(pgid, sig, error = %std::io::Error::last_os_error(), "cannot signal action");
    }
  }
}
impl ActionHandle for ProcessHandle {
  fn poll(&mut self) -> Option<i32> {
    if self.code.is_some() {
      return self.code;
    }
    match self.child.try_wait() {
      Ok(Some(status)) => {
        // Killed by a signal: no code, report a failure.
        self.code = Some(status.code().unwrap_or(1));
        self.code
      }
      Ok(None) => None,
      Err(e) => {
        warn!(pid = self.child.id(), error = %e, "cannot poll action");
        self.code = Some(1);
        self.code
      }
    }
  }

  fn pid(&self) -> Option<u32> {
    Some(self.child.id())
  }

  fn terminate(&mut self) {
    if self.poll().is_none() {
      self.signal_group(libc::SIGTERM);
    }
  }

  fn kill(&mut self) {
    if self.poll().is_none() {
      self.signal_group(libc::SIGKILL);
    }
  }
}

/// SIGTERMs every handle, waits up to `stop_tmo` for them to end, then SIGKILLs the rest.
/// Returns how many had to be killed.
pub async fn terminate_all(
  handles: &mut [&mut Box<dyn ActionHandle>],
  stop_tmo: Duration,
) -> usize {
  for h in handles.iter_mut() {
    h.terminate();
  }
  let deadline = Instant::now() + stop_tmo;
  while Instant::now() < deadline {
    if handles.iter_mut().all(|h| h.poll().is_some()) {
      return 0;
    }
    tokio::time::sleep(Duration::from_millis(50).min(stop_tmo)).await;
  }
  let mut killed = 0;
  for h in handles.iter_mut() {
    if h.poll().is_none() {
      warn!(pid = ?h.pid(), "action still running after stop timeout, killing");
      h.kill();
      killed += 1;
    }
  }
  killed
}

#[cfg(test)]
fn system_command(name: &str) -> PathBuf {
  ["/usr/bin", "/bin"]
    .iter()
    .map(|dir| PathBuf::from(dir).join(name))
    .find(|p| p.exists())
    .unwrap()
}

#[cfg(test)]
fn wait_code(handle: &mut Box<dyn ActionHandle>) -> i32 {
  let deadline = Instant::now() + Duration::from_secs(10);
  loop {
    if let Some(code) = handle.poll() {
      return code;
    }
    assert!(Instant::now() < deadline, "action did not end");
    std::thread::sleep(Duration::from_millis(10));
  }
}

#[test]
fn test_outcomes_bound_at_launch() {
  let start = Action::new("svc1", ActionKind::Start).outcome();
  assert_eq!(start.failure, ServiceStatus::StartFailed);
  assert_eq!(start.success_expect, Change::Set(ServiceLocalExpect::Started));
  let stop = Action::new("svc1", ActionKind::Stop).outcome();
  assert_eq!(stop.failure, ServiceStatus::StopFailed);
  assert_eq!(stop.success_expect, Change::Clear);
  let restart = Action::on_resource("svc1", ActionKind::Start, "app#1");
  assert_eq!(restart.to_string(), "svc1 start --rid app#1");
}

#[test]
fn test_process_launcher_exit_codes() {
  let action = Action::new("svc1", ActionKind::Start);
  let mut h = ProcessLauncher::new(system_command("true")).launch(&action).unwrap();
  assert_eq!(wait_code(&mut h), 0);
  let mut h = ProcessLauncher::new(system_command("false")).launch(&action).unwrap();
  assert_eq!(wait_code(&mut h), 1);

  let dir = std::env::temp_dir().join(format!("hamon-launcher-{}", std::process::id()));
  std::fs::create_dir_all(&dir).unwrap();
  let noexec = dir.join("action");
  std::fs::write(&noexec, "#!/bin/sh\nexit 0\n").unwrap();
  std::fs::set_permissions(&noexec, std::fs::Permissions::from_mode(0o644)).unwrap();
  assert!(matches!(
    ProcessLauncher::new(noexec).launch(&action),
    Err(LaunchError::NotExecutable(_))
  ));
  assert!(matches!(
    ProcessLauncher::new(dir.join("missing")).launch(&action),
    Err(LaunchError::NotFound(_))
  ));
  let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_terminate_all_signals_process_group() {
  // `yes` ignores its arguments and runs until signaled.
  let launcher = ProcessLauncher::new(system_command("yes"));
  let mut a = launcher.launch(&Action::new("svc1", ActionKind::Stop)).unwrap();
  let mut b = launcher.launch(&Action::new("svc2", ActionKind::Stop)).unwrap();
  assert_eq!(a.poll(), None);
  assert_eq!(terminate_all(&mut [&mut a, &mut b], Duration::from_secs(5)).await, 0);
  assert_ne!(wait_code(&mut a), 0);
  assert_ne!(wait_code(&mut b), 0);
}

#[cfg(test)]
struct IgnoresSigterm {
  killed: bool,
}
#[cfg(test)]
impl ActionHandle for IgnoresSigterm {
  fn poll(&mut self) -> Option<i32> {
    if self.killed {
      Some(137)
    } else {
      None
    }
  }

  fn pid(&self) -> Option<u32> {
    None
  }

  fn terminate(&mut self) {}

  fn kill(&mut self) {
    self.killed = true;
  }
}

#[tokio::test]
async fn test_terminate_all_lets_other_tasks_run_while_waiting() {
  let mut stubborn: Box<dyn ActionHandle> = Box::new(IgnoresSigterm { killed: false });
  let stopping = async {
    let killed = terminate_all(&mut [&mut stubborn], Duration::from_millis(400)).await;
    (killed, Instant::now())
  };
  let other = async {
    for _ in 0..3 {
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Instant::now()
  };
  let ((killed, stopped_at), other_done_at) = tokio::join!(stopping, other);
  assert_eq!(killed, 1);
  assert!(other_done_at < stopped_at);
  assert_eq!(stubborn.poll(), Some(137));
}
