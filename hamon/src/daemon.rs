use crate::cluster::data::{
  empty_node_blob, instance_path, nmon_path, node_path, service_config_path, smon_path,
};
use crate::cluster::{
  Change, HeartbeatRegistry, NodeGlobalExpect, NodeLocalExpect, NodeMonitor, NodeStatus,
  PeerSync, Publisher, ServiceConfig, ServiceGlobalExpect, ServiceLocalExpect, ServiceMonitor,
  ServiceStatus,
};
use crate::core::{DataError, JournalConfig, JournalGuard, JournaledData, Path, Value};
use crate::monitor::{ConfigError, DaemonConfig, Generational};
use crate::{path, vmap};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use validator::Validate;

/// Seconds since the epoch.
pub fn now() -> f64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs_f64())
    .unwrap_or(0.0)
}

#[derive(Error, Debug)]
pub enum StateError {
  #[error(transparent)]
  Data(#[from] DataError),
  #[error("cannot encode record: {0}")]
  Encode(#[from] serde_json::Error),
  #[error(transparent)]
  Config(#[from] ConfigError),
}

/// A `set_nmon` request. Absent fields are left alone.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct NmonUpdate {
  #[serde(default)]
  pub status: Option<NodeStatus>,
  #[serde(default)]
  pub local_expect: Change<NodeLocalExpect>,
  #[serde(default)]
  pub global_expect: Change<NodeGlobalExpect>,
}

/// A `set_smon` request. Absent fields are left alone.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct SmonUpdate {
  #[serde(default)]
  pub status: Option<ServiceStatus>,
  #[serde(default)]
  pub local_expect: Change<ServiceLocalExpect>,
  #[serde(default)]
  pub global_expect: Change<ServiceGlobalExpect>,
  /// Drops every retry counter.
  #[serde(default)]
  pub reset_retries: bool,
}

/// Everything the daemon threads share, built once at startup.
pub struct DaemonState {
  nodename: String,
  pub data: JournaledData,
  pub heartbeats: HeartbeatRegistry,
  pub peers: PeerSync,
  config: RwLock<Arc<DaemonConfig>>,
  config_path: Option<PathBuf>,
  generation: AtomicU64,
  config_changed: AtomicBool,
  cluster_nodes: Generational<Vec<String>>,
  publisher: Mutex<Publisher>,
  wake: Notify,
  stop: AtomicBool,
  started_at: f64,
}
impl DaemonState {
  pub fn new(config: DaemonConfig) -> DaemonState {
    DaemonState::with_config_path(config, None)
  }

  /// A state whose configuration is reloaded from `config_path` when notified of a change.
  pub fn with_config_path(config: DaemonConfig, config_path: Option<PathBuf>) -> DaemonState {
    let nodename = config.nodename.clone();
    let data = JournaledData::new(
      vmap! { "cluster" => vmap! { "nodes" => vmap! { nodename.as_str() => empty_node_blob() } } },
      Some(JournalConfig {
        head: node_path(&nodename),
        exclude: vec![path!["stats"]],
      }),
    );
    DaemonState {
      heartbeats: HeartbeatRegistry::new(config.hb.clone()),
      nodename: nodename,
      data: data,
      peers: PeerSync::new(),
      config: RwLock::new(Arc::new(config)),
      config_path: config_path,
      generation: AtomicU64::new(1),
      config_changed: AtomicBool::new(false),
      cluster_nodes: Generational::new(),
      publisher: Mutex::new(Publisher::new()),
      wake: Notify::new(),
      stop: AtomicBool::new(false),
      started_at: now(),
    }
  }

  pub fn nodename(&self) -> &str {
    &self.nodename
  }

  pub fn started_at(&self) -> f64 {
    self.started_at
  }

  pub fn config(&self) -> Arc<DaemonConfig> {
    self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
  }

  pub fn generation(&self) -> u64 {
    self.generation.load(Ordering::Acquire)
  }

  /// Declared cluster nodes, recomputed only when the configuration changes.
  pub fn cluster_nodes(&self) -> Vec<String> {
    let config = self.config();
    self
      .cluster_nodes
      .get(self.generation(), || config.cluster_nodes())
  }

  /// Installs a new configuration. The node name is fixed for the life of the process.
  pub fn replace_config(&self, mut config: DaemonConfig) {
    if config.nodename != self.nodename {
      warn!(
        configured = %config.nodename,
        running = %self.nodename,
        "node name change ignored until restart"
      );
      config.nodename = self.nodename.clone();
    }
    *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
    let gen = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
    info!(generation = gen, "configuration installed");
    self.wake();
  }

  /// Flags the configuration file as changed. The next tick reloads it.
  pub fn notify_config_changed(&self) {
    self.config_changed.store(true, Ordering::Release);
    self.wake();
  }

  /// Reloads the configuration if flagged as changed. Returns whether a new one was installed.
  pub fn reload_config(&self) -> Result<bool, ConfigError> {
    if !self.config_changed.swap(false, Ordering::AcqRel) {
      return Ok(false);
    }
    match &self.config_path {
      Some(path) => {
        let config = DaemonConfig::load(path)?;
        self.replace_config(config);
        Ok(true)
      }
      None => Ok(false),
    }
  }

  pub fn wake(&self) {
    self.wake.notify_one();
  }

  /// Resolves at the next [`wake`](Self::wake), or at once if one happened since the last call.
  pub async fn woken(&self) {
    self.wake.notified().await
  }

  pub fn request_stop(&self) {
    self.stop.store(true, Ordering::Release);
    self.wake();
  }

  /// Publishes the node as in maintenance, then asks the monitor to stop.
  pub fn stop_daemon(&self) -> Result<(), StateError> {
    let result = self.set_nmon(NmonUpdate {
      status: Some(NodeStatus::Maintenance),
      ..NmonUpdate::default()
    });
    self.request_stop();
    result.map(|_| ())
  }

  pub fn stop_requested(&self) -> bool {
    self.stop.load(Ordering::Acquire)
  }

  pub fn publisher(&self) -> MutexGuard<'_, Publisher> {
    self.publisher.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn nmon(&self) -> NodeMonitor {
    self
      .data
      .get_or(&nmon_path(&self.nodename), Value::Null)
      .decode()
      .unwrap_or_default()
  }

  pub fn smon(&self, path: &str) -> Option<ServiceMonitor> {
    self
      .data
      .get(&smon_path(&self.nodename, path))
      .ok()
      .and_then(|v| v.decode().ok())
  }

  pub fn set_nmon(&self, update: NmonUpdate) -> Result<bool, StateError> {
    self.set_nmon_at(update, now())
  }

  /// Applies a node monitor change. Idempotent: returns `false` and writes nothing when the
  /// record would not change.
  pub fn set_nmon_at(&self, update: NmonUpdate, at: f64) -> Result<bool, StateError> {
    let changed = self.update_nmon_at(at, |m| {
      if let Some(status) = update.status {
        m.status = status;
      }
      m.local_expect = update.local_expect.apply(m.local_expect);
      m.global_expect = update.global_expect.apply(m.global_expect);
    })?;
    if changed {
      self.wake();
    }
    Ok(changed)
  }

  /// Edits the local node monitor record. `status_updated` follows status changes.
  pub fn update_nmon_at<F>(&self, at: f64, edit: F) -> Result<bool, StateError>
  where
    F: FnOnce(&mut NodeMonitor),
  {
    let mut guard = self.data.lock();
    let path = nmon_path(&self.nodename);
    let current: NodeMonitor = guard.get_or(&path, Value::Null).decode().unwrap_or_default();
    let mut next = current.clone();
    edit(&mut next);
    if next.status != current.status {
      next.status_updated = at;
    }
    if next == current {
      return Ok(false);
    }
    guard.set(&path, Value::encode(&next)?)?;
    Ok(true)
  }

  pub fn set_smon(&self, path: &str, update: SmonUpdate) -> Result<bool, StateError> {
    self.set_smon_at(path, update, now())
  }

  /// Applies a service monitor change, creating the record on first reference. Idempotent.
  pub fn set_smon_at(&self, path: &str, update: SmonUpdate, at: f64) -> Result<bool, StateError> {
    let changed = self.update_smon_at(path, at, |m| {
      if let Some(status) = update.status {
        m.status = status;
      }
      m.local_expect = update.local_expect.apply(m.local_expect);
      m.global_expect = update.global_expect.apply(m.global_expect);
      if update.reset_retries {
        m.restart.clear();
      }
    })?;
    if changed {
      self.wake();
    }
    Ok(changed)
  }

  /// Edits a local service monitor record. `status_updated` follows status changes.
  pub fn update_smon_at<F>(&self, path: &str, at: f64, edit: F) -> Result<bool, StateError>
  where
    F: FnOnce(&mut ServiceMonitor),
  {
    let mut guard = self.data.lock();
    let instance = self.ensure_instance(&mut guard, path)?;
    let smon = instance.child("monitor");
    let current: ServiceMonitor = guard.get_or(&smon, Value::Null).decode().unwrap_or_default();
    let mut next = current.clone();
    edit(&mut next);
    if next.status != current.status {
      next.status_updated = at;
    }
    if next == current && guard.exists(&smon) {
      return Ok(false);
    }
    guard.set(&smon, Value::encode(&next)?)?;
    Ok(true)
  }

  fn ensure_instance(&self, guard: &mut JournalGuard<'_>, path: &str) -> Result<Path, DataError> {
    let node = node_path(&self.nodename);
    guard.setnx(&node.child("services"), Value::map())?;
    guard.setnx(&node.child("services").child("status"), Value::map())?;
    let instance = instance_path(&self.nodename, path);
    guard.setnx(&instance, Value::map())?;
    Ok(instance)
  }

  /// Replaces the local instance status document of `path`, keeping its monitor record.
  pub fn post_instance_status(&self, path: &str, status: Value) -> Result<(), StateError> {
    let entries = match status {
      Value::Map(m) => m,
      other => {
        return Err(StateError::Data(DataError::TypeMismatch {
          path: instance_path(&self.nodename, path),
          expected: "map",
          found: other.kind(),
        }))
      }
    };
    let mut guard = self.data.lock();
    let instance = self.ensure_instance(&mut guard, path)?;
    let old_keys = guard
      .get(&instance)?
      .as_map()
      .map(|m| m.keys().cloned().collect::<Vec<_>>())
      .unwrap_or_default();
    for key in old_keys {
      if key != "monitor" && !entries.contains_key(&key) {
        guard.unset(&instance.child(key))?;
      }
    }
    let entries = entries.without("monitor");
    guard.merge(&instance, entries)?;
    Ok(())
  }

  /// Publishes the orchestration configuration of a local service. An invalid configuration is
  /// refused with its reason.
  pub fn post_service_config(&self, path: &str, config: Value) -> Result<(), StateError> {
    let cfg: ServiceConfig = config.decode().map_err(|e| ConfigError::Service {
      path: path.to_string(),
      reason: e.to_string(),
    })?;
    cfg.validate().map_err(|e| ConfigError::Service {
      path: path.to_string(),
      reason: e.to_string(),
    })?;
    let mut guard = self.data.lock();
    let node = node_path(&self.nodename);
    guard.setnx(&node.child("services"), Value::map())?;
    guard.setnx(&node.child("services").child("config"), Value::map())?;
    guard.set(&service_config_path(&self.nodename, path), config)?;
    debug!(%path, "service configuration posted");
    self.wake();
    Ok(())
  }

  /// Drops a service from the local service set. Its instance record goes away at the next tick.
  pub fn remove_service(&self, path: &str) -> Result<(), StateError> {
    self.data.unset_safe(&service_config_path(&self.nodename, path))?;
    self.wake();
    Ok(())
  }

  /// Freezes (timestamp `at`) or thaws the local node.
  pub fn set_frozen(&self, frozen: bool, at: f64) -> Result<(), StateError> {
    let value = if frozen { Value::from(at) } else { Value::from(0.0) };
    let path = node_path(&self.nodename).child("frozen");
    let mut guard = self.data.lock();
    let was = guard.get_or(&path, Value::Null).as_f64().unwrap_or(0.0) > 0.0;
    if was != frozen {
      guard.set(&path, value)?;
    }
    Ok(())
  }
}

/// The daemon's answers to process signals: SIGHUP flags the configuration file as changed,
/// SIGTERM and SIGINT stop the daemon the way a `daemon_stop` request does.
pub struct SignalHandler {
  hangup: Signal,
  terminate: Signal,
  interrupt: Signal,
}
impl SignalHandler {
  /// Must run inside a runtime with the IO driver enabled.
  pub fn install() -> std::io::Result<SignalHandler> {
    Ok(SignalHandler {
      hangup: signal(SignalKind::hangup())?,
      terminate: signal(SignalKind::terminate())?,
      interrupt: signal(SignalKind::interrupt())?,
    })
  }

  pub async fn run(mut self, state: Arc<DaemonState>) {
    loop {
      tokio::select! {
        Some(()) = self.hangup.recv() => {
          info!("SIGHUP received, configuration will be reloaded");
          state.notify_config_changed();
        }
        Some(()) = self.terminate.recv() => {
          info!("SIGTERM received, stopping");
          if let Err(e) = state.stop_daemon() {
            warn!(error = %e, "cannot publish maintenance");
          }
        }
        Some(()) = self.interrupt.recv() => {
          info!("SIGINT received, stopping");
          if let Err(e) = state.stop_daemon() {
            warn!(error = %e, "cannot publish maintenance");
          }
        }
        else => break,
      }
    }
  }
}

#[cfg(test)]
fn state() -> DaemonState {
  DaemonState::new(DaemonConfig {
    nodename: "n1".to_string(),
    nodes: vec!["n1".to_string(), "n2".to_string()],
    ..DaemonConfig::default()
  })
}

#[test]
fn test_set_smon_is_idempotent() {
  let state = state();
  let update = SmonUpdate {
    global_expect: Change::Set(ServiceGlobalExpect::Frozen),
    ..SmonUpdate::default()
  };
  assert!(state.set_smon_at("svc", update.clone(), 10.0).unwrap());
  state.data.pop_journal();
  assert!(!state.set_smon_at("svc", update, 11.0).unwrap());
  assert!(state.data.pop_journal().is_empty());
  let smon = state.smon("svc").unwrap();
  assert_eq!(smon.status, ServiceStatus::Idle);
  assert_eq!(smon.global_expect, Some(ServiceGlobalExpect::Frozen));

  let update = SmonUpdate {
    status: Some(ServiceStatus::StartFailed),
    global_expect: Change::Clear,
    ..SmonUpdate::default()
  };
  assert!(state.set_smon_at("svc", update, 12.0).unwrap());
  let smon = state.smon("svc").unwrap();
  assert_eq!((smon.status, smon.status_updated), (ServiceStatus::StartFailed, 12.0));
  assert_eq!(smon.global_expect, None);
}

#[test]
fn test_set_nmon_tracks_status_updated() {
  let state = state();
  assert_eq!(state.nmon().status, NodeStatus::Init);
  let update = NmonUpdate {
    status: Some(NodeStatus::Idle),
    ..NmonUpdate::default()
  };
  assert!(state.set_nmon_at(update.clone(), 5.0).unwrap());
  assert!(!state.set_nmon_at(update, 6.0).unwrap());
  let nmon = state.nmon();
  assert_eq!((nmon.status, nmon.status_updated), (NodeStatus::Idle, 5.0));
}

#[test]
fn test_post_instance_status_keeps_monitor() {
  let state = state();
  state
    .set_smon_at(
      "svc",
      SmonUpdate {
        local_expect: Change::Set(ServiceLocalExpect::Started),
        ..SmonUpdate::default()
      },
      1.0,
    )
    .unwrap();
  state
    .post_instance_status("svc", vmap! { "avail" => "up", "overall" => "up", "monitor" => vmap! {} })
    .unwrap();
  state.post_instance_status("svc", vmap! { "avail" => "down" }).unwrap();
  let instance = state.data.get(&instance_path("n1", "svc")).unwrap();
  assert_eq!(instance.get("avail"), Some(&Value::from("down")));
  assert!(instance.get("overall").is_none());
  assert_eq!(
    state.smon("svc").unwrap().local_expect,
    Some(ServiceLocalExpect::Started)
  );
  assert!(state.post_instance_status("svc", Value::from(3)).is_err());
}

#[test]
fn test_post_service_config_validates() {
  let state = state();
  let scope = Value::from(vec![Value::from("n1")]);
  state
    .post_service_config("svc", vmap! { "scope" => scope.clone(), "orchestrate" => "ha" })
    .unwrap();
  assert!(state.data.exists(&service_config_path("n1", "svc")));
  assert!(matches!(
    state.post_service_config("bad", vmap! { "scope" => Value::list() }),
    Err(StateError::Config(ConfigError::Service { .. }))
  ));
  state.remove_service("svc").unwrap();
  assert!(!state.data.exists(&service_config_path("n1", "svc")));
}

#[test]
fn test_cluster_nodes_follow_generation() {
  let state = state();
  assert_eq!(state.cluster_nodes(), vec!["n1".to_string(), "n2".to_string()]);
  state.replace_config(DaemonConfig {
    nodename: "other".to_string(),
    nodes: vec!["n3".to_string()],
    ..DaemonConfig::default()
  });
  assert_eq!(state.config().nodename, "n1");
  assert_eq!(state.cluster_nodes(), vec!["n3".to_string(), "n1".to_string()]);
}

#[test]
fn test_reload_on_change_notification() {
  let dir = std::env::temp_dir().join(format!("hamon-reload-{}", std::process::id()));
  std::fs::create_dir_all(&dir).unwrap();
  let file = dir.join("hamon.toml");
  std::fs::write(&file, "nodename = \"n1\"\nnodes = [\"n1\"]\n").unwrap();
  let state = DaemonState::with_config_path(DaemonConfig::load(&file).unwrap(), Some(file.clone()));
  assert!(!state.reload_config().unwrap());
  std::fs::write(&file, "nodename = \"n1\"\nnodes = [\"n1\", \"n2\"]\nmax_start_retries = 2\n")
    .unwrap();
  let gen = state.generation();
  state.notify_config_changed();
  assert!(state.reload_config().unwrap());
  assert_eq!(state.generation(), gen + 1);
  assert_eq!(state.config().max_start_retries, 2);
  assert_eq!(state.cluster_nodes().len(), 2);

  std::fs::write(&file, "nodes = 3").unwrap();
  state.notify_config_changed();
  assert!(state.reload_config().is_err());
  assert_eq!(state.config().max_start_retries, 2);
  let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_monitor_record_changes_wake_the_loop() {
  let state = state();
  let update = SmonUpdate {
    local_expect: Change::Set(crate::cluster::ServiceLocalExpect::Started),
    ..SmonUpdate::default()
  };
  assert!(state.set_smon("svc", update.clone()).unwrap());
  let woken = tokio::time::timeout(std::time::Duration::from_secs(1), state.woken()).await;
  assert!(woken.is_ok());

  assert!(!state.set_smon("svc", update).unwrap());
  let woken = tokio::time::timeout(std::time::Duration::from_millis(50), state.woken()).await;
  assert!(woken.is_err());
}

#[tokio::test]
async fn test_signals_reload_and_stop() {
  let dir = std::env::temp_dir().join(format!("hamon-signals-{}", std::process::id()));
  std::fs::create_dir_all(&dir).unwrap();
  let file = dir.join("hamon.toml");
  std::fs::write(&file, "nodename = \"n1\"\nnodes = [\"n1\"]\n").unwrap();
  let config = DaemonConfig::load(&file).unwrap();
  let state = Arc::new(DaemonState::with_config_path(config, Some(file.clone())));
  let handler = SignalHandler::install().unwrap();
  let task = tokio::spawn(handler.run(state.clone()));

  let changed = "nodename = \"n1\"\nnodes = [\"n1\"]\nmax_start_retries = 4\n";
  std::fs::write(&file, changed).unwrap();
  unsafe { libc::raise(libc::SIGHUP) };
  let reloaded = tokio::time::timeout(std::time::Duration::from_secs(5), async {
    while !state.reload_config().unwrap() {
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
  })
  .await;
  assert!(reloaded.is_ok());
  assert_eq!(state.config().max_start_retries, 4);

  unsafe { libc::raise(libc::SIGTERM) };
  let stopped = tokio::time::timeout(std::time::Duration::from_secs(5), async {
    while !state.stop_requested() {
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
  })
  .await;
  assert!(stopped.is_ok());
  assert_eq!(state.nmon().status, NodeStatus::Maintenance);
  task.abort();
  let _ = std::fs::remove_dir_all(&dir);
}
