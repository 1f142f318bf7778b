use crate::cluster::Avail;
use crate::core::Value;
use crate::monitor::{Action, ActionHandle, ActionKind, LaunchError, Launcher};
use crate::monitor::{StatusError, StatusSource};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

type Effect = Arc<dyn Fn(&Action, i32) + Send + Sync>;

#[derive(Default)]
struct LauncherState {
  launched: Vec<Action>,
  codes: BTreeMap<(String, ActionKind), VecDeque<i32>>,
  held: bool,
  refuse: bool,
  effects: Vec<Effect>,
}

/// A [`Launcher`] whose actions exit with scripted codes (0 unless told otherwise) on their first
/// poll. Exit effects let a test play the part of the resource drivers.
#[derive(Clone, Default)]
pub struct FakeLauncher {
  state: Arc<Mutex<LauncherState>>,
}
impl FakeLauncher {
  pub fn new() -> FakeLauncher {
    FakeLauncher::default()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, LauncherState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Exit codes of the next `kind` actions on `path`, in launch order.
  pub fn script(&self, path: &str, kind: ActionKind, codes: &[i32]) {
    self
      .lock()
      .codes
      .entry((path.to_string(), kind))
      .or_default()
      .extend(codes.iter().copied());
  }

  /// While held, running actions never complete.
  pub fn hold(&self, held: bool) {
    self.lock().held = held;
  }

  /// Makes every launch fail as if the action command were missing.
  pub fn refuse(&self, refuse: bool) {
    self.lock().refuse = refuse;
  }

  /// Runs `effect` with the action and its exit code whenever an action completes.
  pub fn on_exit<F>(&self, effect: F)
  where
    F: Fn(&Action, i32) + Send + Sync + 'static,
  {
    self.lock().effects.push(Arc::new(effect));
  }

  pub fn launched(&self) -> Vec<Action> {
    self.lock().launched.clone()
  }

  pub fn count(&self, path: &str, kind: ActionKind) -> usize {
    self
      .lock()
      .launched
      .iter()
      .filter(|a| a.path == path && a.kind == kind)
      .count()
  }
}
impl Launcher for FakeLauncher {
  fn launch(&self, action: &Action) -> Result<Box<dyn ActionHandle>, LaunchError> {
    let mut state = self.lock();
    if state.refuse {
      return Err(LaunchError::NotFound(PathBuf::from("fake")));
    }
    state.launched.push(action.clone());
    let code = state
      .codes
      .get_mut(&(action.path.clone(), action.kind))
      .and_then(|q| q.pop_front())
      .unwrap_or(0);
    Ok(Box::new(FakeHandle {
      action: action.clone(),
      code: code,
      done: None,
      state: self.state.clone(),
    }))
  }
}

struct FakeHandle {
  action: Action,
  code: i32,
  done: Option<i32>,
  state: Arc<Mutex<LauncherState>>,
}
impl FakeHandle {
  fn finish(&mut self, code: i32) -> i32 {
    if let Some(code) = self.done {
      return code;
    }
    self.done = Some(code);
    let effects = self
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .effects
      .clone();
    for effect in effects {
      effect(&self.action, code);
    }
    code
  }
}
impl ActionHandle for FakeHandle {
  fn poll(&mut self) -> Option<i32> {
    if self.done.is_some() {
      return self.done;
    }
    if self.state.lock().unwrap_or_else(PoisonError::into_inner).held {
      return None;
    }
    Some(self.finish(self.code))
  }

  fn pid(&self) -> Option<u32> {
    None
  }

  fn terminate(&mut self) {
    self.finish(143);
  }

  fn kill(&mut self) {
    self.finish(137);
  }
}

/// Instance status documents kept in memory.
#[derive(Clone, Default)]
pub struct MemoryStatusSource {
  docs: Arc<Mutex<BTreeMap<String, Value>>>,
}
impl MemoryStatusSource {
  pub fn new() -> MemoryStatusSource {
    MemoryStatusSource::default()
  }

  pub fn set(&self, path: &str, doc: Value) {
    self
      .docs
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(path.to_string(), doc);
  }

  /// Changes the `avail` and `overall` keys of a document, creating it if needed.
  pub fn set_avail(&self, path: &str, avail: Avail) {
    let mut docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
    let mut doc = match docs.get(path).and_then(Value::as_map) {
      Some(m) => m.clone(),
      None => im::OrdMap::new(),
    };
    doc.insert("avail".to_string(), Value::from(avail.as_str()));
    doc.insert("overall".to_string(), Value::from(avail.as_str()));
    docs.insert(path.to_string(), Value::Map(doc));
  }

  pub fn remove(&self, path: &str) {
    self.docs.lock().unwrap_or_else(PoisonError::into_inner).remove(path);
  }
}
impl StatusSource for MemoryStatusSource {
  fn read(&self, path: &str) -> Result<Option<Value>, StatusError> {
    Ok(self.docs.lock().unwrap_or_else(PoisonError::into_inner).get(path).cloned())
  }
}

#[test]
fn test_fake_launcher_script_and_effects() {
  let launcher = FakeLauncher::new();
  let source = MemoryStatusSource::new();
  let effect_source = source.clone();
  launcher.on_exit(move |action, code| {
    if action.kind == ActionKind::Start && code == 0 {
      effect_source.set_avail(&action.path, Avail::Up);
    }
  });
  launcher.script("svc", ActionKind::Start, &[1]);
  let mut first = launcher.launch(&Action::new("svc", ActionKind::Start)).unwrap();
  assert_eq!(first.poll(), Some(1));
  assert!(source.read("svc").unwrap().is_none());

  launcher.hold(true);
  let mut second = launcher.launch(&Action::new("svc", ActionKind::Start)).unwrap();
  assert_eq!(second.poll(), None);
  launcher.hold(false);
  assert_eq!(second.poll(), Some(0));
  assert_eq!(second.poll(), Some(0));
  let doc = source.read("svc").unwrap().unwrap();
  assert_eq!(doc.get("avail").and_then(Value::as_str), Some("up"));
  assert_eq!(launcher.count("svc", ActionKind::Start), 2);

  launcher.refuse(true);
  assert!(launcher.launch(&Action::new("svc", ActionKind::Stop)).is_err());
  assert_eq!(launcher.launched().len(), 2);
}
