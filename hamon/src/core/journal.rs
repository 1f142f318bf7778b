use crate::core::diff::{self, diff, lookup, prune};
use crate::core::{DataError, DataView, Fragment, PatchError, Path, Value};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Selects the part of the tree whose diffs are kept for replication.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalConfig {
  /// Diffs under this path are queued, re-rooted so that `head` becomes the root.
  pub head: Path,
  /// Paths relative to `head` that are mutated locally but never queued.
  pub exclude: Vec<Path>,
}

struct Inner {
  data: Value,
  journal: Option<JournalConfig>,
  queue: Vec<Fragment>,
}

/// A mutable tree shared by every daemon thread.
///
/// Each mutation computes its structural diff while holding the lock, so nobody can observe a
/// new value before its diff is queued. Compound mutations hold a [`JournalGuard`] from
/// [`JournaledData::lock`] for their whole duration; the single-operation methods on this type
/// take and release the lock themselves.
pub struct JournaledData {
  inner: Mutex<Inner>,
}
impl JournaledData {
  pub fn new(initial: Value, journal: Option<JournalConfig>) -> JournaledData {
    JournaledData {
      inner: Mutex::new(Inner {
        data: initial,
        journal: journal,
        queue: Vec::new(),
      }),
    }
  }

  pub fn lock(&self) -> JournalGuard<'_> {
    JournalGuard {
      inner: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
    }
  }

  /// A point-in-time copy of the whole tree.
  pub fn snapshot(&self) -> Value {
    self.lock().inner.data.clone()
  }

  pub fn journal_config(&self) -> Option<JournalConfig> {
    self.lock().inner.journal.clone()
  }

  pub fn get(&self, path: &Path) -> Result<Value, DataError> {
    self.lock().get(path)
  }

  pub fn get_or(&self, path: &Path, default: Value) -> Value {
    self.lock().get_or(path, default)
  }

  pub fn exists(&self, path: &Path) -> bool {
    self.lock().exists(path)
  }

  pub fn set(&self, path: &Path, value: Value) -> Result<Vec<Fragment>, DataError> {
    self.lock().set(path, value)
  }

  pub fn setnx(&self, path: &Path, value: Value) -> Result<Vec<Fragment>, DataError> {
    self.lock().setnx(path, value)
  }

  pub fn merge(
    &self,
    path: &Path,
    entries: im::OrdMap<String, Value>,
  ) -> Result<Vec<Fragment>, DataError> {
    self.lock().merge(path, entries)
  }

  pub fn unset(&self, path: &Path) -> Result<Vec<Fragment>, DataError> {
    self.lock().unset(path)
  }

  pub fn unset_safe(&self, path: &Path) -> Result<Vec<Fragment>, DataError> {
    self.lock().unset_safe(path)
  }

  pub fn patch(&self, base: &Path, patchset: &[Fragment]) -> Result<(), PatchError> {
    self.lock().patch(base, patchset)
  }

  pub fn inc(&self, path: &Path) -> Result<i64, DataError> {
    self.lock().inc(path)
  }

  /// Takes every queued journal fragment, oldest first.
  pub fn pop_journal(&self) -> Vec<Fragment> {
    self.lock().pop_journal()
  }

  /// A lens exposing the same operations relative to `base`.
  pub fn view(&self, base: Path) -> DataView<'_> {
    DataView::new(self, base)
  }
}

/// Exclusive access to a [`JournaledData`] for compound mutations.
pub struct JournalGuard<'a> {
  inner: MutexGuard<'a, Inner>,
}
impl<'a> JournalGuard<'a> {
  pub fn data(&self) -> &Value {
    &self.inner.data
  }

  pub fn get(&self, path: &Path) -> Result<Value, DataError> {
    lookup(&self.inner.data, path)
      .cloned()
      .ok_or_else(|| DataError::NotFound(path.clone()))
  }

  pub fn get_or(&self, path: &Path, default: Value) -> Value {
    lookup(&self.inner.data, path).cloned().unwrap_or(default)
  }

  pub fn exists(&self, path: &Path) -> bool {
    lookup(&self.inner.data, path).is_some()
  }

  pub fn set(&mut self, path: &Path, value: Value) -> Result<Vec<Fragment>, DataError> {
    let old = lookup(&self.inner.data, path).cloned();
    diff::store(&mut self.inner.data, path, value.clone())?;
    let frags = diff(path, old.as_ref(), Some(&value));
    self.record(&frags);
    Ok(frags)
  }

  /// Sets `path` only if nothing is stored there yet.
  pub fn setnx(&mut self, path: &Path, value: Value) -> Result<Vec<Fragment>, DataError> {
    if self.exists(path) {
      Ok(Vec::new())
    } else {
      self.set(path, value)
    }
  }

  /// Shallow per-key set of `entries` under `path`, creating an empty mapping at `path` first
  /// if needed.
  pub fn merge(
    &mut self,
    path: &Path,
    entries: im::OrdMap<String, Value>,
  ) -> Result<Vec<Fragment>, DataError> {
    let mut frags = self.setnx(path, Value::map())?;
    for (k, v) in entries.into_iter() {
      frags.extend(self.set(&path.child(k), v)?);
    }
    Ok(frags)
  }

  pub fn unset(&mut self, path: &Path) -> Result<Vec<Fragment>, DataError> {
    let old = diff::remove(&mut self.inner.data, path)?;
    let frags = diff(path, Some(&old), None);
    self.record(&frags);
    Ok(frags)
  }

  pub fn unset_safe(&mut self, path: &Path) -> Result<Vec<Fragment>, DataError> {
    match self.unset(path) {
      Err(DataError::NotFound(_)) => Ok(Vec::new()),
      other => other,
    }
  }

  /// Replays fragments computed elsewhere, relative to `base`, without diffing and without
  /// journaling them. Every fragment is attempted even if an earlier one fails.
  pub fn patch(&mut self, base: &Path, patchset: &[Fragment]) -> Result<(), PatchError> {
    let mut failures = Vec::new();
    for frag in patchset {
      if let Err(e) = diff::apply(&mut self.inner.data, &frag.rebase(base)) {
        failures.push((frag.clone(), e));
      }
    }
    if failures.is_empty() {
      Ok(())
    } else {
      Err(PatchError {
        base: base.clone(),
        total: patchset.len(),
        failures: failures,
      })
    }
  }

  /// Increments the integer at `path`, initializing it to 1 when absent.
  pub fn inc(&mut self, path: &Path) -> Result<i64, DataError> {
    let next = match lookup(&self.inner.data, path) {
      None => 1,
      Some(v) => {
        v.as_i64().ok_or_else(|| DataError::TypeMismatch {
          path: path.clone(),
          expected: "int",
          found: v.kind(),
        })? + 1
      }
    };
    self.set(path, Value::Int(next))?;
    Ok(next)
  }

  pub fn pop_journal(&mut self) -> Vec<Fragment> {
    std::mem::take(&mut self.inner.queue)
  }

  /// The current content of the journal head with excluded paths removed, as a peer would
  /// rebuild it from the journal.
  pub fn journal_head(&self) -> Option<Value> {
    let cfg = self.inner.journal.as_ref()?;
    lookup(&self.inner.data, &cfg.head).map(|v| prune(v, &cfg.exclude))
  }

  fn record(&mut self, frags: &[Fragment]) {
    let inner = &mut *self.inner;
    let cfg = match &inner.journal {
      Some(cfg) => cfg,
      None => return,
    };
    for frag in frags {
      if let Some(rel) = frag.path.strip_prefix(&cfg.head) {
        if cfg.exclude.iter().any(|ex| rel.starts_with(ex)) {
          continue;
        }
        let value = frag.value.as_ref().map(|v| prune_below(v, &rel, &cfg.exclude));
        inner.queue.push(Fragment {
          path: rel,
          value: value,
        });
      } else if let Some(below) = cfg.head.strip_prefix(&frag.path) {
        // An ancestor of the head was replaced as a whole.
        let value = frag.value.as_ref().and_then(|v| lookup(v, &below));
        inner.queue.push(match value {
          Some(v) => Fragment::set(Path::root(), prune(v, &cfg.exclude)),
          None => Fragment::unset(Path::root()),
        });
      }
    }
  }
}

/// Drops the excluded paths that fall under a value stored at `at` (relative to the head).
fn prune_below(value: &Value, at: &Path, excludes: &[Path]) -> Value {
  let inner = excludes
    .iter()
    .filter_map(|ex| ex.strip_prefix(at))
    .filter(|p| !p.is_root())
    .collect::<Vec<_>>();
  if inner.is_empty() {
    value.clone()
  } else {
    prune(value, &inner)
  }
}

#[cfg(test)]
use crate::{path, vmap};
#[cfg(test)]
use rand::{rngs::SmallRng, Rng, SeedableRng};

#[cfg(test)]
fn journaled() -> JournaledData {
  JournaledData::new(
    vmap! { "cluster" => vmap! { "nodes" => vmap! { "n1" => vmap! {} } } },
    Some(JournalConfig {
      head: path!["cluster", "nodes", "n1"],
      exclude: vec![path!["stats"]],
    }),
  )
}

#[test]
fn test_get_and_defaults() {
  let data = journaled();
  assert!(data.get(&path!["cluster", "nodes", "n1"]).is_ok());
  assert_eq!(
    data.get(&path!["cluster", "nodes", "n2"]),
    Err(DataError::NotFound(path!["cluster", "nodes", "n2"]))
  );
  assert_eq!(data.get_or(&path!["nope"], Value::from(3)), Value::from(3));
}

#[test]
fn test_set_requires_parent_and_setnx_builds_it() {
  let data = journaled();
  let deep = path!["cluster", "nodes", "n1", "services", "status"];
  assert_eq!(data.set(&deep, Value::map()), Err(DataError::PathError(deep.clone())));
  data.setnx(&path!["cluster", "nodes", "n1", "services"], Value::map()).unwrap();
  assert!(data.set(&deep, Value::map()).is_ok());
  assert_eq!(data.setnx(&deep, Value::from(1)).unwrap(), vec![]);
}

#[test]
fn test_unset_and_unset_safe() {
  let data = journaled();
  let p = path!["cluster", "nodes", "n1", "x"];
  assert_eq!(data.unset(&p), Err(DataError::NotFound(p.clone())));
  assert_eq!(data.unset_safe(&p), Ok(vec![]));
  data.set(&p, Value::from(1)).unwrap();
  assert_eq!(data.unset(&p).unwrap(), vec![Fragment::unset(p.clone())]);
}

#[test]
fn test_journal_reroots_and_excludes() {
  let data = journaled();
  data.set(&path!["cluster", "nodes", "n1", "monitor"], vmap! { "status" => "idle" }).unwrap();
  data.set(&path!["cluster", "nodes", "n1", "stats"], vmap! { "load" => 1.5 }).unwrap();
  data.set(&path!["cluster", "nodes", "n2"], vmap! { "monitor" => vmap! {} }).unwrap();
  data.inc(&path!["cluster", "nodes", "n1", "gen"]).unwrap();
  assert_eq!(
    data.pop_journal(),
    vec![
      Fragment::set(path!["monitor"], vmap! { "status" => "idle" }),
      Fragment::set(path!["gen"], Value::from(1)),
    ]
  );
  assert!(data.pop_journal().is_empty());
}

#[test]
fn test_journal_prunes_excludes_inside_values() {
  let data = journaled();
  data
    .set(&path!["cluster", "nodes", "n1"], vmap! { "stats" => vmap! { "load" => 2 }, "a" => 1 })
    .unwrap();
  assert_eq!(data.pop_journal(), vec![Fragment::set(path!["a"], Value::from(1))]);
  data.set(&path!["cluster"], vmap! { "nodes" => vmap! { "n1" => vmap! { "b" => 2 } } }).unwrap();
  assert_eq!(
    data.pop_journal(),
    vec![Fragment::unset(path!["a"]), Fragment::set(path!["b"], Value::from(2))]
  );
}

#[test]
fn test_patch_is_not_journaled_and_reports_failures() {
  let data = journaled();
  let base = path!["cluster", "nodes", "n1"];
  let patch = vec![
    Fragment::set(path!["a"], Value::from(1)),
    Fragment::set(path!["missing", "b"], Value::from(2)),
    Fragment::set(path!["c"], Value::from(3)),
  ];
  let err = data.patch(&base, &patch).unwrap_err();
  assert_eq!(err.total, 3);
  assert_eq!(err.failures.len(), 1);
  assert_eq!(err.failures[0].0, patch[1]);
  assert_eq!(data.get(&base.child("a")), Ok(Value::from(1)));
  assert_eq!(data.get(&base.child("c")), Ok(Value::from(3)));
  assert!(data.pop_journal().is_empty());
}

#[test]
fn test_inc() {
  let data = journaled();
  let p = path!["cluster", "nodes", "n1", "restart"];
  assert_eq!(data.inc(&p), Ok(1));
  assert_eq!(data.inc(&p), Ok(2));
  data.set(&p, Value::from("x")).unwrap();
  assert!(matches!(data.inc(&p), Err(DataError::TypeMismatch { .. })));
}

#[test]
fn test_merge_creates_mapping() {
  let data = journaled();
  let p = path!["cluster", "nodes", "n1", "labels"];
  let mut entries = im::OrdMap::new();
  entries.insert("az".to_string(), Value::from("a"));
  entries.insert("rack".to_string(), Value::from(4));
  data.merge(&p, entries).unwrap();
  assert_eq!(data.get(&p), Ok(vmap! { "az" => "a", "rack" => 4 }));
}

#[cfg(test)]
fn random_value(rng: &mut SmallRng, depth: u32) -> Value {
  match rng.gen_range(0..if depth == 0 { 3 } else { 5 }) {
    0 => Value::from(rng.gen_range(0..4) as i64),
    1 => Value::from(["a", "b", "c"][rng.gen_range(0..3)]),
    2 => Value::Null,
    3 => Value::List((0..rng.gen_range(0..4)).map(|_| random_value(rng, depth - 1)).collect()),
    _ => {
      let mut m = im::OrdMap::new();
      for _ in 0..rng.gen_range(0..4) {
        m.insert(["k", "l", "m", "n"][rng.gen_range(0..4)].to_string(), random_value(rng, depth - 1));
      }
      Value::Map(m)
    }
  }
}

#[test]
fn test_journal_replay_reproduces_data() {
  let mut rng = SmallRng::seed_from_u64(42);
  let data = journaled();
  let head = path!["cluster", "nodes", "n1"];
  for round in 0..50 {
    let copy = data.lock().journal_head().unwrap();
    for _ in 0..5 {
      let key = ["k", "l", "m", "n"][rng.gen_range(0..4)];
      let target = head.child(key);
      match rng.gen_range(0..4) {
        0 => {
          data.unset_safe(&target).unwrap();
        }
        1 => {
          data.inc(&head.child("counter")).unwrap();
        }
        _ => {
          data.set(&target, random_value(&mut rng, 3)).unwrap();
        }
      }
    }
    let mut replayed = copy;
    for frag in data.pop_journal() {
      diff::apply(&mut replayed, &frag).unwrap();
    }
    assert_eq!(Some(replayed), data.lock().journal_head(), "round {}", round);
  }
}
