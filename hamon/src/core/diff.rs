use crate::core::{DataError, Path, Segment, Value};
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// One element of a diff: the value now stored at `path`, or `None` when the node was removed.
///
/// On the wire a fragment is `[path, value]` for a set and `[path]` for a removal, so a stored
/// `null` and a removal stay distinguishable.
#[derive(Clone, Debug, PartialEq)]
pub struct Fragment {
  pub path: Path,
  pub value: Option<Value>,
}
impl Fragment {
  pub fn set(path: Path, value: Value) -> Fragment {
    Fragment {
      path: path,
      value: Some(value),
    }
  }

  pub fn unset(path: Path) -> Fragment {
    Fragment {
      path: path,
      value: None,
    }
  }

  /// The same change expressed relative to `base`.
  pub fn rebase(&self, base: &Path) -> Fragment {
    Fragment {
      path: base.join(&self.path),
      value: self.value.clone(),
    }
  }
}
impl Serialize for Fragment {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let len = if self.value.is_some() { 2 } else { 1 };
    let mut seq = serializer.serialize_seq(Some(len))?;
    seq.serialize_element(&self.path)?;
    if let Some(v) = &self.value {
      seq.serialize_element(v)?;
    }
    seq.end()
  }
}
impl<'de> Deserialize<'de> for Fragment {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    struct FragmentVisitor;
    impl<'de> Visitor<'de> for FragmentVisitor {
      type Value = Fragment;

      fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a [path] or [path, value] sequence")
      }

      fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Fragment, A::Error> {
        let path: Path = seq
          .next_element()?
          .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let value: Option<Value> = seq.next_element()?;
        if seq.next_element::<de::IgnoredAny>()?.is_some() {
          return Err(de::Error::invalid_length(3, &self));
        }
        Ok(Fragment {
          path: path,
          value: value,
        })
      }
    }
    deserializer.deserialize_seq(FragmentVisitor)
  }
}

/// Structural diff of the node at `path` going from `old` to `new`.
///
/// Mappings are compared key by key, sequences index by index with appended items emitted as
/// sets at the next index and dropped items emitted as removals from the tail down. Anything
/// else that changed is emitted as a single set of the whole node.
pub fn diff(path: &Path, old: Option<&Value>, new: Option<&Value>) -> Vec<Fragment> {
  let mut out = Vec::new();
  diff_into(path, old, new, &mut out);
  out
}

fn diff_into(path: &Path, old: Option<&Value>, new: Option<&Value>, out: &mut Vec<Fragment>) {
  match (old, new) {
    (None, None) => {}
    (Some(_), None) => out.push(Fragment::unset(path.clone())),
    (None, Some(n)) => out.push(Fragment::set(path.clone(), n.clone())),
    (Some(Value::Map(o)), Some(Value::Map(n))) => {
      if o.ptr_eq(n) {
        return;
      }
      for (k, _) in o.iter().filter(|(k, _)| !n.contains_key(*k)) {
        out.push(Fragment::unset(path.child(k)));
      }
      for (k, nv) in n.iter() {
        diff_into(&path.child(k), o.get(k), Some(nv), out);
      }
    }
    (Some(Value::List(o)), Some(Value::List(n))) => {
      if o.ptr_eq(n) {
        return;
      }
      let common = std::cmp::min(o.len(), n.len());
      for i in 0..common {
        diff_into(&path.child(i), o.get(i), n.get(i), out);
      }
      for i in common..n.len() {
        if let Some(nv) = n.get(i) {
          out.push(Fragment::set(path.child(i), nv.clone()));
        }
      }
      for i in (common..o.len()).rev() {
        out.push(Fragment::unset(path.child(i)));
      }
    }
    (Some(o), Some(n)) => {
      if o != n {
        out.push(Fragment::set(path.clone(), n.clone()));
      }
    }
  }
}

/// Finds the node at `path` below `root`.
pub fn lookup<'a>(root: &'a Value, path: &Path) -> Option<&'a Value> {
  let mut cur = root;
  for seg in path.segments() {
    cur = match (cur, seg) {
      (Value::Map(m), Segment::Key(k)) => m.get(k)?,
      (Value::List(l), Segment::Index(i)) => l.get(*i)?,
      _ => return None,
    };
  }
  Some(cur)
}

fn lookup_mut<'a>(root: &'a mut Value, path: &Path) -> Result<&'a mut Value, DataError> {
  let mut cur = root;
  for (depth, seg) in path.segments().iter().enumerate() {
    let here = || path.segments()[..=depth].iter().cloned().collect::<Path>();
    cur = match (cur, seg) {
      (Value::Map(m), Segment::Key(k)) => m.get_mut(k).ok_or_else(|| DataError::NotFound(here()))?,
      (Value::List(l), Segment::Index(i)) => {
        l.get_mut(*i).ok_or_else(|| DataError::NotFound(here()))?
      }
      (other, _) => {
        return Err(DataError::TypeMismatch {
          path: here(),
          expected: container_for(seg),
          found: other.kind(),
        })
      }
    };
  }
  Ok(cur)
}

fn container_for(seg: &Segment) -> &'static str {
  match seg {
    Segment::Key(_) => "map",
    Segment::Index(_) => "list",
  }
}

/// Stores `value` at `path`. The parent must exist; a list index may be one past the end to
/// append.
pub fn store(root: &mut Value, path: &Path, value: Value) -> Result<(), DataError> {
  let (last, parent) = match (path.last(), path.parent()) {
    (Some(last), Some(parent)) => (last, parent),
    _ => {
      *root = value;
      return Ok(());
    }
  };
  let container = lookup_mut(root, &parent).map_err(|e| match e {
    DataError::NotFound(_) => DataError::PathError(path.clone()),
    other => other,
  })?;
  match (container, last) {
    (Value::Map(m), Segment::Key(k)) => {
      m.insert(k.clone(), value);
      Ok(())
    }
    (Value::List(l), Segment::Index(i)) if *i < l.len() => {
      l.set(*i, value);
      Ok(())
    }
    (Value::List(l), Segment::Index(i)) if *i == l.len() => {
      l.push_back(value);
      Ok(())
    }
    (Value::List(_), Segment::Index(_)) => Err(DataError::PathError(path.clone())),
    (other, seg) => Err(DataError::TypeMismatch {
      path: parent,
      expected: container_for(seg),
      found: other.kind(),
    }),
  }
}

/// Removes the node at `path`, returning it.
pub fn remove(root: &mut Value, path: &Path) -> Result<Value, DataError> {
  let (last, parent) = match (path.last(), path.parent()) {
    (Some(last), Some(parent)) => (last, parent),
    _ => return Ok(std::mem::take(root)),
  };
  let not_found = || DataError::NotFound(path.clone());
  let container = lookup_mut(root, &parent).map_err(|e| match e {
    DataError::NotFound(_) => not_found(),
    other => other,
  })?;
  match (container, last) {
    (Value::Map(m), Segment::Key(k)) => m.remove(k).ok_or_else(not_found),
    (Value::List(l), Segment::Index(i)) if *i < l.len() => Ok(l.remove(*i)),
    (Value::List(_), Segment::Index(_)) => Err(not_found()),
    (other, seg) => Err(DataError::TypeMismatch {
      path: parent,
      expected: container_for(seg),
      found: other.kind(),
    }),
  }
}

/// Applies one fragment. Removing something already absent is not an error, so replaying a
/// fragment has no further effect.
pub fn apply(root: &mut Value, frag: &Fragment) -> Result<(), DataError> {
  match &frag.value {
    Some(v) => store(root, &frag.path, v.clone()),
    None => match remove(root, &frag.path) {
      Ok(_) | Err(DataError::NotFound(_)) => Ok(()),
      Err(e) => Err(e),
    },
  }
}

/// A copy of `value` with every node under one of `excludes` dropped.
pub fn prune(value: &Value, excludes: &[Path]) -> Value {
  let mut out = value.clone();
  for ex in excludes {
    let _ = remove(&mut out, ex);
  }
  out
}

#[cfg(test)]
use crate::{path, vmap};

#[cfg(test)]
fn replay(start: &Value, frags: &[Fragment]) -> Value {
  let mut v = start.clone();
  for f in frags {
    apply(&mut v, f).unwrap();
  }
  v
}

#[test]
fn test_diff_maps_key_by_key() {
  let old = vmap! { "a" => 1, "b" => vmap! { "c" => 2, "d" => 3 }, "gone" => true };
  let new = vmap! { "a" => 1, "b" => vmap! { "c" => 5, "d" => 3 }, "e" => "x" };
  let d = diff(&Path::root(), Some(&old), Some(&new));
  assert_eq!(
    d,
    vec![
      Fragment::unset(path!["gone"]),
      Fragment::set(path!["b", "c"], Value::from(5)),
      Fragment::set(path!["e"], Value::from("x")),
    ]
  );
  assert_eq!(replay(&old, &d), new);
}

#[test]
fn test_diff_lists_index_by_index() {
  let old = vmap! { "l" => Value::from(vec![Value::from(1), Value::from(2), Value::from(3)]) };
  let grow = vmap! {
    "l" => Value::from(vec![Value::from(1), Value::from(9), Value::from(3), Value::from(4)])
  };
  let d = diff(&Path::root(), Some(&old), Some(&grow));
  assert_eq!(
    d,
    vec![
      Fragment::set(path!["l", 1usize], Value::from(9)),
      Fragment::set(path!["l", 3usize], Value::from(4)),
    ]
  );
  assert_eq!(replay(&old, &d), grow);

  let shrink = vmap! { "l" => Value::from(vec![Value::from(1)]) };
  let d = diff(&Path::root(), Some(&old), Some(&shrink));
  assert_eq!(
    d,
    vec![Fragment::unset(path!["l", 2usize]), Fragment::unset(path!["l", 1usize])]
  );
  assert_eq!(replay(&old, &d), shrink);
}

#[test]
fn test_diff_type_change_replaces_node() {
  let old = vmap! { "a" => vmap! { "x" => 1 } };
  let new = vmap! { "a" => "flat" };
  let d = diff(&Path::root(), Some(&old), Some(&new));
  assert_eq!(d, vec![Fragment::set(path!["a"], Value::from("flat"))]);
}

#[test]
fn test_fragment_wire_form() {
  let frags = vec![
    Fragment::set(path!["a", "b"], Value::Null),
    Fragment::unset(path!["a", "c"]),
  ];
  let json = serde_json::to_string(&frags).unwrap();
  assert_eq!(json, r#"[[["a","b"],null],[["a","c"]]]"#);
  let back: Vec<Fragment> = serde_json::from_str(&json).unwrap();
  assert_eq!(back, frags);
}

#[test]
fn test_apply_is_idempotent() {
  let start = vmap! { "a" => vmap! { "b" => 1 }, "l" => Value::from(vec![Value::from(1), Value::from(2)]) };
  let patch = vec![
    Fragment::set(path!["a", "c"], Value::from(2)),
    Fragment::unset(path!["a", "b"]),
    Fragment::unset(path!["l", 1usize]),
  ];
  let once = replay(&start, &patch);
  let twice = replay(&once, &patch);
  assert_eq!(once, twice);
}

#[test]
fn test_store_requires_parent() {
  let mut v = vmap! { "a" => vmap! {} };
  assert_eq!(
    store(&mut v, &path!["x", "y"], Value::from(1)),
    Err(DataError::PathError(path!["x", "y"]))
  );
  assert!(store(&mut v, &path!["a", "y"], Value::from(1)).is_ok());
  assert_eq!(remove(&mut v, &path!["a", "zz"]), Err(DataError::NotFound(path!["a", "zz"])));
}
