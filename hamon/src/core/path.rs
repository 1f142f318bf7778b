use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// One step of a [`Path`]: a mapping key or a sequence index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segment {
  Index(usize),
  Key(String),
}
impl From<&str> for Segment {
  fn from(s: &str) -> Self {
    Segment::Key(s.to_string())
  }
}
impl From<String> for Segment {
  fn from(s: String) -> Self {
    Segment::Key(s)
  }
}
impl From<&String> for Segment {
  fn from(s: &String) -> Self {
    Segment::Key(s.clone())
  }
}
impl From<usize> for Segment {
  fn from(i: usize) -> Self {
    Segment::Index(i)
  }
}
impl fmt::Display for Segment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Segment::Index(i) => write!(f, "{}", i),
      Segment::Key(k) => write!(f, "{}", k),
    }
  }
}

/// Address of a node in the shared data tree. The empty path is the root.
///
/// Paths are written as sequences on the wire (`["cluster", "nodes", "n1"]`) because node names
/// and service paths may themselves contain dots.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(SmallVec<[Segment; 6]>);
impl Path {
  pub fn root() -> Path {
    Path(SmallVec::new())
  }

  pub fn is_root(&self) -> bool {
    self.0.is_empty()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn segments(&self) -> &[Segment] {
    &self.0
  }

  /// Returns a new path with `seg` appended.
  pub fn child<S: Into<Segment>>(&self, seg: S) -> Path {
    let mut p = self.clone();
    p.0.push(seg.into());
    p
  }

  pub fn join(&self, other: &Path) -> Path {
    let mut p = self.clone();
    p.0.extend(other.0.iter().cloned());
    p
  }

  pub fn parent(&self) -> Option<Path> {
    match self.0.split_last() {
      Some((_, init)) => Some(Path(init.iter().cloned().collect())),
      None => None,
    }
  }

  pub fn last(&self) -> Option<&Segment> {
    self.0.last()
  }

  pub fn starts_with(&self, prefix: &Path) -> bool {
    self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
  }

  /// The remainder of this path below `prefix`, if `prefix` is an ancestor (or equal).
  pub fn strip_prefix(&self, prefix: &Path) -> Option<Path> {
    if self.starts_with(prefix) {
      Some(Path(self.0[prefix.0.len()..].iter().cloned().collect()))
    } else {
      None
    }
  }
}
impl fmt::Display for Path {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.0.is_empty() {
      return write!(f, "<root>");
    }
    let mut first = true;
    for seg in self.0.iter() {
      if !first {
        write!(f, ".")?;
      }
      first = false;
      write!(f, "{}", seg)?;
    }
    Ok(())
  }
}
impl<S: Into<Segment>> FromIterator<S> for Path {
  fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
    Path(iter.into_iter().map(Into::into).collect())
  }
}

/// Builds a [`Path`] from keys and indices.
#[macro_export]
macro_rules! path {
  () => { $crate::core::Path::root() };
  ($($seg:expr),+ $(,)?) => {{
    let mut p = $crate::core::Path::root();
    $( p = p.child($seg); )+
    p
  }};
}

#[test]
fn test_path_prefixes() {
  let head = path!["cluster", "nodes", "n1"];
  let p = path!["cluster", "nodes", "n1", "services", "status", "svc1"];
  assert!(p.starts_with(&head));
  assert!(!head.starts_with(&p));
  assert_eq!(p.strip_prefix(&head), Some(path!["services", "status", "svc1"]));
  assert_eq!(head.strip_prefix(&head), Some(Path::root()));
  assert_eq!(p.parent().and_then(|x| x.last().cloned()), Some(Segment::from("status")));
  assert_eq!(Path::root().parent(), None);
  assert_eq!(format!("{}", path!["a", 0usize, "b"]), "a.0.b");
}

#[test]
fn test_path_wire_form() {
  let p = path!["nodes", "n1.example.com", 3usize];
  let json = serde_json::to_string(&p).unwrap();
  assert_eq!(json, r#"["nodes","n1.example.com",3]"#);
  let back: Path = serde_json::from_str(&json).unwrap();
  assert_eq!(back, p);
}
