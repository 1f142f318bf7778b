use crate::core::{DataError, Fragment, JournaledData, PatchError, Path, Value};

/// A [`JournaledData`] bound to a sub-tree: every path handed to it is relative to `base`.
#[derive(Clone)]
pub struct DataView<'a> {
  data: &'a JournaledData,
  base: Path,
}
impl<'a> DataView<'a> {
  pub(in crate::core) fn new(data: &'a JournaledData, base: Path) -> DataView<'a> {
    DataView {
      data: data,
      base: base,
    }
  }

  pub fn base(&self) -> &Path {
    &self.base
  }

  pub fn view(&self, sub: &Path) -> DataView<'a> {
    DataView {
      data: self.data,
      base: self.base.join(sub),
    }
  }

  pub fn get(&self, path: &Path) -> Result<Value, DataError> {
    self.data.get(&self.base.join(path))
  }

  pub fn get_or(&self, path: &Path, default: Value) -> Value {
    self.data.get_or(&self.base.join(path), default)
  }

  pub fn exists(&self, path: &Path) -> bool {
    self.data.exists(&self.base.join(path))
  }

  pub fn set(&self, path: &Path, value: Value) -> Result<Vec<Fragment>, DataError> {
    self.data.set(&self.base.join(path), value)
  }

  pub fn setnx(&self, path: &Path, value: Value) -> Result<Vec<Fragment>, DataError> {
    self.data.setnx(&self.base.join(path), value)
  }

  pub fn merge(
    &self,
    path: &Path,
    entries: im::OrdMap<String, Value>,
  ) -> Result<Vec<Fragment>, DataError> {
    self.data.merge(&self.base.join(path), entries)
  }

  pub fn unset(&self, path: &Path) -> Result<Vec<Fragment>, DataError> {
    self.data.unset(&self.base.join(path))
  }

  pub fn unset_safe(&self, path: &Path) -> Result<Vec<Fragment>, DataError> {
    self.data.unset_safe(&self.base.join(path))
  }

  pub fn patch(&self, path: &Path, patchset: &[Fragment]) -> Result<(), PatchError> {
    self.data.patch(&self.base.join(path), patchset)
  }

  pub fn inc(&self, path: &Path) -> Result<i64, DataError> {
    self.data.inc(&self.base.join(path))
  }
}

#[cfg(test)]
use crate::{path, vmap};

#[test]
fn test_view_is_relative() {
  let data = JournaledData::new(vmap! { "a" => vmap! { "b" => vmap! {} } }, None);
  let view = data.view(path!["a"]);
  let inner = view.view(&path!["b"]);
  inner.set(&path!["c"], Value::from(1)).unwrap();
  assert_eq!(data.get(&path!["a", "b", "c"]), Ok(Value::from(1)));
  assert_eq!(view.get(&path!["b", "c"]), Ok(Value::from(1)));
  assert_eq!(inner.inc(&path!["c"]), Ok(2));
  inner.unset(&path!["c"]).unwrap();
  assert!(!view.exists(&path!["b", "c"]));
}
