use crate::core::{Fragment, Path};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
  #[error("no data at {0}")]
  NotFound(Path),
  #[error("parent of {0} does not exist")]
  PathError(Path),
  #[error("{path} is a {found}, expected a {expected}")]
  TypeMismatch {
    path: Path,
    expected: &'static str,
    found: &'static str,
  },
}

/// Fragments of a patchset that could not be applied. The other fragments of the same patchset
/// were applied.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{} of {total} patch fragments failed under {base}", .failures.len())]
pub struct PatchError {
  pub base: Path,
  pub total: usize,
  pub failures: Vec<(Fragment, DataError)>,
}
