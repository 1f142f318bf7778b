//! The shared data model: a tree of [`Value`] nodes addressed by [`Path`], mutated through a
//! [`JournaledData`] that turns every change into a list of diff [`Fragment`]s.
//!
//! ### Diffs and the journal
//! `set`, `unset`, `merge` and `inc` compare the previous and new content structurally and
//! return the resulting fragments. When the store is created with a [`JournalConfig`], fragments
//! under the journal head are re-rooted and queued until [`JournaledData::pop_journal`] takes
//! them, which is how local changes get shipped to peers. Excluded sub-paths (high-churn
//! statistics) are still mutated but never queued.
//!
//! `patch` replays fragments produced by someone else. It neither diffs nor journals, so a
//! change received from a peer is never echoed back.
//!
//! ### Snapshots
//! Containers are persistent, so [`JournaledData::snapshot`] hands out a full copy of the tree
//! in constant time. Decision logic always works from such a copy.

pub mod diff;
mod error;
mod journal;
mod path;
mod value;
mod view;

#[rustfmt::skip]
pub use {
  diff::Fragment,
  error::DataError,
  error::PatchError,
  journal::JournalConfig,
  journal::JournalGuard,
  journal::JournaledData,
  path::Path,
  path::Segment,
  value::Value,
  view::DataView,
};
