//! `hamon` is the core of a high-availability cluster daemon. Every node runs one; together they
//! keep each clustered service running on the right nodes without a central coordinator.
//!
//! Nodes share a tree of data ([`core`]) in which each node owns one blob. Local changes are
//! journaled and shipped to peers as patches ([`cluster`]). From a snapshot of that tree, every
//! node runs the same deterministic state machines ([`monitor`]) and only acts on its own
//! service instances, so two nodes looking at the same data never both decide to start a
//! failover service.

pub mod cluster;
pub mod core;
pub mod daemon;
pub mod listener;
pub mod monitor;
pub mod testkit;
