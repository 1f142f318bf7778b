//! What a node knows about the cluster: the decoded per-node blobs, who is alive, and how
//! patches travel between nodes.
//!
//! ### Node blobs
//! Every node owns one blob under `cluster.nodes.<nodename>` of the shared data. It holds the
//! node monitor record, labels, the freeze timestamp, and per-service configuration and instance
//! status (`services.config.<path>`, `services.status.<path>`). The service monitor record of an
//! instance lives inside its status, under `monitor`. Only the local node writes its own blob;
//! peer blobs are replayed from the patches their owners publish.
//!
//! ### Liveness and staleness
//! Heartbeat transports report beats to a [`HeartbeatRegistry`], which runs a phi accrual
//! failure detector per (heartbeat, peer) pair. A [`ClusterView`] combines a data snapshot with
//! the set of beating peers and hides anything coming from a dead or stale node, so decisions
//! based on it fail closed.
//!
//! ### Replication
//! A [`Publisher`] numbers the local journal into [`PeerMessage`]s. A receiving [`PeerSync`]
//! applies them in order, and refuses anything after a gap or a failed patch until a full
//! message resynchronizes the peer.
//!
//! ### Placement
//! Failover leaders and flex start ranks come from a deterministic order of the service scope
//! (see [`placement`]), filtered by eligibility. Every node computing it from the same inputs
//! gets the same answer.

pub mod data;
mod heartbeat;
mod peer;
pub mod placement;
mod view;

#[rustfmt::skip]
pub use {
  data::Avail,
  data::Change,
  data::NodeData,
  data::NodeGlobalExpect,
  data::NodeLocalExpect,
  data::NodeMonitor,
  data::NodeStatus,
  data::Orchestrate,
  data::Placement,
  data::ResourceStatus,
  data::ServiceConfig,
  data::ServiceGlobalExpect,
  data::ServiceInstanceStatus,
  data::ServiceLocalExpect,
  data::ServiceMonitor,
  data::ServiceStatus,
  data::Topology,
  heartbeat::HeartbeatConfig,
  heartbeat::HeartbeatRegistry,
  heartbeat::IntervalStorage,
  peer::PeerError,
  peer::PeerMessage,
  peer::PeerSync,
  peer::PeerTransport,
  peer::Publisher,
  peer::RxOutcome,
  view::ClusterView,
};
