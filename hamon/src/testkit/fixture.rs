use crate::cluster::data::{empty_node_blob, instance_path, node_path, nodes_path};
use crate::cluster::{Avail, ClusterView, HeartbeatRegistry, NodeStatus, PeerMessage};
use crate::core::diff::{lookup, store};
use crate::core::{Path, Value};
use crate::daemon::DaemonState;
use std::collections::BTreeSet;
use std::time::Duration;

/// Name of the heartbeat fixtures beat on.
pub const FIXTURE_HB: &str = "hb#fixture";

/// A hand-built cluster data tree. Every node starts alive, idle and fresh, and every setter
/// bumps the touched node's `updated` to the fixture clock.
pub struct ClusterFixture {
  local: String,
  nodes: Vec<String>,
  down: BTreeSet<String>,
  now: f64,
  data: Value,
  stale_after: Duration,
  full_id: u64,
}
impl ClusterFixture {
  pub fn new(local: &str, nodes: &[&str]) -> ClusterFixture {
    let mut fx = ClusterFixture {
      local: local.to_string(),
      nodes: nodes.iter().map(|n| n.to_string()).collect(),
      down: BTreeSet::new(),
      now: 1000.0,
      data: Value::map(),
      stale_after: Duration::from_secs(30),
      full_id: 0,
    };
    fx.put(&nodes_path(), Value::map());
    for node in fx.nodes.clone() {
      fx.put(&node_path(&node), empty_node_blob());
      fx.set_node_status(&node, NodeStatus::Idle);
    }
    fx
  }

  pub fn local(&self) -> &str {
    &self.local
  }

  pub fn nodes(&self) -> &[String] {
    &self.nodes
  }

  pub fn now(&self) -> f64 {
    self.now
  }

  /// Moves the clock without refreshing any blob.
  pub fn advance(&mut self, secs: f64) {
    self.now += secs;
  }

  /// Refreshes the `updated` stamp of every blob.
  pub fn touch_all(&mut self) {
    for node in self.nodes.clone() {
      self.touch(&node);
    }
  }

  /// Every fixture node, as a service scope.
  pub fn scope(&self) -> Value {
    Value::from(self.nodes.iter().map(|n| Value::from(n.as_str())).collect::<Vec<_>>())
  }

  fn touch(&mut self, node: &str) {
    let now = self.now;
    let _ = store(&mut self.data, &node_path(node).child("updated"), Value::from(now));
  }

  fn put(&mut self, path: &Path, value: Value) {
    let mut missing = Vec::new();
    let mut p = path.parent();
    while let Some(parent) = p {
      if lookup(&self.data, &parent).is_some() {
        break;
      }
      p = parent.parent();
      missing.push(parent);
    }
    for parent in missing.into_iter().rev() {
      let _ = store(&mut self.data, &parent, Value::map());
    }
    let _ = store(&mut self.data, path, value);
  }

  fn put_node(&mut self, node: &str, rel: Path, value: Value) {
    self.put(&node_path(node).join(&rel), value);
    self.touch(node);
  }

  pub fn node_down(&mut self, node: &str) {
    self.down.insert(node.to_string());
  }

  pub fn node_up(&mut self, node: &str) {
    self.down.remove(node);
  }

  pub fn set_node_status(&mut self, node: &str, status: NodeStatus) {
    let now = self.now;
    let rel = Path::root().child("monitor");
    let mut nmon = lookup(&self.data, &node_path(node).join(&rel))
      .cloned()
      .unwrap_or_else(Value::map);
    if let Value::Map(m) = &mut nmon {
      m.insert("status".to_string(), Value::from(status.as_str()));
      m.insert("status_updated".to_string(), Value::from(now));
    }
    self.put_node(node, rel, nmon);
  }

  pub fn freeze_node(&mut self, node: &str) {
    let now = self.now;
    self.put_node(node, Path::root().child("frozen"), Value::from(now));
  }

  pub fn thaw_node(&mut self, node: &str) {
    self.put_node(node, Path::root().child("frozen"), Value::from(0.0));
  }

  /// Configures `path` on every fixture node.
  pub fn service(&mut self, path: &str, config: Value) {
    for node in self.nodes.clone() {
      self.service_on(&node, path, config.clone());
    }
  }

  pub fn service_on(&mut self, node: &str, path: &str, config: Value) {
    let rel = Path::root().child("services").child("config").child(path);
    self.put_node(node, rel, config);
  }

  fn instance_rel(path: &str) -> Path {
    Path::root().child("services").child("status").child(path)
  }

  /// Sets both `avail` and `overall` of an instance, refreshing its `updated` stamp.
  pub fn avail(&mut self, node: &str, path: &str, avail: Avail) {
    let now = self.now;
    self.instance_field(node, path, "avail", Value::from(avail.as_str()));
    self.instance_field(node, path, "overall", Value::from(avail.as_str()));
    self.instance_field(node, path, "updated", Value::from(now));
  }

  pub fn instance_field(&mut self, node: &str, path: &str, key: &str, value: Value) {
    self.put_node(node, ClusterFixture::instance_rel(path).child(key), value);
  }

  /// Replaces the monitor record of an instance.
  pub fn smon(&mut self, node: &str, path: &str, smon: Value) {
    self.instance_field(node, path, "monitor", smon);
  }

  pub fn resource(&mut self, node: &str, path: &str, rid: &str, status: Value) {
    let rel = ClusterFixture::instance_rel(path).child("resources").child(rid);
    self.put_node(node, rel, status);
  }

  pub fn instance(&self, node: &str, path: &str) -> Option<&Value> {
    lookup(&self.data, &instance_path(node, path))
  }

  pub fn blob(&self, node: &str) -> Value {
    lookup(&self.data, &node_path(node)).cloned().unwrap_or_else(Value::map)
  }

  pub fn snapshot(&self) -> Value {
    self.data.clone()
  }

  pub fn live(&self) -> BTreeSet<String> {
    self
      .nodes
      .iter()
      .filter(|n| !self.down.contains(*n))
      .cloned()
      .collect()
  }

  pub fn view(&self) -> ClusterView {
    ClusterView::build(
      &self.local,
      self.now,
      &self.data,
      &self.live(),
      &self.nodes,
      self.stale_after,
    )
  }

  /// Feeds the peer blobs to a daemon as full peer messages and beats (or stops beating) every
  /// peer heartbeat accordingly.
  pub fn seed(&mut self, state: &DaemonState) {
    self.full_id += 1;
    for node in self.nodes.iter().filter(|n| **n != self.local) {
      if self.down.contains(node) {
        state.heartbeats.mark_down(FIXTURE_HB, node);
        continue;
      }
      beat_steadily(&state.heartbeats, node);
      let msg = PeerMessage::Full {
        id: self.full_id,
        ts: self.now,
        data: self.blob(node),
      };
      state.peers.receive(&state.data, node, msg);
    }
  }
}

/// Enough regular beats for the failure detector to consider `peer` alive right now.
pub fn beat_steadily(heartbeats: &HeartbeatRegistry, peer: &str) {
  let now = std::time::Instant::now();
  for i in (0..5u64).rev() {
    let at = now
      .checked_sub(Duration::from_millis(200 * i))
      .unwrap_or(now);
    heartbeats.beat_at(FIXTURE_HB, peer, at);
  }
}

#[test]
fn test_fixture_view() {
  let mut fx = ClusterFixture::new("n1", &["n1", "n2"]);
  fx.service("svc", crate::vmap! { "scope" => fx.scope() });
  fx.avail("n2", "svc", Avail::Up);
  let view = fx.view();
  assert_eq!(view.avail("n2", "svc"), Avail::Up);
  assert_eq!(view.node_monitor("n2").map(|m| m.status), Some(NodeStatus::Idle));
  assert_eq!(view.running_on("svc"), vec!["n2".to_string()]);

  fx.node_down("n2");
  assert_eq!(fx.view().avail("n2", "svc"), Avail::Unknown);
  fx.node_up("n2");
  fx.advance(31.0);
  assert!(fx.view().is_stale("n2"));
  fx.touch_all();
  assert!(!fx.view().is_stale("n2"));
}
