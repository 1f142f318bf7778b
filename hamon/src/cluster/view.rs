use crate::cluster::data::{Avail, NodeData, NodeMonitor, ServiceConfig, ServiceInstanceStatus};
use crate::core::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// A decoded, point-in-time picture of the cluster data, as seen from one node.
///
/// Built once per monitor tick from a snapshot of the shared data, so every service evaluated
/// during the tick sees the same cluster. Data of a node that is not beating, or whose blob has
/// not been refreshed within `stale_after`, is hidden: queries return `None` for it, which
/// callers treat as unknown. So is the data of a peer whose patches stopped applying, until a
/// full message resyncs it.
#[derive(Clone, Debug)]
pub struct ClusterView {
  local: String,
  now: f64,
  declared: Vec<String>,
  live: BTreeSet<String>,
  stale_after: f64,
  desynced: BTreeSet<String>,
  nodes: BTreeMap<String, NodeData>,
}
impl ClusterView {
  pub fn build(
    local: &str,
    now: f64,
    snapshot: &Value,
    live: &BTreeSet<String>,
    declared: &[String],
    stale_after: Duration,
  ) -> ClusterView {
    let nodes = snapshot
      .get("cluster")
      .and_then(|c| c.get("nodes"))
      .and_then(Value::as_map)
      .map(|m| {
        m.iter()
          .map(|(node, blob)| (node.clone(), NodeData::from_value(node, blob)))
          .collect()
      })
      .unwrap_or_default();
    let mut live = live.clone();
    live.insert(local.to_string());
    ClusterView {
      local: local.to_string(),
      now: now,
      declared: declared.to_vec(),
      live: live,
      stale_after: stale_after.as_secs_f64(),
      desynced: BTreeSet::new(),
      nodes: nodes,
    }
  }

  /// Hides the data of `peers`, their copy being partially patched.
  pub fn with_desynced(mut self, peers: BTreeSet<String>) -> ClusterView {
    self.desynced = peers;
    self.desynced.remove(&self.local);
    self
  }

  pub fn local(&self) -> &str {
    &self.local
  }

  pub fn now(&self) -> f64 {
    self.now
  }

  /// Declared cluster nodes, followed by any other node that published data.
  pub fn cluster_nodes(&self) -> Vec<String> {
    let mut nodes = self.declared.clone();
    for n in self.nodes.keys().chain(std::iter::once(&self.local)) {
      if !nodes.contains(n) {
        nodes.push(n.clone());
      }
    }
    nodes
  }

  /// Every node present in the cluster data, whatever its state.
  pub fn known_nodes(&self) -> impl Iterator<Item = &str> {
    self.nodes.keys().map(String::as_str)
  }

  pub fn is_alive(&self, node: &str) -> bool {
    self.live.contains(node)
  }

  /// The local blob is never stale. A peer blob is stale when missing or desynced, or when not
  /// refreshed within the staleness threshold.
  pub fn is_stale(&self, node: &str) -> bool {
    if node == self.local {
      return false;
    }
    if self.desynced.contains(node) {
      return true;
    }
    match self.nodes.get(node) {
      Some(data) => self.now - data.updated > self.stale_after,
      None => true,
    }
  }

  fn trusted(&self, node: &str) -> Option<&NodeData> {
    if self.is_alive(node) && !self.is_stale(node) {
      self.nodes.get(node)
    } else {
      None
    }
  }

  /// The raw blob of `node`, even if down or stale.
  pub fn node(&self, node: &str) -> Option<&NodeData> {
    self.nodes.get(node)
  }

  pub fn local_node(&self) -> Option<&NodeData> {
    self.nodes.get(&self.local)
  }

  pub fn node_monitor(&self, node: &str) -> Option<&NodeMonitor> {
    self.trusted(node).map(|d| &d.monitor)
  }

  pub fn node_frozen(&self, node: &str) -> Option<bool> {
    self.trusted(node).map(NodeData::is_frozen)
  }

  /// The instance status of `path` on `node`. `None` means no usable data, never down.
  pub fn instance_status(&self, node: &str, path: &str) -> Option<&ServiceInstanceStatus> {
    self.trusted(node).and_then(|d| d.services_status.get(path))
  }

  pub fn avail(&self, node: &str, path: &str) -> Avail {
    self
      .instance_status(node, path)
      .map(|st| st.avail)
      .unwrap_or(Avail::Unknown)
  }

  /// The configuration of `path`: the local one if the service is defined here, else the one
  /// published by the first live node defining it.
  pub fn service_config(&self, path: &str) -> Option<&ServiceConfig> {
    if let Some(cfg) = self.local_node().and_then(|d| d.services_config.get(path)) {
      return Some(cfg);
    }
    self
      .cluster_nodes()
      .iter()
      .filter_map(|n| self.trusted(n))
      .find_map(|d| d.services_config.get(path))
  }

  /// Services configured on the local node.
  pub fn local_services(&self) -> Vec<String> {
    self
      .local_node()
      .map(|d| d.services_config.keys().cloned().collect())
      .unwrap_or_default()
  }

  /// Services having a local instance record, configured or not.
  pub fn local_instances(&self) -> Vec<String> {
    self
      .local_node()
      .map(|d| d.services_status.keys().cloned().collect())
      .unwrap_or_default()
  }

  /// Whether some live peer already published its data.
  pub fn peers_known(&self) -> bool {
    self
      .nodes
      .keys()
      .any(|n| n != &self.local && self.trusted(n).is_some())
  }

  /// Declared nodes other than the local one.
  pub fn declared_peers(&self) -> Vec<String> {
    self.declared.iter().filter(|n| **n != self.local).cloned().collect()
  }

  /// Services declaring `path` as a parent, pinned to a node or not.
  pub fn children(&self, path: &str) -> BTreeSet<String> {
    let mut configs = BTreeMap::new();
    for data in self.nodes.keys().filter_map(|n| self.trusted(n)) {
      for (svc, cfg) in data.services_config.iter() {
        configs.entry(svc.clone()).or_insert(cfg);
      }
    }
    configs
      .into_iter()
      .filter(|(_, cfg)| {
        cfg
          .parents
          .iter()
          .any(|p| p.split('@').next().map(|name| name == path).unwrap_or(false))
      })
      .map(|(svc, _)| svc)
      .collect()
  }

  /// Nodes of the scope of `path` whose instance runs (`up` or `warn`).
  pub fn running_on(&self, path: &str) -> Vec<String> {
    let scope = match self.service_config(path) {
      Some(cfg) => cfg.scope.clone(),
      None => self.cluster_nodes(),
    };
    scope
      .into_iter()
      .filter(|n| self.avail(n, path).is_running())
      .collect()
  }

  /// Number of scope nodes reporting `path` up.
  pub fn up_count(&self, path: &str) -> usize {
    match self.service_config(path) {
      Some(cfg) => cfg
        .scope
        .iter()
        .filter(|n| self.avail(n, path) == Avail::Up)
        .count(),
      None => 0,
    }
  }

  /// Instance statuses of `path` on the live, fresh scope nodes.
  pub fn scope_instances(&self, path: &str) -> Vec<(String, &ServiceInstanceStatus)> {
    match self.service_config(path) {
      Some(cfg) => cfg
        .scope
        .iter()
        .filter_map(|n| self.instance_status(n, path).map(|st| (n.clone(), st)))
        .collect(),
      None => Vec::new(),
    }
  }
}

#[cfg(test)]
use crate::vmap;

#[cfg(test)]
fn two_node_snapshot() -> Value {
  let scope = Value::from(vec![Value::from("n1"), Value::from("n2")]);
  vmap! {
    "cluster" => vmap! {
      "nodes" => vmap! {
        "n1" => vmap! {
          "updated" => 100.0,
          "services" => vmap! {
            "config" => vmap! {
              "db" => vmap! { "scope" => scope.clone() },
              "app" => vmap! { "scope" => scope.clone(), "parents" => Value::from(vec![Value::from("db@n2")]) },
            },
            "status" => vmap! { "db" => vmap! { "avail" => "down" } },
          },
        },
        "n2" => vmap! {
          "updated" => 95.0,
          "services" => vmap! {
            "config" => vmap! { "web" => vmap! { "scope" => scope, "parents" => Value::from(vec![Value::from("db")]) } },
            "status" => vmap! { "db" => vmap! { "avail" => "up" } },
          },
        },
      },
    },
  }
}

#[test]
fn test_dead_or_stale_peers_are_unknown() {
  let snapshot = two_node_snapshot();
  let declared = vec!["n1".to_string(), "n2".to_string()];
  let stale = Duration::from_secs(30);
  let none = BTreeSet::new();
  let view = ClusterView::build("n1", 110.0, &snapshot, &none, &declared, stale);
  assert!(view.is_alive("n1"));
  assert_eq!(view.avail("n1", "db"), Avail::Down);
  assert_eq!(view.avail("n2", "db"), Avail::Unknown);
  assert!(!view.peers_known());

  let live = maplit::btreeset! { "n2".to_string() };
  let view = ClusterView::build("n1", 110.0, &snapshot, &live, &declared, stale);
  assert_eq!(view.avail("n2", "db"), Avail::Up);
  assert_eq!(view.up_count("db"), 1);
  assert_eq!(view.running_on("db"), vec!["n2".to_string()]);
  assert!(view.peers_known());

  let view = ClusterView::build("n1", 130.0, &snapshot, &live, &declared, stale);
  assert!(view.is_stale("n2"));
  assert!(!view.is_stale("n1"));
  assert!(view.instance_status("n2", "db").is_none());
}

#[test]
fn test_service_queries() {
  let snapshot = two_node_snapshot();
  let declared = vec!["n1".to_string(), "n2".to_string()];
  let live = maplit::btreeset! { "n2".to_string() };
  let view = ClusterView::build("n1", 100.0, &snapshot, &live, &declared, Duration::from_secs(30));
  assert_eq!(view.local_services(), vec!["app".to_string(), "db".to_string()]);
  assert_eq!(view.local_instances(), vec!["db".to_string()]);
  assert!(view.service_config("web").is_some());
  assert_eq!(
    view.children("db"),
    maplit::btreeset! { "app".to_string(), "web".to_string() }
  );
  assert_eq!(view.declared_peers(), vec!["n2".to_string()]);
}

#[test]
fn test_desynced_peer_is_unknown() {
  let snapshot = two_node_snapshot();
  let declared = vec!["n1".to_string(), "n2".to_string()];
  let live = maplit::btreeset! { "n2".to_string() };
  let desynced = maplit::btreeset! { "n2".to_string() };
  let view = ClusterView::build("n1", 100.0, &snapshot, &live, &declared, Duration::from_secs(30))
    .with_desynced(desynced);
  assert!(view.is_alive("n2"));
  assert!(view.is_stale("n2"));
  assert_eq!(view.avail("n2", "db"), Avail::Unknown);
  assert!(view.service_config("web").is_none());
  assert!(!view.peers_known());
  assert_eq!(view.children("db"), maplit::btreeset! { "app".to_string() });
}
