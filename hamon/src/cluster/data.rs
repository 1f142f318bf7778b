use crate::core::{Path, Value};
use crate::{path, vmap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;
use validator::{Validate, ValidationError};

/// Availability of a service instance or of one of its resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Avail {
  #[serde(rename = "up")]
  Up,
  #[serde(rename = "down")]
  Down,
  #[serde(rename = "warn")]
  Warn,
  #[serde(rename = "n/a")]
  NotApplicable,
  #[serde(rename = "undef")]
  Undef,
  /// No data: the instance never reported, or its node is down or stale.
  #[serde(rename = "unknown")]
  Unknown,
}
impl Avail {
  pub fn as_str(self) -> &'static str {
    match self {
      Avail::Up => "up",
      Avail::Down => "down",
      Avail::Warn => "warn",
      Avail::NotApplicable => "n/a",
      Avail::Undef => "undef",
      Avail::Unknown => "unknown",
    }
  }

  /// Something is running and would have to be stopped.
  pub fn is_running(self) -> bool {
    matches!(self, Avail::Up | Avail::Warn)
  }
}
impl Default for Avail {
  fn default() -> Self {
    Avail::Undef
  }
}
impl fmt::Display for Avail {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
  Failover,
  Flex,
}
impl Default for Topology {
  fn default() -> Self {
    Topology::Failover
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orchestrate {
  No,
  Ha,
}
impl Default for Orchestrate {
  fn default() -> Self {
    Orchestrate::No
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
  /// The order nodes are declared in the service scope.
  #[serde(rename = "nodes order")]
  NodesOrder,
  /// A per-service pseudo-random order, spreading leaders over the scope.
  #[serde(rename = "spread")]
  Spread,
}
impl Default for Placement {
  fn default() -> Self {
    Placement::NodesOrder
  }
}

/// The orchestration-relevant part of a service definition, as published by each node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_flex_bounds"))]
pub struct ServiceConfig {
  /// Nodes allowed to run an instance, in declared order.
  #[validate(length(min = 1))]
  pub scope: Vec<String>,
  #[serde(default)]
  pub topology: Topology,
  #[serde(default = "default_flex_min")]
  pub flex_min: usize,
  /// Defaults to the scope size.
  #[serde(default)]
  pub flex_max: Option<usize>,
  /// Services that must be up before this one starts, optionally pinned with `path@node`.
  #[serde(default)]
  pub parents: Vec<String>,
  #[serde(default)]
  pub orchestrate: Orchestrate,
  #[serde(default)]
  pub placement: Placement,
  /// Kept running while the node drains.
  #[serde(default)]
  pub always_on: bool,
}
impl ServiceConfig {
  pub fn flex_max(&self) -> usize {
    self.flex_max.unwrap_or(self.scope.len())
  }
}

fn default_flex_min() -> usize {
  1
}

fn validate_flex_bounds(cfg: &ServiceConfig) -> Result<(), ValidationError> {
  if cfg.topology == Topology::Flex && cfg.flex_min > cfg.flex_max() {
    return Err(ValidationError::new("flex_min_above_flex_max"));
  }
  Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
  #[serde(default)]
  pub status: Avail,
  #[serde(default)]
  pub label: String,
  #[serde(default)]
  pub info: BTreeMap<String, Value>,
  #[serde(default)]
  pub log: Vec<String>,
  /// Restart this resource when it goes down on a started instance.
  #[serde(default)]
  pub monitor: bool,
  /// How many times the monitor may restart it.
  #[serde(default)]
  pub restart: u32,
}

/// Monitor state of a service instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceStatus {
  #[serde(rename = "idle")]
  Idle,
  #[serde(rename = "wait parents")]
  WaitParents,
  #[serde(rename = "wait children")]
  WaitChildren,
  #[serde(rename = "wait leader")]
  WaitLeader,
  #[serde(rename = "ready")]
  Ready,
  #[serde(rename = "starting")]
  Starting,
  #[serde(rename = "start failed")]
  StartFailed,
  #[serde(rename = "stopping")]
  Stopping,
  #[serde(rename = "stop failed")]
  StopFailed,
  #[serde(rename = "restarting")]
  Restarting,
  #[serde(rename = "freezing")]
  Freezing,
  #[serde(rename = "freeze failed")]
  FreezeFailed,
  #[serde(rename = "thawing")]
  Thawing,
  #[serde(rename = "thaw failed")]
  ThawFailed,
  #[serde(rename = "provisioning")]
  Provisioning,
  #[serde(rename = "provision failed")]
  ProvisionFailed,
}
impl ServiceStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      ServiceStatus::Idle => "idle",
      ServiceStatus::WaitParents => "wait parents",
      ServiceStatus::WaitChildren => "wait children",
      ServiceStatus::WaitLeader => "wait leader",
      ServiceStatus::Ready => "ready",
      ServiceStatus::Starting => "starting",
      ServiceStatus::StartFailed => "start failed",
      ServiceStatus::Stopping => "stopping",
      ServiceStatus::StopFailed => "stop failed",
      ServiceStatus::Restarting => "restarting",
      ServiceStatus::Freezing => "freezing",
      ServiceStatus::FreezeFailed => "freeze failed",
      ServiceStatus::Thawing => "thawing",
      ServiceStatus::ThawFailed => "thaw failed",
      ServiceStatus::Provisioning => "provisioning",
      ServiceStatus::ProvisionFailed => "provision failed",
    }
  }

  /// An action is running on behalf of this state.
  pub fn is_transient(self) -> bool {
    matches!(
      self,
      ServiceStatus::Starting
        | ServiceStatus::Stopping
        | ServiceStatus::Restarting
        | ServiceStatus::Freezing
        | ServiceStatus::Thawing
        | ServiceStatus::Provisioning
    )
  }

  pub fn is_failed(self) -> bool {
    matches!(
      self,
      ServiceStatus::StartFailed
        | ServiceStatus::StopFailed
        | ServiceStatus::FreezeFailed
        | ServiceStatus::ThawFailed
        | ServiceStatus::ProvisionFailed
    )
  }
}
impl Default for ServiceStatus {
  fn default() -> Self {
    ServiceStatus::Idle
  }
}
impl fmt::Display for ServiceStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceLocalExpect {
  Started,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceGlobalExpect {
  Started,
  Stopped,
  Frozen,
  Thawed,
  Provisioned,
}

/// The "smon" record of a service instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceMonitor {
  #[serde(default)]
  pub status: ServiceStatus,
  #[serde(default)]
  pub status_updated: f64,
  #[serde(default)]
  pub local_expect: Option<ServiceLocalExpect>,
  #[serde(default)]
  pub global_expect: Option<ServiceGlobalExpect>,
  /// Retry counters, keyed by resource id.
  #[serde(default)]
  pub restart: BTreeMap<String, u32>,
}

fn default_true() -> bool {
  true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstanceStatus {
  #[serde(default)]
  pub avail: Avail,
  #[serde(default)]
  pub overall: Avail,
  /// Freeze timestamp, 0 when thawed.
  #[serde(default)]
  pub frozen: f64,
  #[serde(default)]
  pub provisioned: Option<bool>,
  #[serde(default = "default_true")]
  pub constraints: bool,
  #[serde(default)]
  pub monitor: ServiceMonitor,
  #[serde(default)]
  pub resources: BTreeMap<String, ResourceStatus>,
  #[serde(default)]
  pub updated: f64,
}
impl ServiceInstanceStatus {
  pub fn is_frozen(&self) -> bool {
    self.frozen > 0.0
  }
}
impl Default for ServiceInstanceStatus {
  fn default() -> Self {
    ServiceInstanceStatus {
      avail: Avail::Undef,
      overall: Avail::Undef,
      frozen: 0.0,
      provisioned: None,
      constraints: true,
      monitor: ServiceMonitor::default(),
      resources: BTreeMap::new(),
      updated: 0.0,
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
  #[serde(rename = "init")]
  Init,
  #[serde(rename = "rejoin")]
  Rejoin,
  #[serde(rename = "idle")]
  Idle,
  #[serde(rename = "frozen")]
  Frozen,
  #[serde(rename = "thawing")]
  Thawing,
  #[serde(rename = "draining")]
  Draining,
  #[serde(rename = "drained")]
  Drained,
  #[serde(rename = "shutting")]
  Shutting,
  /// The daemon is restarting; peers keep its data instead of failing its services over.
  #[serde(rename = "maintenance")]
  Maintenance,
}
impl NodeStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      NodeStatus::Init => "init",
      NodeStatus::Rejoin => "rejoin",
      NodeStatus::Idle => "idle",
      NodeStatus::Frozen => "frozen",
      NodeStatus::Thawing => "thawing",
      NodeStatus::Draining => "draining",
      NodeStatus::Drained => "drained",
      NodeStatus::Shutting => "shutting",
      NodeStatus::Maintenance => "maintenance",
    }
  }
}
impl Default for NodeStatus {
  fn default() -> Self {
    NodeStatus::Init
  }
}
impl fmt::Display for NodeStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeLocalExpect {
  Drain,
  Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeGlobalExpect {
  Frozen,
  Thawed,
  Shutdown,
}

/// The "nmon" record of a node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMonitor {
  #[serde(default)]
  pub status: NodeStatus,
  #[serde(default)]
  pub status_updated: f64,
  #[serde(default)]
  pub local_expect: Option<NodeLocalExpect>,
  #[serde(default)]
  pub global_expect: Option<NodeGlobalExpect>,
}

/// A requested change to an optional monitor field.
///
/// Deserializes from an absent field as `Keep`, from `null` or `"unset"` as `Clear`, and from
/// anything else as `Set`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change<T> {
  Keep,
  Set(T),
  Clear,
}
impl<T: Copy> Change<T> {
  pub fn apply(self, current: Option<T>) -> Option<T> {
    match self {
      Change::Keep => current,
      Change::Set(v) => Some(v),
      Change::Clear => None,
    }
  }
}
impl<T> Default for Change<T> {
  fn default() -> Self {
    Change::Keep
  }
}
impl<'de, T: Deserialize<'de>> Deserialize<'de> for Change<T> {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr<T> {
      Value(T),
      Other(Option<String>),
    }
    match Repr::<T>::deserialize(deserializer)? {
      Repr::Value(v) => Ok(Change::Set(v)),
      Repr::Other(None) => Ok(Change::Clear),
      Repr::Other(Some(s)) if s == "unset" => Ok(Change::Clear),
      Repr::Other(Some(s)) => Err(serde::de::Error::custom(format!("unexpected value {:?}", s))),
    }
  }
}

/// One node's blob of cluster data, decoded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeData {
  pub monitor: NodeMonitor,
  pub labels: BTreeMap<String, String>,
  /// Node freeze timestamp, 0 when thawed.
  pub frozen: f64,
  pub services_status: BTreeMap<String, ServiceInstanceStatus>,
  pub services_config: BTreeMap<String, ServiceConfig>,
  pub updated: f64,
}
impl NodeData {
  /// Decodes a node blob. A record that does not decode is left out (logged), the rest of the
  /// blob is still used, and an invalid service configuration excludes only that service.
  pub fn from_value(node: &str, blob: &Value) -> NodeData {
    let mut data = NodeData::default();
    if let Some(v) = blob.get("monitor") {
      match v.decode() {
        Ok(m) => data.monitor = m,
        Err(e) => warn!(node, error = %e, "undecodable node monitor"),
      }
    }
    if let Some(v) = blob.get("labels") {
      data.labels = v.decode().unwrap_or_default();
    }
    data.frozen = blob.get("frozen").and_then(Value::as_f64).unwrap_or(0.0);
    data.updated = blob.get("updated").and_then(Value::as_f64).unwrap_or(0.0);
    let services = blob.get("services");
    if let Some(m) = services.and_then(|s| s.get("status")).and_then(Value::as_map) {
      for (svc, v) in m.iter() {
        match v.decode::<ServiceInstanceStatus>() {
          Ok(st) => {
            data.services_status.insert(svc.clone(), st);
          }
          Err(e) => warn!(node, path = %svc, error = %e, "undecodable instance status"),
        }
      }
    }
    if let Some(m) = services.and_then(|s| s.get("config")).and_then(Value::as_map) {
      for (svc, v) in m.iter() {
        match v.decode::<ServiceConfig>().map_err(|e| e.to_string()).and_then(|c| {
          c.validate().map_err(|e| e.to_string())?;
          Ok(c)
        }) {
          Ok(cfg) => {
            data.services_config.insert(svc.clone(), cfg);
          }
          Err(reason) => {
            warn!(node, path = %svc, %reason, "service excluded from orchestration")
          }
        }
      }
    }
    data
  }

  pub fn is_frozen(&self) -> bool {
    self.frozen > 0.0
  }
}

pub fn nodes_path() -> Path {
  path!["cluster", "nodes"]
}

pub fn node_path(node: &str) -> Path {
  nodes_path().child(node)
}

pub fn nmon_path(node: &str) -> Path {
  node_path(node).child("monitor")
}

pub fn instance_path(node: &str, svc: &str) -> Path {
  node_path(node).child("services").child("status").child(svc)
}

pub fn smon_path(node: &str, svc: &str) -> Path {
  instance_path(node, svc).child("monitor")
}

pub fn service_config_path(node: &str, svc: &str) -> Path {
  node_path(node).child("services").child("config").child(svc)
}

/// The skeleton every node blob starts from.
pub fn empty_node_blob() -> Value {
  vmap! {
    "monitor" => vmap! { "status" => "init", "status_updated" => 0.0 },
    "labels" => vmap! {},
    "frozen" => 0.0,
    "services" => vmap! { "status" => vmap! {}, "config" => vmap! {} },
    "stats" => vmap! {},
    "updated" => 0.0,
  }
}

#[test]
fn test_node_blob_decoding_excludes_bad_configs() {
  let blob = vmap! {
    "monitor" => vmap! { "status" => "idle", "status_updated" => 3.0 },
    "frozen" => 0,
    "services" => vmap! {
      "status" => vmap! {
        "svc1" => vmap! {
          "avail" => "up",
          "monitor" => vmap! { "status" => "start failed", "global_expect" => "started" },
          "resources" => vmap! { "fs#1" => vmap! { "status" => "n/a", "log" => Value::from(vec![Value::from("mounted")]) } },
        },
      },
      "config" => vmap! {
        "svc1" => vmap! { "scope" => Value::from(vec![Value::from("n1")]), "orchestrate" => "ha" },
        "empty" => vmap! { "scope" => Value::list() },
        "flexbad" => vmap! {
          "scope" => Value::from(vec![Value::from("n1")]),
          "topology" => "flex",
          "flex_min" => 3,
        },
        "garbage" => vmap! { "scope" => "n1" },
      },
    },
  };
  let data = NodeData::from_value("n1", &blob);
  assert_eq!(data.monitor.status, NodeStatus::Idle);
  let st = &data.services_status["svc1"];
  assert_eq!(st.avail, Avail::Up);
  assert!(st.constraints);
  assert_eq!(st.monitor.status, ServiceStatus::StartFailed);
  assert_eq!(st.monitor.global_expect, Some(ServiceGlobalExpect::Started));
  assert_eq!(st.resources["fs#1"].status, Avail::NotApplicable);
  assert_eq!(data.services_config.keys().collect::<Vec<_>>(), vec!["svc1"]);
  assert_eq!(data.services_config["svc1"].orchestrate, Orchestrate::Ha);
  assert_eq!(data.services_config["svc1"].flex_max(), 1);
}

#[test]
fn test_change_wire_forms() {
  #[derive(Deserialize)]
  struct Req {
    #[serde(default)]
    global_expect: Change<ServiceGlobalExpect>,
  }
  let keep: Req = serde_json::from_str("{}").unwrap();
  assert_eq!(keep.global_expect, Change::Keep);
  let set: Req = serde_json::from_str(r#"{"global_expect":"frozen"}"#).unwrap();
  assert_eq!(set.global_expect, Change::Set(ServiceGlobalExpect::Frozen));
  let clear: Req = serde_json::from_str(r#"{"global_expect":"unset"}"#).unwrap();
  assert_eq!(clear.global_expect, Change::Clear);
  let null: Req = serde_json::from_str(r#"{"global_expect":null}"#).unwrap();
  assert_eq!(null.global_expect.apply(Some(ServiceGlobalExpect::Started)), None);
  assert!(serde_json::from_str::<Req>(r#"{"global_expect":"sideways"}"#).is_err());
}

#[test]
fn test_status_names() {
  assert_eq!(ServiceStatus::WaitParents.to_string(), "wait parents");
  assert_eq!(
    Value::encode(&ServiceStatus::StartFailed).unwrap(),
    Value::from("start failed")
  );
  assert!(ServiceStatus::Starting.is_transient());
  assert!(!ServiceStatus::Ready.is_transient());
  assert!(ServiceStatus::StopFailed.is_failed());
}
