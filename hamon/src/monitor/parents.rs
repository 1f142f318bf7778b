use crate::cluster::{Avail, ClusterView, Topology};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParentState {
  Satisfied,
  /// Known not to be up enough.
  Unmet(String),
  /// Not enough data to decide. Treated like `Unmet`.
  Unknown(String),
}

/// Resolves one `parents` entry: `path` for the service anywhere in its scope, `path@node` for
/// its instance on one node.
pub fn parent_state(view: &ClusterView, parent: &str) -> ParentState {
  if let Some((path, node)) = parent.split_once('@') {
    return match view.avail(node, path) {
      Avail::Up => ParentState::Satisfied,
      Avail::Unknown => ParentState::Unknown(format!("{} has no data", parent)),
      avail => ParentState::Unmet(format!("{} is {}", parent, avail)),
    };
  }
  let cfg = match view.service_config(parent) {
    Some(cfg) => cfg,
    None => return ParentState::Unknown(format!("{} is not configured on any live node", parent)),
  };
  let avails = cfg
    .scope
    .iter()
    .map(|n| view.avail(n, parent))
    .collect::<Vec<_>>();
  let up = avails.iter().filter(|a| **a == Avail::Up).count();
  let unknown = avails.iter().any(|a| *a == Avail::Unknown);
  let needed = match cfg.topology {
    Topology::Failover => 1,
    Topology::Flex => cfg.flex_min.max(1),
  };
  if up >= needed {
    ParentState::Satisfied
  } else if unknown {
    ParentState::Unknown(format!("{} has {}/{} up instances, some unknown", parent, up, needed))
  } else {
    ParentState::Unmet(format!("{} has {}/{} up instances", parent, up, needed))
  }
}

/// The first parent not satisfied, if any.
pub fn parents_state(view: &ClusterView, parents: &[String]) -> ParentState {
  parents
    .iter()
    .map(|p| parent_state(view, p))
    .find(|st| *st != ParentState::Satisfied)
    .unwrap_or(ParentState::Satisfied)
}

#[cfg(test)]
use crate::core::Value;
#[cfg(test)]
use crate::vmap;
#[cfg(test)]
use std::collections::BTreeSet;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
fn view_with(parent_cfg: Value, avails: &[(&str, &str)]) -> ClusterView {
  let mut nodes = im::OrdMap::new();
  for n in &["n1", "n2", "n3"] {
    let status = avails
      .iter()
      .filter(|(node, _)| node == n)
      .map(|(_, a)| ("parent".to_string(), vmap! { "avail" => *a }))
      .collect::<im::OrdMap<String, Value>>();
    nodes.insert(
      n.to_string(),
      vmap! {
        "updated" => 100.0,
        "services" => vmap! {
          "config" => vmap! { "parent" => parent_cfg.clone() },
          "status" => Value::Map(status),
        },
      },
    );
  }
  let snapshot = vmap! { "cluster" => vmap! { "nodes" => Value::Map(nodes) } };
  let live = ["n2", "n3"].iter().map(|s| s.to_string()).collect::<BTreeSet<_>>();
  let declared = vec!["n1".to_string(), "n2".to_string(), "n3".to_string()];
  ClusterView::build("n1", 100.0, &snapshot, &live, &declared, Duration::from_secs(30))
}

#[cfg(test)]
fn scope3() -> Value {
  Value::from(vec![Value::from("n1"), Value::from("n2"), Value::from("n3")])
}

#[test]
fn test_failover_parent() {
  let cfg = vmap! { "scope" => scope3() };
  let view = view_with(cfg.clone(), &[("n1", "down"), ("n2", "up"), ("n3", "down")]);
  assert_eq!(parent_state(&view, "parent"), ParentState::Satisfied);
  assert_eq!(parent_state(&view, "parent@n2"), ParentState::Satisfied);
  assert!(matches!(parent_state(&view, "parent@n1"), ParentState::Unmet(_)));

  let view = view_with(cfg.clone(), &[("n1", "down"), ("n2", "down")]);
  assert!(matches!(parent_state(&view, "parent"), ParentState::Unknown(_)));
  assert!(matches!(parent_state(&view, "parent@n3"), ParentState::Unknown(_)));

  let view = view_with(cfg, &[("n1", "down"), ("n2", "down"), ("n3", "down")]);
  assert!(matches!(parent_state(&view, "parent"), ParentState::Unmet(_)));
  assert!(matches!(parent_state(&view, "nope"), ParentState::Unknown(_)));
}

#[test]
fn test_flex_parent_needs_flex_min() {
  let cfg = vmap! { "scope" => scope3(), "topology" => "flex", "flex_min" => 2 };
  let view = view_with(cfg.clone(), &[("n1", "up"), ("n2", "down"), ("n3", "down")]);
  assert!(matches!(parent_state(&view, "parent"), ParentState::Unmet(_)));
  let view = view_with(cfg, &[("n1", "up"), ("n2", "up"), ("n3", "down")]);
  assert_eq!(parent_state(&view, "parent"), ParentState::Satisfied);
  assert_eq!(
    parents_state(&view, &["parent".to_string(), "parent@n3".to_string()]),
    ParentState::Unmet("parent@n3 is down".to_string())
  );
}
