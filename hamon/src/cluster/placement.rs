use crate::cluster::data::Placement;
use itertools::Itertools;
use std::hash::{Hash, Hasher};
use wyhash::WyHash;

/// Orders the scope of a service according to its placement policy.
///
/// Every node computes the same order from the same service path and scope, so the first
/// eligible node of this order is an agreed-upon leader without any message exchange.
pub fn ordered(policy: Placement, path: &str, scope: &[String]) -> Vec<String> {
  let uniq = scope.iter().unique().cloned();
  match policy {
    Placement::NodesOrder => uniq.collect(),
    Placement::Spread => uniq
      .sorted_by(|a, b| {
        hash_code(&(path, a.as_str()))
          .cmp(&hash_code(&(path, b.as_str())))
          .then_with(|| a.cmp(b))
      })
      .collect(),
  }
}

/// The eligible nodes in placement order.
pub fn ranked<F>(policy: Placement, path: &str, scope: &[String], eligible: F) -> Vec<String>
where
  F: Fn(&str) -> bool,
{
  ordered(policy, path, scope)
    .into_iter()
    .filter(|n| eligible(n))
    .collect()
}

/// The single node allowed to act on a failover service, if any node is eligible.
pub fn leader<F>(policy: Placement, path: &str, scope: &[String], eligible: F) -> Option<String>
where
  F: Fn(&str) -> bool,
{
  ordered(policy, path, scope).into_iter().find(|n| eligible(n))
}

fn hash_code<H: Hash>(item: &H) -> u64 {
  let mut hasher = WyHash::with_seed(0);
  item.hash(&mut hasher);
  hasher.finish()
}

#[cfg(test)]
fn nodes(names: &[&str]) -> Vec<String> {
  names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_nodes_order_follows_scope() {
  let scope = nodes(&["n3", "n1", "n2", "n1"]);
  assert_eq!(ordered(Placement::NodesOrder, "svc", &scope), nodes(&["n3", "n1", "n2"]));
  assert_eq!(
    leader(Placement::NodesOrder, "svc", &scope, |n| n != "n3"),
    Some("n1".to_string())
  );
  assert_eq!(leader(Placement::NodesOrder, "svc", &scope, |_| false), None);
}

#[test]
fn test_spread_ignores_declared_order() {
  let a = nodes(&["n1", "n2", "n3", "n4"]);
  let b = nodes(&["n4", "n2", "n1", "n3"]);
  for svc in &["svc1", "svc2", "ns/db"] {
    assert_eq!(ordered(Placement::Spread, svc, &a), ordered(Placement::Spread, svc, &b));
  }
}

#[test]
fn test_ranked_filters() {
  let scope = nodes(&["n1", "n2", "n3"]);
  assert_eq!(
    ranked(Placement::NodesOrder, "svc", &scope, |n| n != "n2"),
    nodes(&["n1", "n3"])
  );
}
