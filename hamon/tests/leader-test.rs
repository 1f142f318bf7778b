use hamon::cluster::placement::{leader, ordered, ranked};
use hamon::cluster::Placement;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;

const ROUNDS: usize = 500;

fn node_names(count: usize) -> Vec<String> {
  (1..=count).map(|i| format!("n{}", i)).collect()
}

fn random_live(rng: &mut SmallRng, scope: &[String]) -> BTreeSet<String> {
  scope.iter().filter(|_| rng.gen_bool(0.6)).cloned().collect()
}

#[test]
fn leader_is_live_whenever_someone_is() {
  let mut rng = SmallRng::seed_from_u64(7);
  for _ in 0..ROUNDS {
    let mut scope = node_names(rng.gen_range(1..8));
    scope.shuffle(&mut rng);
    let live = random_live(&mut rng, &scope);
    for policy in [Placement::NodesOrder, Placement::Spread] {
      let elected = leader(policy, "svc", &scope, |n| live.contains(n));
      match elected {
        Some(n) => assert!(live.contains(&n)),
        None => assert!(live.is_empty()),
      }
    }
  }
}

#[test]
fn nodes_order_elects_the_first_live_node_of_the_scope() {
  let mut rng = SmallRng::seed_from_u64(11);
  for _ in 0..ROUNDS {
    let mut scope = node_names(rng.gen_range(1..8));
    scope.shuffle(&mut rng);
    let live = random_live(&mut rng, &scope);
    let expected = scope.iter().find(|n| live.contains(*n)).cloned();
    assert_eq!(
      leader(Placement::NodesOrder, "svc", &scope, |n| live.contains(n)),
      expected
    );
  }
}

#[test]
fn spread_ignores_the_scope_order() {
  let mut rng = SmallRng::seed_from_u64(13);
  for i in 0..ROUNDS {
    let path = format!("svc{}", i);
    let scope = node_names(rng.gen_range(1..8));
    let live = random_live(&mut rng, &scope);
    let expected = leader(Placement::Spread, &path, &scope, |n| live.contains(n));
    let mut shuffled = scope.clone();
    shuffled.shuffle(&mut rng);
    assert_eq!(
      ordered(Placement::Spread, &path, &shuffled),
      ordered(Placement::Spread, &path, &scope)
    );
    assert_eq!(
      leader(Placement::Spread, &path, &shuffled, |n| live.contains(n)),
      expected
    );
  }
}

#[test]
fn spread_spreads_services() {
  let scope = node_names(4);
  let leaders = (0..200)
    .filter_map(|i| leader(Placement::Spread, &format!("svc{}", i), &scope, |_| true))
    .collect::<BTreeSet<_>>();
  assert_eq!(leaders.len(), 4);
}

#[test]
fn every_node_computes_the_same_ranks() {
  let mut rng = SmallRng::seed_from_u64(17);
  for i in 0..ROUNDS {
    let path = format!("svc{}", i);
    let scope = node_names(rng.gen_range(1..8));
    let live = random_live(&mut rng, &scope);
    let policy = if rng.gen_bool(0.5) { Placement::NodesOrder } else { Placement::Spread };
    let a = ranked(policy, &path, &scope, |n| live.contains(n));
    let b = ranked(policy, &path, &scope.clone(), |n| live.contains(n));
    assert_eq!(a, b);
    assert_eq!(a.len(), live.len());
    assert_eq!(a.first().cloned(), leader(policy, &path, &scope, |n| live.contains(n)));
  }
}
