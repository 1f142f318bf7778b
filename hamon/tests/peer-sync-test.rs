use hamon::cluster::data::node_path;
use hamon::cluster::{PeerMessage, PeerTransport, RxOutcome, ServiceStatus};
use hamon::core::Value;
use hamon::daemon::{DaemonState, SmonUpdate};
use hamon::monitor::DaemonConfig;
use hamon::testkit::{self, ChannelInbox, ChannelTransport, LogLevel};
use hamon::vmap;
use tokio_test::block_on;

fn daemon(name: &str) -> DaemonState {
  DaemonState::new(DaemonConfig {
    nodename: name.to_string(),
    nodes: vec!["n1".to_string(), "n2".to_string()],
    workers: 0,
    ..DaemonConfig::default()
  })
}

fn set_status(state: &DaemonState, path: &str, status: ServiceStatus) {
  let update = SmonUpdate {
    status: Some(status),
    ..SmonUpdate::default()
  };
  state.set_smon(path, update).unwrap();
}

/// Broadcasts what `state` has to publish. Returns the newest patch.
fn publish(state: &DaemonState, transport: &ChannelTransport) -> Option<PeerMessage> {
  let msgs = state.publisher().next_patches(&state.data, 1.0);
  for msg in &msgs {
    block_on(transport.broadcast(msg)).unwrap();
  }
  msgs.into_iter().last()
}

/// What `receiver` holds for `sender`'s blob matches what `sender` publishes.
fn converged(sender: &DaemonState, receiver: &DaemonState) -> bool {
  let head = sender.data.lock().journal_head();
  let copy = receiver.data.get(&node_path(sender.nodename())).ok();
  head.is_some() && head == copy
}

fn outcomes(inbox: &ChannelInbox, state: &DaemonState) -> Vec<RxOutcome> {
  inbox
    .deliver(state)
    .unwrap()
    .into_iter()
    .map(|(_, outcome)| outcome)
    .collect()
}

#[test]
fn patches_replicate_in_order() {
  testkit::init_test(LogLevel::Debug);
  let n1 = daemon("n1");
  let n2 = daemon("n2");
  let mut mesh = ChannelTransport::mesh(&["n1", "n2"]);
  let (_t2, i2) = mesh.pop().unwrap();
  let (t1, _i1) = mesh.pop().unwrap();

  let full = n1.publisher().full(&n1.data, 0.0);
  block_on(t1.broadcast(&full)).unwrap();
  assert_eq!(outcomes(&i2, &n2), vec![RxOutcome::Applied]);
  assert!(converged(&n1, &n2));

  n1.post_service_config("svc", vmap! { "scope" => Value::from(vec![Value::from("n1")]) })
    .unwrap();
  set_status(&n1, "svc", ServiceStatus::Ready);
  let first = publish(&n1, &t1).unwrap();
  set_status(&n1, "svc", ServiceStatus::Starting);
  publish(&n1, &t1).unwrap();
  assert_eq!(
    outcomes(&i2, &n2),
    vec![RxOutcome::Applied, RxOutcome::Applied]
  );
  assert!(converged(&n1, &n2));
  assert!(publish(&n1, &t1).is_none());

  // a replayed patch changes nothing
  block_on(t1.broadcast(&first)).unwrap();
  assert_eq!(outcomes(&i2, &n2), vec![RxOutcome::Duplicate]);
  assert!(converged(&n1, &n2));
}

#[test]
fn stats_stay_local() {
  let n1 = daemon("n1");
  let n2 = daemon("n2");
  let mut mesh = ChannelTransport::mesh(&["n1", "n2"]);
  let (_t2, i2) = mesh.pop().unwrap();
  let (t1, _i1) = mesh.pop().unwrap();
  let full = n1.publisher().full(&n1.data, 0.0);
  block_on(t1.broadcast(&full)).unwrap();
  i2.deliver(&n2).unwrap();

  let stats = node_path("n1").child("stats");
  n1.data.set(&stats, vmap! { "procs" => 0 }).unwrap();
  assert!(publish(&n1, &t1).is_none());
  assert!(!n2.data.exists(&stats));
  assert!(converged(&n1, &n2));
}

#[test]
fn partition_gap_then_full_resync() {
  testkit::init_test(LogLevel::Debug);
  let n1 = daemon("n1");
  let n2 = daemon("n2");
  let mut mesh = ChannelTransport::mesh(&["n1", "n2"]);
  let (_t2, i2) = mesh.pop().unwrap();
  let (t1, _i1) = mesh.pop().unwrap();

  // patches from a never synced peer are refused
  set_status(&n1, "svc", ServiceStatus::Ready);
  publish(&n1, &t1).unwrap();
  assert_eq!(outcomes(&i2, &n2), vec![RxOutcome::NeedResync]);
  assert!(!n2.peers.is_trusted("n1"));

  let full = n1.publisher().full(&n1.data, 0.0);
  block_on(t1.send_to("n2", &full)).unwrap();
  assert_eq!(outcomes(&i2, &n2), vec![RxOutcome::Applied]);
  assert!(n2.peers.is_trusted("n1"));

  t1.cut("n2");
  set_status(&n1, "svc", ServiceStatus::Starting);
  publish(&n1, &t1).unwrap();
  assert_eq!(i2.pending(), 0);
  t1.heal("n2");

  set_status(&n1, "svc", ServiceStatus::Idle);
  publish(&n1, &t1).unwrap();
  assert_eq!(outcomes(&i2, &n2), vec![RxOutcome::NeedResync]);
  assert!(!n2.peers.is_trusted("n1"));
  assert!(!converged(&n1, &n2));

  // nothing more is applied until the full message arrives
  set_status(&n1, "svc", ServiceStatus::Ready);
  publish(&n1, &t1).unwrap();
  assert_eq!(outcomes(&i2, &n2), vec![RxOutcome::NeedResync]);

  set_status(&n1, "svc", ServiceStatus::Starting);
  let full = n1.publisher().full(&n1.data, 0.0);
  block_on(t1.send_to("n2", &full)).unwrap();
  assert_eq!(outcomes(&i2, &n2), vec![RxOutcome::Applied]);
  assert!(converged(&n1, &n2));

  // the resync cut the pending journal into a patch n2 already holds, then patches resume
  // without a gap
  set_status(&n1, "svc", ServiceStatus::Idle);
  publish(&n1, &t1).unwrap();
  assert_eq!(
    outcomes(&i2, &n2),
    vec![RxOutcome::Duplicate, RxOutcome::Applied]
  );
  assert!(converged(&n1, &n2));
  let copy = n2
    .data
    .get(&node_path("n1").child("services").child("status").child("svc").child("monitor"))
    .unwrap();
  assert_eq!(copy.get("status").and_then(Value::as_str), Some("idle"));
}

#[test]
fn one_peer_resyncing_leaves_the_others_in_sync() {
  testkit::init_test(LogLevel::Debug);
  let n1 = daemon("n1");
  let n2 = daemon("n2");
  let n3 = daemon("n3");
  let mut mesh = ChannelTransport::mesh(&["n1", "n2", "n3"]);
  let (_t3, i3) = mesh.pop().unwrap();
  let (_t2, i2) = mesh.pop().unwrap();
  let (t1, _i1) = mesh.pop().unwrap();

  let full = n1.publisher().full(&n1.data, 0.0);
  block_on(t1.broadcast(&full)).unwrap();
  assert_eq!(outcomes(&i2, &n2), vec![RxOutcome::Applied]);
  assert_eq!(outcomes(&i3, &n3), vec![RxOutcome::Applied]);

  // n2 misses a patch and asks for a resync while n1 has unpublished changes
  t1.cut("n2");
  set_status(&n1, "svc", ServiceStatus::Ready);
  publish(&n1, &t1).unwrap();
  t1.heal("n2");
  assert_eq!(outcomes(&i3, &n3), vec![RxOutcome::Applied]);
  set_status(&n1, "svc", ServiceStatus::Starting);
  publish(&n1, &t1).unwrap();
  assert_eq!(outcomes(&i2, &n2), vec![RxOutcome::NeedResync]);
  assert_eq!(outcomes(&i3, &n3), vec![RxOutcome::Applied]);

  set_status(&n1, "svc", ServiceStatus::Idle);
  let full = n1.publisher().full(&n1.data, 0.0);
  block_on(t1.send_to("n2", &full)).unwrap();
  assert_eq!(outcomes(&i2, &n2), vec![RxOutcome::Applied]);

  set_status(&n1, "svc", ServiceStatus::Ready);
  publish(&n1, &t1).unwrap();
  assert_eq!(
    outcomes(&i2, &n2),
    vec![RxOutcome::Duplicate, RxOutcome::Applied]
  );
  assert_eq!(
    outcomes(&i3, &n3),
    vec![RxOutcome::Applied, RxOutcome::Applied]
  );
  assert!(n2.peers.is_trusted("n1"));
  assert!(n3.peers.is_trusted("n1"));
  assert!(n3.peers.desynced().is_empty());
  assert!(converged(&n1, &n2));
  assert!(converged(&n1, &n3));
}

#[test]
fn corrupt_bytes_are_an_error_not_a_panic() {
  let n2 = daemon("n2");
  assert!(PeerMessage::decode(b"\xff\x00garbage").is_err());
  assert!(!n2.peers.is_trusted("n1"));
}
