use hamon::cluster::{Avail, PeerTransport, RxOutcome, ServiceStatus};
use hamon::core::Value;
use hamon::daemon::DaemonState;
use hamon::monitor::{ActionKind, DaemonConfig, Monitor};
use hamon::testkit::{self, beat_steadily, ChannelInbox, ChannelTransport, FakeLauncher};
use hamon::testkit::{LogLevel, MemoryStatusSource};
use hamon::vmap;
use std::sync::Arc;
use tokio_test::block_on;

const NODES: [&str; 2] = ["n1", "n2"];

struct Node {
  name: &'static str,
  state: Arc<DaemonState>,
  monitor: Monitor,
  launcher: FakeLauncher,
  transport: ChannelTransport,
  inbox: ChannelInbox,
}

fn cluster() -> Vec<Node> {
  testkit::init_test(LogLevel::Debug);
  ChannelTransport::mesh(&NODES)
    .into_iter()
    .zip(NODES.iter().copied())
    .map(|((transport, inbox), name)| {
      let state = Arc::new(DaemonState::new(DaemonConfig {
        nodename: name.to_string(),
        nodes: NODES.iter().map(|n| n.to_string()).collect(),
        workers: 0,
        ..DaemonConfig::default()
      }));
      let launcher = FakeLauncher::new();
      let source = MemoryStatusSource::new();
      let effect = source.clone();
      launcher.on_exit(move |action, code| {
        if action.kind == ActionKind::Start && code == 0 {
          effect.set_avail(&action.path, Avail::Up);
        }
      });
      let scope = Value::from(NODES.iter().map(|n| Value::from(*n)).collect::<Vec<_>>());
      state
        .post_service_config("svc", vmap! { "scope" => scope, "orchestrate" => "ha" })
        .unwrap();
      source.set_avail("svc", Avail::Down);
      let monitor = Monitor::new(
        state.clone(),
        Arc::new(launcher.clone()),
        Arc::new(source),
      );
      Node {
        name: name,
        state: state,
        monitor: monitor,
        launcher: launcher,
        transport: transport,
        inbox: inbox,
      }
    })
    .collect()
}

/// Delivers what `nodes[i]` received, answering resync requests with a full message.
fn deliver(nodes: &[Node], i: usize, at: f64) {
  let node = &nodes[i];
  let mut outcomes = node.inbox.deliver(&node.state).unwrap();
  while !outcomes.is_empty() {
    for (peer, outcome) in &outcomes {
      if *outcome == RxOutcome::NeedResync {
        let sender = nodes.iter().find(|n| n.name == peer.as_str()).unwrap();
        let full = sender.state.publisher().full(&sender.state.data, at);
        block_on(sender.transport.send_to(node.name, &full)).unwrap();
      }
    }
    outcomes = node.inbox.deliver(&node.state).unwrap();
  }
}

fn round(nodes: &mut [Node], at: f64) {
  for i in 0..nodes.len() {
    for other in NODES.iter().filter(|n| **n != nodes[i].name) {
      beat_steadily(&nodes[i].state.heartbeats, other);
    }
    deliver(nodes, i, at);
    let report = nodes[i].monitor.tick_at(at).unwrap();
    for msg in report.outgoing {
      block_on(nodes[i].transport.broadcast(&msg)).unwrap();
    }
  }
}

fn svc_status(node: &Node) -> ServiceStatus {
  node.state.smon("svc").map(|m| m.status).unwrap_or_default()
}

#[test]
fn failover_service_starts_once_on_the_leader() {
  let mut nodes = cluster();
  for node in &nodes {
    let full = node.state.publisher().full(&node.state.data, 1000.0);
    block_on(node.transport.broadcast(&full)).unwrap();
  }

  let mut saw_wait_leader = false;
  for r in 0..30 {
    round(&mut nodes, 1000.0 + r as f64);
    saw_wait_leader |= svc_status(&nodes[1]) == ServiceStatus::WaitLeader;
  }

  let starts = nodes
    .iter()
    .map(|n| n.launcher.count("svc", ActionKind::Start))
    .collect::<Vec<_>>();
  assert_eq!(starts, vec![1, 0]);
  assert!(saw_wait_leader);
  for node in &nodes {
    assert_eq!(svc_status(node), ServiceStatus::Idle);
    assert!(node.state.peers.is_trusted(if node.name == "n1" { "n2" } else { "n1" }));
  }
}

#[test]
fn survivor_takes_over_a_dead_leader() {
  let mut nodes = cluster();
  for node in &nodes {
    let full = node.state.publisher().full(&node.state.data, 1000.0);
    block_on(node.transport.broadcast(&full)).unwrap();
  }
  for r in 0..15 {
    round(&mut nodes, 1000.0 + r as f64);
  }
  assert_eq!(nodes[0].launcher.count("svc", ActionKind::Start), 1);

  // n1 disappears: n2 stops hearing it and drops its data
  let n2 = nodes.pop().unwrap();
  let Node { state, mut monitor, launcher, .. } = n2;
  state.heartbeats.mark_down(testkit::FIXTURE_HB, "n1");
  for r in 15..40 {
    monitor.tick_at(1000.0 + r as f64).unwrap();
  }
  assert_eq!(launcher.count("svc", ActionKind::Start), 1);
  assert!(!state.heartbeats.is_beating("n1"));
}
