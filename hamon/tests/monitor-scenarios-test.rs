use hamon::cluster::data::instance_path;
use hamon::cluster::{Avail, NodeStatus, PeerMessage, RxOutcome, ServiceStatus};
use hamon::core::{Fragment, Value};
use hamon::daemon::DaemonState;
use hamon::monitor::{ActionKind, DaemonConfig, Monitor, MonitorEvent, TickReport};
use hamon::testkit::{self, beat_steadily, ClusterFixture, FakeLauncher, LogLevel};
use hamon::testkit::MemoryStatusSource;
use hamon::{path, vmap};
use std::path::PathBuf;
use std::sync::Arc;

const DEPENDENT: &str = "s-depend-on-parent";

struct Harness {
  fx: ClusterFixture,
  state: Arc<DaemonState>,
  monitor: Monitor,
  launcher: FakeLauncher,
  source: MemoryStatusSource,
  events: crossbeam::channel::Receiver<MonitorEvent>,
}
impl Harness {
  /// `n1` is the monitored node; the other nodes are played by the fixture.
  fn new(nodes: &[&str], freeze_flag: Option<PathBuf>) -> Harness {
    testkit::init_test(LogLevel::Debug);
    let config = DaemonConfig {
      nodename: "n1".to_string(),
      nodes: nodes.iter().map(|n| n.to_string()).collect(),
      workers: 0,
      freeze_flag: freeze_flag,
      ..DaemonConfig::default()
    };
    let state = Arc::new(DaemonState::new(config));
    let launcher = FakeLauncher::new();
    let source = MemoryStatusSource::new();
    let effect = source.clone();
    launcher.on_exit(move |action, code| match (action.kind, code) {
      (ActionKind::Start, 0) => effect.set_avail(&action.path, Avail::Up),
      (ActionKind::Stop, 0) => effect.set_avail(&action.path, Avail::Down),
      _ => {}
    });
    let mut monitor = Monitor::new(
      state.clone(),
      Arc::new(launcher.clone()),
      Arc::new(source.clone()),
    );
    let events = monitor.subscribe();
    Harness {
      fx: ClusterFixture::new("n1", nodes),
      state: state,
      monitor: monitor,
      launcher: launcher,
      source: source,
      events: events,
    }
  }

  fn dependent(&self, parents: &[&str]) {
    let parents = parents.iter().map(|p| Value::from(*p)).collect::<Vec<_>>();
    self
      .state
      .post_service_config(
        DEPENDENT,
        vmap! {
          "scope" => Value::from(vec![Value::from("n1")]),
          "orchestrate" => "ha",
          "parents" => Value::from(parents),
        },
      )
      .unwrap();
    self.source.set_avail(DEPENDENT, Avail::Down);
  }

  /// Advances the clock, refreshes every peer blob, then runs one tick.
  fn tick(&mut self, secs: f64) -> TickReport {
    self.fx.advance(secs);
    self.fx.touch_all();
    self.fx.seed(&self.state);
    self.monitor.tick_at(self.fx.now()).unwrap()
  }

  /// Ticks until the node leaves its startup states.
  fn join(&mut self) {
    for _ in 0..3 {
      let status = self.tick(0.0).node_status;
      if !matches!(status, NodeStatus::Init | NodeStatus::Rejoin) {
        return;
      }
    }
  }

  fn status(&self, path: &str) -> ServiceStatus {
    self.state.smon(path).map(|m| m.status).unwrap_or_default()
  }

  fn transitions(&self, path: &str) -> Vec<(ServiceStatus, ServiceStatus)> {
    self
      .events
      .try_iter()
      .filter_map(|e| match e {
        MonitorEvent::ServiceTransition { path: p, from, to, .. } if p == path => Some((from, to)),
        _ => None,
      })
      .collect()
  }
}

#[test]
fn parent_up_dependent_starts_once() {
  let mut h = Harness::new(&["n1", "n2"], None);
  h.fx.service_on("n2", "parent", vmap! { "scope" => Value::from(vec![Value::from("n2")]) });
  h.fx.avail("n2", "parent", Avail::Up);
  h.dependent(&["parent"]);

  h.join();
  assert_eq!(h.status(DEPENDENT), ServiceStatus::Ready);
  let mut launched = Vec::new();
  for _ in 0..10 {
    launched.extend(h.tick(1.0).launched);
  }
  assert_eq!(launched.len(), 1);
  assert_eq!(launched[0].kind, ActionKind::Start);
  assert_eq!(h.launcher.count(DEPENDENT, ActionKind::Start), 1);
  assert_eq!(h.status(DEPENDENT), ServiceStatus::Idle);
  assert_eq!(
    h.transitions(DEPENDENT),
    vec![
      (ServiceStatus::Idle, ServiceStatus::Ready),
      (ServiceStatus::Ready, ServiceStatus::Starting),
      (ServiceStatus::Starting, ServiceStatus::Idle),
    ]
  );
}

#[test]
fn unknown_parent_blocks_start() {
  let mut h = Harness::new(&["n1", "n2"], None);
  // configured on n2, no instance status reported anywhere
  h.fx.service_on("n2", "parent", vmap! { "scope" => Value::from(vec![Value::from("n2")]) });
  h.dependent(&["parent"]);

  h.join();
  for _ in 0..20 {
    assert!(h.tick(1.0).launched.is_empty());
    assert_eq!(h.status(DEPENDENT), ServiceStatus::WaitParents);
  }
  assert!(h.launcher.launched().is_empty());

  // a parent on a dead node is just as unknown
  h.fx.avail("n2", "parent", Avail::Up);
  h.fx.node_down("n2");
  for _ in 0..10 {
    assert!(h.tick(1.0).launched.is_empty());
    assert_ne!(h.status(DEPENDENT), ServiceStatus::Ready);
    assert_ne!(h.status(DEPENDENT), ServiceStatus::Starting);
  }
}

#[test]
fn desynced_peer_data_does_not_satisfy_parents() {
  let mut h = Harness::new(&["n1", "n2"], None);
  h.fx.service_on("n2", "parent", vmap! { "scope" => Value::from(vec![Value::from("n2")]) });
  h.fx.avail("n2", "parent", Avail::Down);
  h.dependent(&["parent"]);
  h.join();
  h.tick(1.0);
  assert_eq!(h.status(DEPENDENT), ServiceStatus::WaitParents);

  // n2 resyncs, then one of its patches only partly applies
  let full = PeerMessage::Full {
    id: 100,
    ts: h.fx.now(),
    data: h.fx.blob("n2"),
  };
  assert_eq!(h.state.peers.receive(&h.state.data, "n2", full), RxOutcome::Applied);
  let parent = path!["services", "status", "parent"];
  let patch = PeerMessage::Patch {
    id: 101,
    ts: h.fx.now(),
    data: vec![
      Fragment::set(parent.child("avail"), Value::from("up")),
      Fragment::set(parent.child("overall"), Value::from("up")),
      Fragment::set(path!["missing", "deep"], Value::from(1)),
    ],
  };
  assert_eq!(h.state.peers.receive(&h.state.data, "n2", patch), RxOutcome::NeedResync);
  let copy = instance_path("n2", "parent").child("avail");
  assert_eq!(h.state.data.get(&copy), Ok(Value::from("up")));

  for _ in 0..10 {
    h.fx.advance(1.0);
    beat_steadily(&h.state.heartbeats, "n2");
    assert!(h.monitor.tick_at(h.fx.now()).unwrap().launched.is_empty());
    assert_eq!(h.status(DEPENDENT), ServiceStatus::WaitParents);
  }

  // a full message with the parent really up unblocks the start
  h.fx.avail("n2", "parent", Avail::Up);
  for _ in 0..10 {
    h.tick(1.0);
  }
  assert_eq!(h.launcher.count(DEPENDENT, ActionKind::Start), 1);
}

#[test]
fn flex_parent_needs_flex_min_instances() {
  let mut h = Harness::new(&["n1", "n2", "n3"], None);
  let parent = vmap! {
    "scope" => Value::from(vec![Value::from("n2"), Value::from("n3")]),
    "topology" => "flex",
    "flex_min" => 2,
  };
  h.fx.service_on("n2", "parent", parent.clone());
  h.fx.service_on("n3", "parent", parent);
  h.fx.avail("n2", "parent", Avail::Up);
  h.fx.avail("n3", "parent", Avail::Down);
  h.dependent(&["parent"]);

  h.join();
  for _ in 0..10 {
    h.tick(1.0);
    assert_eq!(h.status(DEPENDENT), ServiceStatus::WaitParents);
  }
  h.fx.avail("n3", "parent", Avail::Up);
  h.tick(1.0);
  assert_eq!(h.status(DEPENDENT), ServiceStatus::Ready);
}

#[test]
fn frozen_node_launches_nothing() {
  let dir = std::env::temp_dir().join(format!("hamon-frozen-{}", std::process::id()));
  std::fs::create_dir_all(&dir).unwrap();
  let flag = dir.join("frozen");
  std::fs::write(&flag, b"").unwrap();

  let mut h = Harness::new(&["n1", "n2"], Some(flag));
  h.fx.service_on("n2", "parent", vmap! { "scope" => Value::from(vec![Value::from("n2")]) });
  h.fx.avail("n2", "parent", Avail::Up);
  h.dependent(&["parent"]);

  h.join();
  for _ in 0..20 {
    assert!(h.tick(1.0).launched.is_empty());
    assert_eq!(h.status(DEPENDENT), ServiceStatus::Idle);
  }
  assert_eq!(h.state.nmon().status, NodeStatus::Frozen);
  let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn in_flight_start_is_never_doubled() {
  let mut h = Harness::new(&["n1"], None);
  h.dependent(&[]);
  h.launcher.hold(true);
  h.join();
  for _ in 0..30 {
    h.tick(1.0);
  }
  assert_eq!(h.launcher.count(DEPENDENT, ActionKind::Start), 1);
  assert_eq!(h.status(DEPENDENT), ServiceStatus::Starting);
  assert_eq!(h.monitor.in_flight().len(), 1);

  h.launcher.hold(false);
  let report = h.tick(1.0);
  assert_eq!(report.completed.len(), 1);
  for _ in 0..10 {
    h.tick(1.0);
  }
  assert_eq!(h.launcher.count(DEPENDENT, ActionKind::Start), 1);
  assert_eq!(h.status(DEPENDENT), ServiceStatus::Idle);
}

#[test]
fn failed_start_retries_within_budget() {
  let mut h = Harness::new(&["n1"], None);
  h.state.replace_config(DaemonConfig {
    max_start_retries: 1,
    ..(*h.state.config()).clone()
  });
  h.dependent(&[]);
  h.launcher.script(DEPENDENT, ActionKind::Start, &[1, 1]);
  h.join();
  for _ in 0..60 {
    h.tick(1.0);
  }
  assert_eq!(h.launcher.count(DEPENDENT, ActionKind::Start), 2);
  assert_eq!(h.status(DEPENDENT), ServiceStatus::StartFailed);

  h.state
    .set_smon(
      DEPENDENT,
      hamon::daemon::SmonUpdate {
        status: Some(ServiceStatus::Idle),
        reset_retries: true,
        ..Default::default()
      },
    )
    .unwrap();
  for _ in 0..10 {
    h.tick(1.0);
  }
  assert_eq!(h.launcher.count(DEPENDENT, ActionKind::Start), 3);
  assert_eq!(h.status(DEPENDENT), ServiceStatus::Idle);
}

#[test]
fn shutdown_stops_everything_then_exits() {
  let mut h = Harness::new(&["n1"], None);
  h.dependent(&[]);
  h.source.set_avail(DEPENDENT, Avail::Up);
  h.join();
  h.tick(1.0);
  assert_eq!(h.status(DEPENDENT), ServiceStatus::Idle);

  h.state
    .set_nmon(hamon::daemon::NmonUpdate {
      global_expect: hamon::cluster::Change::Set(hamon::cluster::NodeGlobalExpect::Shutdown),
      ..Default::default()
    })
    .unwrap();
  let mut exit = false;
  for _ in 0..5 {
    let report = h.tick(1.0);
    assert_eq!(report.node_status, NodeStatus::Shutting);
    if report.exit {
      exit = true;
      break;
    }
  }
  assert!(exit);
  assert_eq!(h.launcher.count(DEPENDENT, ActionKind::Stop), 1);
  assert_eq!(h.launcher.count(DEPENDENT, ActionKind::Start), 0);
}
