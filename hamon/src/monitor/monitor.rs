use crate::cluster::data::{instance_path, node_path};
use crate::cluster::{
  ClusterView, NodeData, NodeStatus, PeerError, PeerMessage, PeerTransport, ServiceStatus,
};
use crate::core::{DataError, Value};
use crate::daemon::{now, DaemonState, StateError};
use crate::monitor::actions::{terminate_all, Action, ActionHandle, Launcher};
use crate::monitor::config::{ConfigError, DaemonConfig};
use crate::monitor::nmon::{self, NodeContext};
use crate::monitor::smon::{self, ServiceContext};
use crate::monitor::status::{Refreshed, RefreshPool, StatusSource};
use crate::vmap;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

#[derive(Error, Debug)]
pub enum MonitorError {
  #[error(transparent)]
  State(#[from] StateError),
  #[error(transparent)]
  Data(#[from] DataError),
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error(transparent)]
  Peer(#[from] PeerError),
}

/// Something observable happened during a tick.
#[derive(Clone, Debug, PartialEq)]
pub enum MonitorEvent {
  NodeTransition {
    from: NodeStatus,
    to: NodeStatus,
    reason: String,
  },
  ServiceTransition {
    path: String,
    from: ServiceStatus,
    to: ServiceStatus,
    reason: String,
  },
  ActionLaunched(Action),
  /// `code` is `None` when the action could not be launched at all.
  ActionDone { action: Action, code: Option<i32> },
}

/// What one tick did.
#[derive(Clone, Debug, Default)]
pub struct TickReport {
  pub node_status: NodeStatus,
  pub launched: Vec<Action>,
  pub completed: Vec<(Action, i32)>,
  /// Services whose evaluation failed this tick, with the error.
  pub failed: Vec<(String, String)>,
  /// Peers whose data was dropped.
  pub purged: Vec<String>,
  /// Patches to broadcast, oldest first. Empty when the local blob did not change.
  pub outgoing: Vec<PeerMessage>,
  /// The node is shutting down and nothing runs locally anymore.
  pub exit: bool,
}

struct InFlight {
  action: Action,
  handle: Box<dyn ActionHandle>,
  started: f64,
}

/// The orchestration loop of one node.
///
/// Each tick reaps finished actions, ingests refreshed instance statuses, runs the node state
/// machine, then evaluates every local service against one snapshot of the cluster data and
/// launches at most one action per service. Only this loop launches actions, so the in-flight
/// table needs no lock.
pub struct Monitor {
  state: Arc<DaemonState>,
  launcher: Arc<dyn Launcher>,
  refresh: RefreshPool,
  procs: BTreeMap<String, InFlight>,
  subscribers: Vec<Sender<MonitorEvent>>,
  transport: Option<Arc<dyn PeerTransport>>,
}
impl Monitor {
  pub fn new(
    state: Arc<DaemonState>,
    launcher: Arc<dyn Launcher>,
    source: Arc<dyn StatusSource>,
  ) -> Monitor {
    let workers = state.config().workers;
    Monitor {
      state: state,
      launcher: launcher,
      refresh: RefreshPool::new(source, workers),
      procs: BTreeMap::new(),
      subscribers: Vec::new(),
      transport: None,
    }
  }

  /// Patches produced by [`run`](Self::run) go out through `transport`.
  pub fn with_transport(mut self, transport: Arc<dyn PeerTransport>) -> Monitor {
    self.transport = Some(transport);
    self
  }

  pub fn state(&self) -> &Arc<DaemonState> {
    &self.state
  }

  pub fn subscribe(&mut self) -> Receiver<MonitorEvent> {
    let (tx, rx) = unbounded();
    self.subscribers.push(tx);
    rx
  }

  /// Services with an action running.
  pub fn in_flight(&self) -> Vec<(String, Action)> {
    self
      .procs
      .iter()
      .map(|(path, p)| (path.clone(), p.action.clone()))
      .collect()
  }

  fn emit(&mut self, event: MonitorEvent) {
    self.subscribers.retain(|s| s.send(event.clone()).is_ok());
  }

  /// Runs one tick at wall clock time.
  pub fn tick(&mut self) -> Result<TickReport, MonitorError> {
    self.tick_at(now())
  }

  /// Runs one tick, `at` being the current time in epoch seconds.
  pub fn tick_at(&mut self, at: f64) -> Result<TickReport, MonitorError> {
    let mut report = TickReport::default();
    match self.state.reload_config() {
      Ok(true) => info!(generation = self.state.generation(), "configuration reloaded"),
      Ok(false) => {}
      Err(e) => error!(error = %e, "configuration reload failed, keeping the previous one"),
    }
    let config = self.state.config();

    self.reap(at, &mut report)?;
    self.ingest_statuses()?;

    let live = self.state.heartbeats.beating_at(Instant::now());
    let declared = self.state.cluster_nodes();
    let view = self.view(at, &live, &declared, &config);
    let (node_status, hold, node_frozen) = self.evaluate_node(at, &view, &config)?;
    report.node_status = node_status;

    if !hold {
      let view = self.view(at, &live, &declared, &config);
      for path in view.local_services() {
        if let Err(e) =
          self.orchestrate(at, &view, &path, node_status, node_frozen, &config, &mut report)
        {
          error!(%path, error = %e, "service evaluation failed");
          report.failed.push((path, e.to_string()));
        }
      }
      self.drop_orphans(&view)?;
    }

    report.purged = self.purge_down_peers(at, &live, &config)?;
    self.stamp(at)?;

    if node_status == NodeStatus::Shutting && self.procs.is_empty() {
      let view = self.view(at, &live, &declared, &config);
      report.exit = view
        .local_instances()
        .iter()
        .all(|p| !view.avail(view.local(), p).is_running());
    }
    report.outgoing = self.state.publisher().next_patches(&self.state.data, at);
    Ok(report)
  }

  fn view(
    &self,
    at: f64,
    live: &BTreeSet<String>,
    declared: &[String],
    config: &DaemonConfig,
  ) -> ClusterView {
    ClusterView::build(
      self.state.nodename(),
      at,
      &self.state.data.snapshot(),
      live,
      declared,
      config.stale_after,
    )
    .with_desynced(self.state.peers.desynced())
  }

  fn reap(&mut self, at: f64, report: &mut TickReport) -> Result<(), MonitorError> {
    let done = self
      .procs
      .iter_mut()
      .filter_map(|(path, p)| p.handle.poll().map(|code| (path.clone(), code)))
      .collect::<Vec<_>>();
    for (path, code) in done {
      if let Some(p) = self.procs.remove(&path) {
        debug!(action = %p.action, code, elapsed = at - p.started, "action ended");
        self.complete(&p.action, Some(code), at)?;
        report.completed.push((p.action, code));
      }
    }
    Ok(())
  }

  /// Applies the outcome bound to `action` at launch. A `None` code means the launch failed.
  fn complete(&mut self, action: &Action, code: Option<i32>, at: f64) -> Result<(), MonitorError> {
    let outcome = action.outcome();
    let success = code == Some(0);
    let mut from = ServiceStatus::Idle;
    let mut to = ServiceStatus::Idle;
    self.state.update_smon_at(&action.path, at, |m| {
      from = m.status;
      if success {
        m.status = outcome.success;
        m.local_expect = outcome.success_expect.apply(m.local_expect);
      } else {
        m.status = outcome.failure;
      }
      to = m.status;
    })?;
    if !success {
      warn!(%action, code = ?code, "action failed");
    }
    self.refresh.submit(&action.path);
    self.emit(MonitorEvent::ActionDone {
      action: action.clone(),
      code: code,
    });
    if from != to {
      let reason = match code {
        Some(code) => format!("{} exited {}", action.kind, code),
        None => format!("{} could not be launched", action.kind),
      };
      info!(path = %action.path, %from, %to, %reason, "service transition");
      self.emit(MonitorEvent::ServiceTransition {
        path: action.path.clone(),
        from: from,
        to: to,
        reason: reason,
      });
    }
    Ok(())
  }

  fn ingest_statuses(&mut self) -> Result<(), MonitorError> {
    let configs = node_path(self.state.nodename()).child("services").child("config");
    if let Some(services) = self.state.data.get_or(&configs, Value::Null).as_map() {
      for path in services.keys() {
        self.refresh.submit(path);
      }
    }
    for Refreshed { path, read_at, result } in self.refresh.drain() {
      match result {
        Ok(Some(Value::Map(mut doc))) => {
          if !doc.contains_key("updated") {
            doc.insert("updated".to_string(), Value::from(read_at));
          }
          self.state.post_instance_status(&path, Value::Map(doc))?;
        }
        Ok(Some(other)) => warn!(%path, kind = other.kind(), "instance status is not a map"),
        Ok(None) => trace!(%path, "no instance status yet"),
        Err(e) => warn!(%path, error = %e, "instance status refresh failed"),
      }
    }
    Ok(())
  }

  /// Runs the node state machine. Returns the node status, whether services are held, and
  /// whether the node is frozen.
  fn evaluate_node(
    &mut self,
    at: f64,
    view: &ClusterView,
    config: &DaemonConfig,
  ) -> Result<(NodeStatus, bool, bool), MonitorError> {
    let local = view.local();
    let nmon = view
      .node_monitor(local)
      .cloned()
      .unwrap_or_else(|| self.state.nmon());
    let flag = config
      .freeze_flag
      .as_ref()
      .map(|p| p.exists())
      .unwrap_or(false);
    let frozen = flag || view.local_node().map(NodeData::is_frozen).unwrap_or(false);
    let drainable_down = view.local_services().iter().all(|p| {
      view
        .service_config(p)
        .map(|c| c.always_on)
        .unwrap_or(false)
        || !view.avail(local, p).is_running()
    });
    let live_nodes = view
      .cluster_nodes()
      .into_iter()
      .filter(|n| view.node(n).is_some() && view.is_alive(n) && !view.is_stale(n))
      .collect::<Vec<_>>();
    let frozen_on = |n: &String| {
      if n == local {
        frozen
      } else {
        view.node_frozen(n).unwrap_or(false)
      }
    };
    let ctx = NodeContext {
      nmon: &nmon,
      frozen: frozen,
      config_loaded: true,
      peers_known: view.peers_known() || view.declared_peers().is_empty(),
      uptime: at - self.state.started_at(),
      rejoin_grace_period: config.rejoin_grace_period.as_secs_f64(),
      drainable_down: drainable_down,
      cluster_frozen: live_nodes.iter().all(frozen_on),
      cluster_thawed: !live_nodes.iter().any(frozen_on),
    };
    let decision = nmon::evaluate(&ctx);
    if decision.degraded {
      warn!(
        grace = ?config.rejoin_grace_period,
        "no peer data within the rejoin grace period, orchestrating with what is known"
      );
    }
    let mut frozen = frozen;
    if let Some(freeze) = decision.freeze {
      self.set_node_frozen(freeze, at, config)?;
      frozen = freeze;
    }
    self.state.update_nmon_at(at, |m| {
      if let Some(status) = decision.status {
        m.status = status;
      }
      if decision.clear_global_expect {
        m.global_expect = None;
      }
    })?;
    let status = decision.status.unwrap_or(nmon.status);
    if status != nmon.status {
      info!(from = %nmon.status, to = %status, reason = decision.reason, "node transition");
      self.emit(MonitorEvent::NodeTransition {
        from: nmon.status,
        to: status,
        reason: decision.reason.to_string(),
      });
    }
    Ok((status, decision.hold_services, frozen))
  }

  fn set_node_frozen(
    &self,
    frozen: bool,
    at: f64,
    config: &DaemonConfig,
  ) -> Result<(), MonitorError> {
    if let Some(flag) = &config.freeze_flag {
      let done = if frozen {
        std::fs::write(flag, b"")
      } else {
        match std::fs::remove_file(flag) {
          Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
          other => other,
        }
      };
      if let Err(e) = done {
        warn!(flag = %flag.display(), error = %e, "cannot update the freeze flag");
      }
    }
    self.state.set_frozen(frozen, at)?;
    Ok(())
  }

  #[allow(clippy::too_many_arguments)]
  fn orchestrate(
    &mut self,
    at: f64,
    view: &ClusterView,
    path: &str,
    node_status: NodeStatus,
    node_frozen: bool,
    config: &DaemonConfig,
    report: &mut TickReport,
  ) -> Result<(), MonitorError> {
    let svc_config = match view.local_node().and_then(|n| n.services_config.get(path)) {
      Some(c) => c,
      None => return Ok(()),
    };
    let smon = view
      .instance_status(view.local(), path)
      .map(|i| i.monitor.clone())
      .unwrap_or_default();
    let in_flight = self.procs.get(path).map(|p| p.action.kind);
    let decision = smon::evaluate(&ServiceContext {
      path: path,
      view: view,
      config: svc_config,
      smon: &smon,
      node_status: node_status,
      node_frozen: node_frozen,
      in_flight: in_flight,
      now: at,
      ready_period: config.ready_period.as_secs_f64(),
      max_start_retries: config.max_start_retries,
    });
    self.state.update_smon_at(path, at, |m| {
      m.status = decision.status;
      m.local_expect = decision.local_expect.apply(m.local_expect);
      if decision.clear_global_expect {
        m.global_expect = None;
      }
      if let Some(key) = &decision.restart_inc {
        *m.restart.entry(key.clone()).or_insert(0) += 1;
      }
      if let Some(key) = &decision.restart_reset {
        m.restart.remove(key);
      }
    })?;
    if decision.status != smon.status {
      info!(
        %path,
        from = %smon.status,
        to = %decision.status,
        reason = %decision.reason,
        "service transition"
      );
      self.emit(MonitorEvent::ServiceTransition {
        path: path.to_string(),
        from: smon.status,
        to: decision.status,
        reason: decision.reason.clone(),
      });
    } else {
      trace!(%path, status = %decision.status, reason = %decision.reason, "service unchanged");
    }
    if let Some(action) = decision.action {
      if in_flight.is_none() {
        self.launch(action, at, report)?;
      }
    }
    Ok(())
  }

  fn launch(
    &mut self,
    action: Action,
    at: f64,
    report: &mut TickReport,
  ) -> Result<(), MonitorError> {
    match self.launcher.launch(&action) {
      Ok(handle) => {
        info!(%action, pid = ?handle.pid(), "action launched");
        self.emit(MonitorEvent::ActionLaunched(action.clone()));
        report.launched.push(action.clone());
        self.procs.insert(
          action.path.clone(),
          InFlight {
            action: action,
            handle: handle,
            started: at,
          },
        );
      }
      Err(e) => {
        error!(%action, error = %e, "cannot launch action");
        self.complete(&action, None, at)?;
      }
    }
    Ok(())
  }

  /// Instance records of services no longer configured go away once nothing runs for them.
  fn drop_orphans(&mut self, view: &ClusterView) -> Result<(), MonitorError> {
    let configured = view.local_services().into_iter().collect::<BTreeSet<_>>();
    for path in view.local_instances() {
      if !configured.contains(&path) && !self.procs.contains_key(&path) {
        debug!(%path, "dropping the record of an unconfigured service");
        self.state.data.unset_safe(&instance_path(view.local(), &path))?;
      }
    }
    Ok(())
  }

  /// Drops the data of peers no heartbeat reports beating. A peer that announced maintenance
  /// keeps its data for the rejoin grace period.
  fn purge_down_peers(
    &mut self,
    at: f64,
    live: &BTreeSet<String>,
    config: &DaemonConfig,
  ) -> Result<Vec<String>, MonitorError> {
    let snapshot = self.state.data.snapshot();
    let local = self.state.nodename();
    let known = snapshot
      .get("cluster")
      .and_then(|c| c.get("nodes"))
      .and_then(Value::as_map)
      .map(|m| m.keys().cloned().collect::<Vec<_>>())
      .unwrap_or_default();
    let mut purged = Vec::new();
    for peer in known {
      if peer == local || live.contains(&peer) {
        continue;
      }
      let nmon = snapshot
        .get("cluster")
        .and_then(|c| c.get("nodes"))
        .and_then(|n| n.get(&peer))
        .map(|blob| NodeData::from_value(&peer, blob).monitor)
        .unwrap_or_default();
      if nmon.status == NodeStatus::Maintenance
        && at - nmon.status_updated < config.rejoin_grace_period.as_secs_f64()
      {
        trace!(%peer, "peer in maintenance, keeping its data");
        continue;
      }
      info!(%peer, "peer down, purging its data");
      self.state.peers.purge(&self.state.data, &peer)?;
      purged.push(peer);
    }
    Ok(purged)
  }

  fn stamp(&self, at: f64) -> Result<(), MonitorError> {
    let node = node_path(self.state.nodename());
    let mut guard = self.state.data.lock();
    guard.set(
      &node.child("stats"),
      vmap! {
        "procs" => self.procs.len() as i64,
        "tick" => at,
      },
    )?;
    guard.set(&node.child("updated"), Value::from(at))?;
    Ok(())
  }

  /// Ticks until a shutdown completes or a stop is requested, sleeping `monitor_period` between
  /// ticks unless woken earlier. Running actions are terminated on the way out.
  pub async fn run(mut self) -> Result<(), MonitorError> {
    let state = self.state.clone();
    info!(node = %state.nodename(), "monitor started");
    if let Some(transport) = self.transport.clone() {
      let full = state.publisher().full(&state.data, now());
      if let Err(e) = transport.broadcast(&full).await {
        warn!(error = %e, "cannot announce local data");
      }
    }
    loop {
      if state.stop_requested() {
        // No more ticks: peers must see the node as the stop request left it.
        let pending = state.publisher().next_patches(&state.data, now());
        self.broadcast(pending).await;
        info!("stop requested");
        break;
      }
      let report = match self.tick() {
        Ok(report) => report,
        Err(e) => {
          error!(error = %e, "tick failed");
          TickReport::default()
        }
      };
      self.broadcast(report.outgoing).await;
      if report.exit {
        info!("every local service is down, shutdown complete");
        break;
      }
      let period = state.config().monitor_period;
      tokio::select! {
        _ = state.woken() => {}
        _ = tokio::time::sleep(period) => {}
      }
    }
    self.terminate_actions().await;
    Ok(())
  }

  async fn broadcast(&self, msgs: Vec<PeerMessage>) {
    let transport = match &self.transport {
      Some(transport) => transport.clone(),
      None => return,
    };
    for msg in msgs {
      if let Err(e) = transport.broadcast(&msg).await {
        warn!(error = %e, id = msg.id(), "cannot broadcast patch");
      }
    }
  }

  /// Signals every running action and waits up to `stop_tmo` before killing what is left.
  pub async fn terminate_actions(&mut self) {
    if self.procs.is_empty() {
      return;
    }
    let stop_tmo = self.state.config().stop_tmo;
    let count = self.procs.len();
    let mut handles = self
      .procs
      .values_mut()
      .map(|p| &mut p.handle)
      .collect::<Vec<_>>();
    let killed = terminate_all(&mut handles, stop_tmo).await;
    info!(count, killed, "running actions terminated");
    self.procs.clear();
  }
}

#[cfg(test)]
use crate::cluster::data::smon_path;
#[cfg(test)]
use crate::cluster::Avail;
#[cfg(test)]
use crate::cluster::ServiceMonitor;
#[cfg(test)]
use crate::monitor::actions::ActionKind;
#[cfg(test)]
use crate::listener::{dispatch, Request};
#[cfg(test)]
use crate::testkit::{ChannelTransport, ClusterFixture, FakeLauncher, MemoryStatusSource};

#[cfg(test)]
fn single_node() -> (Monitor, FakeLauncher, MemoryStatusSource) {
  let config = DaemonConfig {
    nodename: "n1".to_string(),
    nodes: vec!["n1".to_string()],
    workers: 0,
    ..DaemonConfig::default()
  };
  let state = Arc::new(DaemonState::new(config));
  let launcher = FakeLauncher::new();
  let source = MemoryStatusSource::new();
  let monitor = Monitor::new(state, Arc::new(launcher.clone()), Arc::new(source.clone()));
  (monitor, launcher, source)
}

#[cfg(test)]
fn smon_of(monitor: &Monitor, path: &str) -> ServiceMonitor {
  monitor
    .state()
    .data
    .get(&smon_path("n1", path))
    .unwrap()
    .decode()
    .unwrap()
}

#[test]
fn test_startup_then_start() {
  let (mut monitor, launcher, source) = single_node();
  let effect = source.clone();
  launcher.on_exit(move |action, code| {
    if action.kind == ActionKind::Start && code == 0 {
      effect.set_avail(&action.path, Avail::Up);
    }
  });
  let scope = Value::from(vec![Value::from("n1")]);
  monitor
    .state()
    .post_service_config("svc", vmap! { "scope" => scope, "orchestrate" => "ha" })
    .unwrap();
  source.set_avail("svc", Avail::Down);

  let t0 = 1000.0;
  // init -> rejoin, rejoin -> idle
  assert_eq!(monitor.tick_at(t0).unwrap().node_status, NodeStatus::Rejoin);
  assert_eq!(monitor.tick_at(t0).unwrap().node_status, NodeStatus::Idle);
  assert_eq!(smon_of(&monitor, "svc").status, ServiceStatus::Ready);
  assert!(monitor.tick_at(t0 + 1.0).unwrap().launched.is_empty());
  let report = monitor.tick_at(t0 + 5.0).unwrap();
  assert_eq!(report.launched, vec![Action::new("svc", ActionKind::Start)]);
  assert_eq!(smon_of(&monitor, "svc").status, ServiceStatus::Starting);

  let report = monitor.tick_at(t0 + 6.0).unwrap();
  assert_eq!(report.completed.len(), 1);
  assert!(report.launched.is_empty());
  let smon = smon_of(&monitor, "svc");
  assert_eq!(smon.status, ServiceStatus::Idle);
  assert_eq!(smon.local_expect, Some(crate::cluster::ServiceLocalExpect::Started));
  for i in 0..5 {
    assert!(monitor.tick_at(t0 + 7.0 + i as f64).unwrap().launched.is_empty());
  }
  assert_eq!(launcher.count("svc", ActionKind::Start), 1);
}

#[test]
fn test_launch_failure_is_immediate() {
  let (mut monitor, launcher, source) = single_node();
  launcher.refuse(true);
  let scope = Value::from(vec![Value::from("n1")]);
  monitor
    .state()
    .post_service_config("svc", vmap! { "scope" => scope, "orchestrate" => "ha" })
    .unwrap();
  source.set_avail("svc", Avail::Down);
  let events = monitor.subscribe();
  for t in [0.0, 0.0, 0.0, 5.0, 6.0, 20.0] {
    monitor.tick_at(1000.0 + t).unwrap();
  }
  assert_eq!(smon_of(&monitor, "svc").status, ServiceStatus::StartFailed);
  assert!(events.try_iter().any(|e| matches!(
    e,
    MonitorEvent::ActionDone { code: None, .. }
  )));
  assert!(launcher.launched().is_empty());
}

#[test]
fn test_unconfigured_instance_is_dropped() {
  let (mut monitor, _launcher, _source) = single_node();
  let state = monitor.state().clone();
  state
    .set_smon_at("gone", crate::daemon::SmonUpdate::default(), 1.0)
    .unwrap();
  assert!(state.data.exists(&instance_path("n1", "gone")));
  monitor.tick_at(1000.0).unwrap();
  monitor.tick_at(1000.0).unwrap();
  assert!(!state.data.exists(&instance_path("n1", "gone")));
}

#[test]
fn test_purges_dead_peers_only() {
  let config = DaemonConfig {
    nodename: "n1".to_string(),
    nodes: vec!["n1".to_string(), "n2".to_string(), "n3".to_string()],
    workers: 0,
    ..DaemonConfig::default()
  };
  let state = Arc::new(DaemonState::new(config));
  let mut fx = ClusterFixture::new("n1", &["n1", "n2", "n3"]);
  fx.seed(&state);
  let mut monitor = Monitor::new(
    state.clone(),
    Arc::new(FakeLauncher::new()),
    Arc::new(MemoryStatusSource::new()),
  );
  assert!(monitor.tick_at(fx.now()).unwrap().purged.is_empty());
  fx.node_down("n3");
  fx.seed(&state);
  let report = monitor.tick_at(fx.now()).unwrap();
  assert_eq!(report.purged, vec!["n3".to_string()]);
  assert!(state.data.exists(&node_path("n2")));
  assert!(!state.data.exists(&node_path("n3")));
}

#[cfg(test)]
fn peer_of_n1() -> DaemonState {
  DaemonState::new(DaemonConfig {
    nodename: "n2".to_string(),
    nodes: vec!["n1".to_string(), "n2".to_string()],
    workers: 0,
    ..DaemonConfig::default()
  })
}

#[cfg(test)]
fn n1_status_seen_by(peer: &DaemonState) -> Option<String> {
  let status = node_path("n1").child("monitor").child("status");
  peer.data.get(&status).ok().and_then(|v| v.as_str().map(String::from))
}

#[test]
fn test_daemon_stop_publishes_maintenance() {
  let (mut monitor, _launcher, _source) = single_node();
  let state = monitor.state().clone();
  let peer = peer_of_n1();
  monitor.tick_at(1000.0).unwrap();
  let report = monitor.tick_at(1000.0).unwrap();
  assert_eq!(report.node_status, NodeStatus::Idle);
  let full = state.publisher().full(&state.data, 1000.0);
  peer.peers.receive(&peer.data, "n1", full);
  assert_eq!(n1_status_seen_by(&peer).as_deref(), Some("idle"));

  dispatch(&state, Request::DaemonStop).unwrap();
  let report = monitor.tick_at(1001.0).unwrap();
  assert_eq!(report.node_status, NodeStatus::Maintenance);
  assert!(report.launched.is_empty());
  for msg in report.outgoing {
    peer.peers.receive(&peer.data, "n1", msg);
  }
  assert!(peer.peers.is_trusted("n1"));
  assert_eq!(n1_status_seen_by(&peer).as_deref(), Some("maintenance"));
  assert_eq!(state.nmon().status, NodeStatus::Maintenance);
}

#[tokio::test]
async fn test_run_stops_before_ticking_again() {
  let (monitor, _launcher, _source) = single_node();
  let state = monitor.state().clone();
  let peer = peer_of_n1();
  let mut mesh = ChannelTransport::mesh(&["n1", "n2"]);
  let (_t2, inbox) = mesh.pop().unwrap();
  let (t1, _i1) = mesh.pop().unwrap();

  dispatch(&state, Request::DaemonStop).unwrap();
  let run = monitor.with_transport(Arc::new(t1)).run();
  tokio::time::timeout(std::time::Duration::from_secs(5), run)
    .await
    .unwrap()
    .unwrap();
  inbox.deliver(&peer).unwrap();
  assert_eq!(n1_status_seen_by(&peer).as_deref(), Some("maintenance"));
  assert_eq!(state.nmon().status, NodeStatus::Maintenance);
}
