use crate::cluster::placement;
use crate::cluster::{
  Avail, Change, ClusterView, NodeStatus, Orchestrate, ServiceConfig, ServiceGlobalExpect,
  ServiceInstanceStatus, ServiceLocalExpect, ServiceMonitor, ServiceStatus, Topology,
};
use crate::monitor::actions::{Action, ActionKind};
use crate::monitor::parents::{parents_state, ParentState};

/// Key of the service-level start retry counter in `smon.restart`. Other keys are resource ids.
pub const SERVICE_RETRY_KEY: &str = "service";

/// Inputs of one service instance evaluation. Everything cluster-wide comes from `view`, which
/// is shared by every service evaluated during the same tick.
#[derive(Clone, Debug)]
pub struct ServiceContext<'a> {
  pub path: &'a str,
  pub view: &'a ClusterView,
  pub config: &'a ServiceConfig,
  pub smon: &'a ServiceMonitor,
  pub node_status: NodeStatus,
  /// Local node frozen, by blob timestamp or freeze flag.
  pub node_frozen: bool,
  /// The action this node is currently running for the service.
  pub in_flight: Option<ActionKind>,
  pub now: f64,
  pub ready_period: f64,
  pub max_start_retries: u32,
}

/// The outcome of an evaluation: the monitor record changes and at most one action.
#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
  pub status: ServiceStatus,
  pub reason: String,
  pub action: Option<Action>,
  pub local_expect: Change<ServiceLocalExpect>,
  pub clear_global_expect: bool,
  /// Retry counter to increment.
  pub restart_inc: Option<String>,
  /// Retry counter to drop.
  pub restart_reset: Option<String>,
}
impl Decision {
  fn to<S: Into<String>>(status: ServiceStatus, reason: S) -> Decision {
    Decision {
      status: status,
      reason: reason.into(),
      action: None,
      local_expect: Change::Keep,
      clear_global_expect: false,
      restart_inc: None,
      restart_reset: None,
    }
  }

  fn act<S: Into<String>>(status: ServiceStatus, action: Action, reason: S) -> Decision {
    Decision {
      action: Some(action),
      ..Decision::to(status, reason)
    }
  }
}

/// Decides the next monitor status of a local service instance, and the action to launch.
///
/// Rules are tried in order, the first match wins. Nothing is launched while an action is in
/// flight, and a decision never starts anything on data it cannot see: dead or stale peers and
/// parents without data count as unknown.
pub fn evaluate(ctx: &ServiceContext) -> Decision {
  use ServiceStatus::*;
  let current = ctx.smon.status;
  if let Some(kind) = ctx.in_flight {
    return Decision::to(current, format!("{} in flight", kind));
  }
  if current.is_transient() {
    return Decision::to(Idle, format!("{} without an action in flight, revalidating", current));
  }
  let instance = ctx.view.instance_status(ctx.view.local(), ctx.path);
  let avail = instance.map(|i| i.avail).unwrap_or(Avail::Unknown);

  match ctx.node_status {
    NodeStatus::Shutting => return stop_for_node(ctx, avail, "node shutting down"),
    NodeStatus::Draining | NodeStatus::Drained if !ctx.config.always_on => {
      return stop_for_node(ctx, avail, "node draining")
    }
    _ => {}
  }
  match ctx.smon.global_expect {
    Some(ServiceGlobalExpect::Frozen) => return freeze(ctx, instance),
    Some(ServiceGlobalExpect::Thawed) => return thaw(ctx, instance),
    _ => {}
  }
  if ctx.node_frozen || instance.map(ServiceInstanceStatus::is_frozen).unwrap_or(false) {
    let reason = if ctx.node_frozen { "node frozen" } else { "instance frozen" };
    return Decision::to(if current.is_failed() { current } else { Idle }, reason);
  }
  match ctx.smon.global_expect {
    Some(ServiceGlobalExpect::Stopped) => stop(ctx, avail),
    Some(ServiceGlobalExpect::Provisioned) => provision(ctx, instance),
    _ => start(ctx, instance, avail),
  }
}

fn stop_for_node(ctx: &ServiceContext, avail: Avail, reason: &str) -> Decision {
  use ServiceStatus::*;
  if !avail.is_running() {
    return Decision {
      local_expect: clear_if_set(ctx.smon.local_expect),
      ..Decision::to(Idle, reason)
    };
  }
  if ctx.smon.status == StopFailed {
    return Decision::to(StopFailed, format!("{}, stop failed", reason));
  }
  let local = ctx.view.local();
  let children = ctx
    .view
    .children(ctx.path)
    .into_iter()
    .filter(|c| ctx.view.avail(local, c).is_running())
    .collect::<Vec<_>>();
  if !children.is_empty() {
    return Decision::to(WaitChildren, format!("{}, children up: {}", reason, children.join(", ")));
  }
  Decision::act(Stopping, Action::new(ctx.path, ActionKind::Stop), reason)
}

fn stop(ctx: &ServiceContext, avail: Avail) -> Decision {
  use ServiceStatus::*;
  let children = ctx
    .view
    .children(ctx.path)
    .into_iter()
    .filter(|c| !ctx.view.running_on(c).is_empty())
    .collect::<Vec<_>>();
  if !children.is_empty() {
    return Decision::to(WaitChildren, format!("children up: {}", children.join(", ")));
  }
  if avail.is_running() {
    if ctx.smon.status == StopFailed {
      return Decision::to(StopFailed, "stop failed");
    }
    return Decision::act(Stopping, Action::new(ctx.path, ActionKind::Stop), "stop requested");
  }
  Decision {
    local_expect: clear_if_set(ctx.smon.local_expect),
    clear_global_expect: ctx.view.running_on(ctx.path).is_empty(),
    ..Decision::to(Idle, "stopped")
  }
}

fn freeze(ctx: &ServiceContext, instance: Option<&ServiceInstanceStatus>) -> Decision {
  use ServiceStatus::*;
  if instance.map(ServiceInstanceStatus::is_frozen).unwrap_or(false) {
    let all = ctx.view.scope_instances(ctx.path).iter().all(|(_, st)| st.is_frozen());
    return Decision {
      clear_global_expect: all,
      ..Decision::to(Idle, "frozen")
    };
  }
  if ctx.smon.status == FreezeFailed {
    return Decision::to(FreezeFailed, "freeze failed");
  }
  Decision::act(Freezing, Action::new(ctx.path, ActionKind::Freeze), "freeze requested")
}

fn thaw(ctx: &ServiceContext, instance: Option<&ServiceInstanceStatus>) -> Decision {
  use ServiceStatus::*;
  if !instance.map(ServiceInstanceStatus::is_frozen).unwrap_or(false) {
    let none = ctx.view.scope_instances(ctx.path).iter().all(|(_, st)| !st.is_frozen());
    return Decision {
      clear_global_expect: none,
      ..Decision::to(Idle, "thawed")
    };
  }
  if ctx.smon.status == ThawFailed {
    return Decision::to(ThawFailed, "thaw failed");
  }
  Decision::act(Thawing, Action::new(ctx.path, ActionKind::Thaw), "thaw requested")
}

fn provision(ctx: &ServiceContext, instance: Option<&ServiceInstanceStatus>) -> Decision {
  use ServiceStatus::*;
  if instance.and_then(|i| i.provisioned).unwrap_or(false) {
    let all = ctx
      .view
      .scope_instances(ctx.path)
      .iter()
      .all(|(_, st)| st.provisioned == Some(true));
    return Decision {
      clear_global_expect: all,
      ..Decision::to(Idle, "provisioned")
    };
  }
  if ctx.smon.status == ProvisionFailed {
    return Decision::to(ProvisionFailed, "provision failed");
  }
  Decision::act(
    Provisioning,
    Action::new(ctx.path, ActionKind::Provision),
    "provision requested",
  )
}

fn start(ctx: &ServiceContext, instance: Option<&ServiceInstanceStatus>, avail: Avail) -> Decision {
  use ServiceStatus::*;
  let current = ctx.smon.status;
  let started_here = ctx.smon.local_expect == Some(ServiceLocalExpect::Started);
  let global_start = ctx.smon.global_expect == Some(ServiceGlobalExpect::Started);
  if !global_start && !started_here && ctx.config.orchestrate != Orchestrate::Ha {
    return Decision::to(Idle, "not orchestrated");
  }
  let instance = match instance {
    Some(i) => i,
    None => return Decision::to(Idle, "no local status yet"),
  };

  if avail.is_running() {
    return running(ctx, instance, started_here);
  }
  if started_here {
    if instance.updated < ctx.smon.status_updated {
      return Decision::to(current, "waiting for a status refresh");
    }
    return Decision {
      local_expect: Change::Clear,
      ..Decision::to(Idle, format!("instance went {}", avail))
    };
  }
  if avail == Avail::Unknown {
    return Decision::to(Idle, "local status unknown");
  }

  let mut retrying = false;
  if current == StartFailed {
    let used = ctx.smon.restart.get(SERVICE_RETRY_KEY).copied().unwrap_or(0);
    if used >= ctx.max_start_retries {
      return Decision::to(StartFailed, "start failed, no retry left");
    }
    let delay = ctx.ready_period * (used + 1) as f64;
    if ctx.now - ctx.smon.status_updated < delay {
      return Decision::to(StartFailed, format!("start failed, retry {} pending", used + 1));
    }
    retrying = true;
  }
  let hold = |status: ServiceStatus, reason: String| {
    Decision::to(if retrying { StartFailed } else { status }, reason)
  };

  match parents_state(ctx.view, &ctx.config.parents) {
    ParentState::Satisfied => {}
    ParentState::Unmet(reason) | ParentState::Unknown(reason) => {
      return hold(WaitParents, reason);
    }
  }

  let local = ctx.view.local();
  let elsewhere = ctx
    .view
    .running_on(ctx.path)
    .into_iter()
    .filter(|n| n != local)
    .collect::<Vec<_>>();
  let eligible = |n: &str| is_eligible(ctx, n, retrying);
  match ctx.config.topology {
    Topology::Failover => {
      if let Some(n) = elsewhere.first() {
        return Decision {
          clear_global_expect: global_start && start_satisfied(ctx),
          ..hold(Idle, format!("running on {}", n))
        };
      }
      match placement::leader(ctx.config.placement, ctx.path, &ctx.config.scope, eligible) {
        Some(leader) if leader == local => {}
        Some(leader) => return hold(WaitLeader, format!("leader is {}", leader)),
        None => return hold(Idle, "no eligible node".to_string()),
      }
    }
    Topology::Flex => {
      let running = elsewhere.len();
      let target = if global_start {
        ctx.config.flex_max()
      } else {
        ctx.config.flex_min
      };
      if running >= ctx.config.flex_max() {
        return hold(Idle, format!("flex_max {} reached", ctx.config.flex_max()));
      }
      if running >= target {
        return Decision {
          clear_global_expect: global_start && start_satisfied(ctx),
          ..hold(Idle, format!("{} instances up", running))
        };
      }
      let candidates = placement::ranked(ctx.config.placement, ctx.path, &ctx.config.scope, |n| {
        !elsewhere.iter().any(|e| e == n) && eligible(n)
      });
      match candidates.iter().position(|n| n == local) {
        Some(rank) if rank < target - running => {}
        Some(_) => return hold(Idle, "enough better ranked candidates".to_string()),
        None => return hold(Idle, "not eligible".to_string()),
      }
    }
  }

  if current != Ready {
    return Decision {
      restart_inc: if retrying { Some(SERVICE_RETRY_KEY.to_string()) } else { None },
      ..Decision::to(Ready, "start conditions met")
    };
  }
  let waited = ctx.now - ctx.smon.status_updated;
  if waited < ctx.ready_period {
    return Decision::to(Ready, format!("ready for {:.1}s", waited));
  }
  Decision::act(Starting, Action::new(ctx.path, ActionKind::Start), "ready period elapsed")
}

fn running(ctx: &ServiceContext, instance: &ServiceInstanceStatus, started_here: bool) -> Decision {
  use ServiceStatus::*;
  let down = instance
    .resources
    .iter()
    .find(|(_, r)| r.monitor && r.status == Avail::Down);
  if let Some((rid, res)) = down {
    if !started_here {
      return Decision::to(Idle, format!("monitored resource {} down", rid));
    }
    let used = ctx.smon.restart.get(rid).copied().unwrap_or(0);
    if used < res.restart {
      return Decision {
        restart_inc: Some(rid.clone()),
        ..Decision::act(
          Restarting,
          Action::on_resource(ctx.path, ActionKind::Start, rid),
          format!("monitored resource {} down, restart {}/{}", rid, used + 1, res.restart),
        )
      };
    }
    return Decision {
      local_expect: Change::Clear,
      ..Decision::to(Idle, format!("monitored resource {} down, no restart left", rid))
    };
  }
  Decision {
    local_expect: if started_here {
      Change::Keep
    } else {
      Change::Set(ServiceLocalExpect::Started)
    },
    clear_global_expect: ctx.smon.global_expect == Some(ServiceGlobalExpect::Started)
      && start_satisfied(ctx),
    restart_reset: if ctx.smon.restart.contains_key(SERVICE_RETRY_KEY) {
      Some(SERVICE_RETRY_KEY.to_string())
    } else {
      None
    },
    ..Decision::to(Idle, "up")
  }
}

/// Whether `node` may run a new instance of the service.
fn is_eligible(ctx: &ServiceContext, node: &str, retrying: bool) -> bool {
  let view = ctx.view;
  if !view.is_alive(node) || view.is_stale(node) {
    return false;
  }
  match view.node_monitor(node) {
    Some(m) if m.status == NodeStatus::Idle => {}
    _ => return false,
  }
  if view.node_frozen(node).unwrap_or(true) {
    return false;
  }
  let inst = match view.instance_status(node, ctx.path) {
    Some(inst) => inst,
    None => return false,
  };
  if inst.is_frozen() || !inst.constraints {
    return false;
  }
  if inst.monitor.status == ServiceStatus::StartFailed && !(retrying && node == view.local()) {
    return false;
  }
  true
}

/// The cluster-wide condition of `global_expect = started`.
fn start_satisfied(ctx: &ServiceContext) -> bool {
  match ctx.config.topology {
    Topology::Failover => ctx.view.up_count(ctx.path) >= 1,
    Topology::Flex => ctx.view.up_count(ctx.path) >= ctx.config.flex_min,
  }
}

fn clear_if_set<T>(current: Option<T>) -> Change<T> {
  match current {
    Some(_) => Change::Clear,
    None => Change::Keep,
  }
}

#[cfg(test)]
use crate::core::Value;
#[cfg(test)]
use crate::testkit::ClusterFixture;
#[cfg(test)]
use crate::vmap;

#[cfg(test)]
fn eval(fx: &ClusterFixture, path: &str) -> Decision {
  eval_with(fx, path, None)
}

#[cfg(test)]
fn eval_with(fx: &ClusterFixture, path: &str, in_flight: Option<ActionKind>) -> Decision {
  let view = fx.view();
  let config = view.service_config(path).cloned().unwrap();
  let smon = view
    .instance_status(view.local(), path)
    .map(|i| i.monitor.clone())
    .unwrap_or_default();
  evaluate(&ServiceContext {
    path: path,
    view: &view,
    config: &config,
    smon: &smon,
    node_status: view.node_monitor(view.local()).map(|m| m.status).unwrap_or_default(),
    node_frozen: view.local_node().map(|n| n.is_frozen()).unwrap_or(false),
    in_flight: in_flight,
    now: fx.now(),
    ready_period: 5.0,
    max_start_retries: 1,
  })
}

#[test]
fn test_not_orchestrated_stays_idle() {
  let mut fx = ClusterFixture::new("n1", &["n1"]);
  fx.service("svc", vmap! { "scope" => fx.scope() });
  fx.avail("n1", "svc", Avail::Down);
  let d = eval(&fx, "svc");
  assert_eq!((d.status, d.action), (ServiceStatus::Idle, None));
}

#[test]
fn test_ha_start_goes_through_ready() {
  let mut fx = ClusterFixture::new("n1", &["n1", "n2"]);
  fx.service("svc", vmap! { "scope" => fx.scope(), "orchestrate" => "ha" });
  fx.avail("n1", "svc", Avail::Down);
  fx.avail("n2", "svc", Avail::Down);
  let d = eval(&fx, "svc");
  assert_eq!((d.status, d.action.clone()), (ServiceStatus::Ready, None));

  fx.smon("n1", "svc", vmap! { "status" => "ready", "status_updated" => fx.now() - 2.0 });
  assert_eq!(eval(&fx, "svc").status, ServiceStatus::Ready);
  fx.smon("n1", "svc", vmap! { "status" => "ready", "status_updated" => fx.now() - 5.0 });
  let d = eval(&fx, "svc");
  assert_eq!(d.status, ServiceStatus::Starting);
  assert_eq!(d.action, Some(Action::new("svc", ActionKind::Start)));

  fx.smon("n1", "svc", vmap! { "status" => "starting" });
  let d = eval_with(&fx, "svc", Some(ActionKind::Start));
  assert_eq!((d.status, d.action), (ServiceStatus::Starting, None));
  let d = eval(&fx, "svc");
  assert_eq!((d.status, d.action), (ServiceStatus::Idle, None));
}

#[test]
fn test_failover_only_leader_starts() {
  let mut fx = ClusterFixture::new("n2", &["n1", "n2"]);
  fx.service("svc", vmap! { "scope" => fx.scope(), "orchestrate" => "ha" });
  fx.avail("n1", "svc", Avail::Down);
  fx.avail("n2", "svc", Avail::Down);
  let d = eval(&fx, "svc");
  assert_eq!(d.status, ServiceStatus::WaitLeader);
  assert_eq!(d.reason, "leader is n1");

  fx.freeze_node("n1");
  assert_eq!(eval(&fx, "svc").status, ServiceStatus::Ready);
  fx.thaw_node("n1");
  fx.node_down("n1");
  assert_eq!(eval(&fx, "svc").status, ServiceStatus::Ready);
}

#[test]
fn test_failover_running_elsewhere() {
  let mut fx = ClusterFixture::new("n1", &["n1", "n2"]);
  fx.service("svc", vmap! { "scope" => fx.scope(), "orchestrate" => "ha" });
  fx.avail("n1", "svc", Avail::Down);
  fx.avail("n2", "svc", Avail::Up);
  fx.smon("n1", "svc", vmap! { "status" => "idle", "global_expect" => "started" });
  let d = eval(&fx, "svc");
  assert_eq!(d.status, ServiceStatus::Idle);
  assert_eq!(d.reason, "running on n2");
  assert!(d.clear_global_expect);
}

#[test]
fn test_up_sets_local_expect_and_restarts_resources() {
  let mut fx = ClusterFixture::new("n1", &["n1"]);
  fx.service("svc", vmap! { "scope" => fx.scope(), "orchestrate" => "ha" });
  fx.avail("n1", "svc", Avail::Up);
  let d = eval(&fx, "svc");
  assert_eq!(d.local_expect, Change::Set(ServiceLocalExpect::Started));

  fx.smon("n1", "svc", vmap! { "status" => "idle", "local_expect" => "started" });
  fx.resource("n1", "svc", "app#1", vmap! { "status" => "down", "monitor" => true, "restart" => 1 });
  let d = eval(&fx, "svc");
  assert_eq!(d.status, ServiceStatus::Restarting);
  assert_eq!(d.action, Some(Action::on_resource("svc", ActionKind::Start, "app#1")));
  assert_eq!(d.restart_inc, Some("app#1".to_string()));

  fx.smon(
    "n1",
    "svc",
    vmap! { "status" => "idle", "local_expect" => "started", "restart" => vmap! { "app#1" => 1 } },
  );
  let d = eval(&fx, "svc");
  assert_eq!((d.status, d.local_expect), (ServiceStatus::Idle, Change::Clear));
}

#[test]
fn test_start_failed_retry_budget() {
  let mut fx = ClusterFixture::new("n1", &["n1"]);
  fx.service("svc", vmap! { "scope" => fx.scope(), "orchestrate" => "ha" });
  fx.avail("n1", "svc", Avail::Down);
  fx.smon("n1", "svc", vmap! { "status" => "start failed", "status_updated" => fx.now() - 1.0 });
  assert_eq!(eval(&fx, "svc").status, ServiceStatus::StartFailed);
  fx.smon("n1", "svc", vmap! { "status" => "start failed", "status_updated" => fx.now() - 6.0 });
  let d = eval(&fx, "svc");
  assert_eq!(d.status, ServiceStatus::Ready);
  assert_eq!(d.restart_inc, Some(SERVICE_RETRY_KEY.to_string()));
  fx.smon(
    "n1",
    "svc",
    vmap! { "status" => "start failed", "status_updated" => 0.0, "restart" => vmap! { "service" => 1 } },
  );
  assert_eq!(eval(&fx, "svc").reason, "start failed, no retry left");
}

#[test]
fn test_stop_waits_for_children() {
  let mut fx = ClusterFixture::new("n1", &["n1", "n2"]);
  fx.service("db", vmap! { "scope" => fx.scope() });
  fx.service("app", vmap! { "scope" => fx.scope(), "parents" => Value::from(vec![Value::from("db")]) });
  fx.avail("n1", "db", Avail::Up);
  fx.avail("n2", "app", Avail::Up);
  fx.smon("n1", "db", vmap! { "status" => "idle", "global_expect" => "stopped" });
  assert_eq!(eval(&fx, "db").status, ServiceStatus::WaitChildren);
  fx.avail("n2", "app", Avail::Down);
  let d = eval(&fx, "db");
  assert_eq!(d.status, ServiceStatus::Stopping);
  assert_eq!(d.action, Some(Action::new("db", ActionKind::Stop)));
  fx.avail("n1", "db", Avail::Down);
  assert!(eval(&fx, "db").clear_global_expect);
}

#[test]
fn test_freeze_expect_acts_even_when_frozen() {
  let mut fx = ClusterFixture::new("n1", &["n1"]);
  fx.service("svc", vmap! { "scope" => fx.scope() });
  fx.avail("n1", "svc", Avail::Up);
  fx.smon("n1", "svc", vmap! { "status" => "idle", "global_expect" => "frozen" });
  assert_eq!(eval(&fx, "svc").action, Some(Action::new("svc", ActionKind::Freeze)));
  fx.instance_field("n1", "svc", "frozen", Value::from(12.0));
  let d = eval(&fx, "svc");
  assert_eq!((d.status, d.clear_global_expect), (ServiceStatus::Idle, true));
  fx.smon("n1", "svc", vmap! { "status" => "idle", "global_expect" => "thawed" });
  assert_eq!(eval(&fx, "svc").action, Some(Action::new("svc", ActionKind::Thaw)));
}

#[test]
fn test_drain_stops_all_but_always_on() {
  let mut fx = ClusterFixture::new("n1", &["n1"]);
  fx.service("svc", vmap! { "scope" => fx.scope() });
  fx.service("keep", vmap! { "scope" => fx.scope(), "always_on" => true });
  fx.avail("n1", "svc", Avail::Up);
  fx.avail("n1", "keep", Avail::Up);
  fx.set_node_status("n1", NodeStatus::Draining);
  assert_eq!(eval(&fx, "svc").status, ServiceStatus::Stopping);
  assert_eq!(eval(&fx, "keep").action, None);
  fx.set_node_status("n1", NodeStatus::Shutting);
  assert_eq!(eval(&fx, "keep").status, ServiceStatus::Stopping);
}

#[test]
fn test_flex_bounds() {
  let mut fx = ClusterFixture::new("n3", &["n1", "n2", "n3"]);
  fx.service(
    "web",
    vmap! { "scope" => fx.scope(), "orchestrate" => "ha", "topology" => "flex", "flex_min" => 2, "flex_max" => 2 },
  );
  fx.avail("n1", "web", Avail::Up);
  fx.avail("n2", "web", Avail::Down);
  fx.avail("n3", "web", Avail::Down);
  // n2 ranks before n3 for the single missing instance.
  assert_eq!(eval(&fx, "web").status, ServiceStatus::Idle);
  fx.smon("n2", "web", vmap! { "status" => "start failed" });
  assert_eq!(eval(&fx, "web").status, ServiceStatus::Ready);
  fx.avail("n2", "web", Avail::Up);
  assert_eq!(eval(&fx, "web").reason, "flex_max 2 reached");
}
