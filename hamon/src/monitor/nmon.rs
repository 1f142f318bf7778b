use crate::cluster::{NodeGlobalExpect, NodeLocalExpect, NodeMonitor, NodeStatus};

/// Everything the node state machine looks at.
#[derive(Clone, Debug)]
pub struct NodeContext<'a> {
  pub nmon: &'a NodeMonitor,
  /// The local node is frozen (blob timestamp or freeze flag file).
  pub frozen: bool,
  pub config_loaded: bool,
  /// A live peer published its data, or the cluster has no other declared node.
  pub peers_known: bool,
  /// Seconds since the daemon started.
  pub uptime: f64,
  pub rejoin_grace_period: f64,
  /// Every local instance not flagged always-on is down.
  pub drainable_down: bool,
  /// Every live node is frozen.
  pub cluster_frozen: bool,
  /// No live node is frozen.
  pub cluster_thawed: bool,
}

/// What to change on the local node this tick.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeDecision {
  pub status: Option<NodeStatus>,
  /// Freeze (`Some(true)`) or thaw (`Some(false)`) the node.
  pub freeze: Option<bool>,
  pub clear_global_expect: bool,
  pub reason: &'static str,
  /// Orchestration is not allowed yet: nothing but held statuses for services.
  pub hold_services: bool,
  /// Grace period expiry without peer data: proceeding with degraded confidence.
  pub degraded: bool,
}
impl NodeDecision {
  fn to(status: NodeStatus, reason: &'static str) -> NodeDecision {
    NodeDecision {
      status: Some(status),
      reason: reason,
      ..NodeDecision::default()
    }
  }

  fn keep(reason: &'static str) -> NodeDecision {
    NodeDecision {
      reason: reason,
      ..NodeDecision::default()
    }
  }
}

/// One step of the node state machine. `status` is only set when it differs from the current
/// one.
pub fn evaluate(ctx: &NodeContext) -> NodeDecision {
  use NodeStatus::*;
  let current = ctx.nmon.status;
  let mut decision = match current {
    Init if ctx.config_loaded => NodeDecision::to(Rejoin, "configuration loaded"),
    Init => NodeDecision::keep("waiting for configuration"),
    Rejoin if ctx.peers_known => NodeDecision::to(Idle, "peer data received"),
    Rejoin if ctx.uptime >= ctx.rejoin_grace_period => NodeDecision {
      degraded: true,
      ..NodeDecision::to(Idle, "rejoin grace period expired without peer data")
    },
    Rejoin => NodeDecision::keep("waiting for peer data"),
    // Only a daemon restart leaves it, through init.
    Maintenance => NodeDecision::keep("daemon stopping"),
    _ => operational(ctx),
  };
  decision.hold_services = matches!(
    decision.status.unwrap_or(current),
    Init | Rejoin | Maintenance
  );
  if decision.status == Some(current) {
    decision.status = None;
  }
  decision
}

fn operational(ctx: &NodeContext) -> NodeDecision {
  use NodeStatus::*;
  let current = ctx.nmon.status;
  match (ctx.nmon.global_expect, ctx.nmon.local_expect) {
    (Some(NodeGlobalExpect::Shutdown), _) | (_, Some(NodeLocalExpect::Shutdown)) => {
      return NodeDecision::to(Shutting, "shutdown requested");
    }
    (Some(NodeGlobalExpect::Frozen), _) => {
      if !ctx.frozen {
        return NodeDecision {
          freeze: Some(true),
          ..NodeDecision::to(Frozen, "freeze requested")
        };
      }
      return NodeDecision {
        clear_global_expect: ctx.cluster_frozen,
        ..NodeDecision::to(Frozen, "frozen")
      };
    }
    (Some(NodeGlobalExpect::Thawed), _) => {
      if ctx.frozen {
        return NodeDecision {
          freeze: Some(false),
          ..NodeDecision::to(Thawing, "thaw requested")
        };
      }
      return NodeDecision {
        clear_global_expect: ctx.cluster_thawed,
        ..NodeDecision::to(Idle, "thawed")
      };
    }
    (None, Some(NodeLocalExpect::Drain)) => {
      return if ctx.drainable_down {
        NodeDecision::to(Drained, "every drainable service is down")
      } else {
        NodeDecision::to(Draining, "drain requested")
      };
    }
    (None, None) => {}
  }
  match current {
    Shutting | Draining | Drained => NodeDecision::to(Idle, "no more node intent"),
    _ if ctx.frozen => NodeDecision::to(Frozen, "freeze flag present"),
    Frozen | Thawing => NodeDecision::to(Idle, "thawed"),
    _ => NodeDecision::keep("idle"),
  }
}

#[cfg(test)]
fn ctx(nmon: &NodeMonitor) -> NodeContext<'_> {
  NodeContext {
    nmon: nmon,
    frozen: false,
    config_loaded: true,
    peers_known: false,
    uptime: 0.0,
    rejoin_grace_period: 90.0,
    drainable_down: true,
    cluster_frozen: false,
    cluster_thawed: true,
  }
}

#[cfg(test)]
fn nmon(status: NodeStatus) -> NodeMonitor {
  NodeMonitor {
    status: status,
    ..NodeMonitor::default()
  }
}

#[test]
fn test_startup_sequence() {
  let init = nmon(NodeStatus::Init);
  let d = evaluate(&NodeContext { config_loaded: false, ..ctx(&init) });
  assert_eq!(d.status, None);
  assert!(d.hold_services);
  let d = evaluate(&ctx(&init));
  assert_eq!(d.status, Some(NodeStatus::Rejoin));
  assert!(d.hold_services);

  let rejoin = nmon(NodeStatus::Rejoin);
  let d = evaluate(&ctx(&rejoin));
  assert_eq!(d.status, None);
  assert!(d.hold_services);
  let d = evaluate(&NodeContext { peers_known: true, ..ctx(&rejoin) });
  assert_eq!(d.status, Some(NodeStatus::Idle));
  assert!(!d.degraded);
  let d = evaluate(&NodeContext { uptime: 91.0, ..ctx(&rejoin) });
  assert_eq!(d.status, Some(NodeStatus::Idle));
  assert!(d.degraded);
}

#[test]
fn test_freeze_flag_and_expects() {
  let idle = nmon(NodeStatus::Idle);
  let frozen = NodeContext { frozen: true, ..ctx(&idle) };
  assert_eq!(evaluate(&frozen).status, Some(NodeStatus::Frozen));
  assert_eq!(evaluate(&ctx(&idle)).status, None);

  let freeze = NodeMonitor {
    global_expect: Some(NodeGlobalExpect::Frozen),
    ..idle.clone()
  };
  let d = evaluate(&ctx(&freeze));
  assert_eq!(d.freeze, Some(true));
  assert_eq!(d.status, Some(NodeStatus::Frozen));
  assert!(!d.clear_global_expect);
  let frozen = NodeMonitor {
    status: NodeStatus::Frozen,
    ..freeze
  };
  let d = evaluate(&NodeContext { frozen: true, cluster_frozen: true, ..ctx(&frozen) });
  assert_eq!(d.status, None);
  assert_eq!(d.freeze, None);
  assert!(d.clear_global_expect);

  let thaw = NodeMonitor {
    global_expect: Some(NodeGlobalExpect::Thawed),
    ..frozen
  };
  let d = evaluate(&NodeContext { frozen: true, ..ctx(&thaw) });
  assert_eq!((d.status, d.freeze), (Some(NodeStatus::Thawing), Some(false)));
  let thawing = NodeMonitor {
    status: NodeStatus::Thawing,
    global_expect: None,
    ..thaw
  };
  assert_eq!(evaluate(&ctx(&thawing)).status, Some(NodeStatus::Idle));
}

#[test]
fn test_drain_and_shutdown() {
  let drain = NodeMonitor {
    local_expect: Some(NodeLocalExpect::Drain),
    ..nmon(NodeStatus::Idle)
  };
  let d = evaluate(&NodeContext { drainable_down: false, ..ctx(&drain) });
  assert_eq!(d.status, Some(NodeStatus::Draining));
  assert_eq!(evaluate(&ctx(&drain)).status, Some(NodeStatus::Drained));

  let shutdown = NodeMonitor {
    global_expect: Some(NodeGlobalExpect::Shutdown),
    ..nmon(NodeStatus::Frozen)
  };
  assert_eq!(evaluate(&ctx(&shutdown)).status, Some(NodeStatus::Shutting));
}

#[test]
fn test_maintenance_is_never_left() {
  let maintenance = nmon(NodeStatus::Maintenance);
  for c in [
    ctx(&maintenance),
    NodeContext { frozen: true, ..ctx(&maintenance) },
    NodeContext { drainable_down: false, ..ctx(&maintenance) },
  ] {
    let d = evaluate(&c);
    assert_eq!(d.status, None);
    assert!(d.hold_services);
  }
}
