use crate::cluster::{Avail, ClusterView, PeerError, PeerMessage, RxOutcome, ServiceInstanceStatus};
use crate::core::Value;
use crate::daemon::{now, DaemonState, NmonUpdate, SmonUpdate, StateError};
use crate::vmap;
use serde::Deserialize;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ListenerError {
  #[error("bad request: {0}")]
  Parse(#[from] serde_json::Error),
  #[error(transparent)]
  State(#[from] StateError),
  #[error(transparent)]
  Peer(#[from] PeerError),
}

/// What API clients and peers ask the daemon, as `{"action": ..., "options": {...}}`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "action", content = "options", rename_all = "snake_case")]
pub enum Request {
  SetNmon(NmonUpdate),
  SetSmon {
    path: String,
    #[serde(flatten)]
    update: SmonUpdate,
  },
  /// A resource driver reports the status document of a local instance.
  PostStatus { path: String, status: Value },
  /// Adds, replaces or (without `config`) removes a local service.
  PostConfig {
    path: String,
    #[serde(default)]
    config: Option<Value>,
  },
  PeerMessage { peer: String, message: PeerMessage },
  /// The full local blob, for a peer that lost track of our patches.
  FullSync,
  ClusterStatus,
  Summary,
  /// Stops the daemon, leaving services as they are.
  DaemonStop,
}

/// Serves one request.
pub fn dispatch(state: &DaemonState, req: Request) -> Result<Value, ListenerError> {
  match req {
    Request::SetNmon(update) => {
      let changed = state.set_nmon(update)?;
      Ok(vmap! { "changed" => changed })
    }
    Request::SetSmon { path, update } => {
      let changed = state.set_smon(&path, update)?;
      Ok(vmap! { "changed" => changed })
    }
    Request::PostStatus { path, status } => {
      state.post_instance_status(&path, status)?;
      Ok(Value::Null)
    }
    Request::PostConfig { path, config } => {
      match config {
        Some(config) => state.post_service_config(&path, config)?,
        None => state.remove_service(&path)?,
      }
      Ok(Value::Null)
    }
    Request::PeerMessage { peer, message } => {
      let outcome = state.peers.receive(&state.data, &peer, message);
      let outcome = match outcome {
        RxOutcome::Applied => "applied",
        RxOutcome::Duplicate => "duplicate",
        RxOutcome::NeedResync => "need_resync",
      };
      Ok(vmap! { "outcome" => outcome })
    }
    Request::FullSync => {
      let full = state.publisher().full(&state.data, now());
      // The journal entries cut by the resync go out on the next tick.
      state.wake();
      Ok(Value::from(serde_json::to_value(&full)?))
    }
    Request::ClusterStatus => Ok(state.data.snapshot()),
    Request::Summary => {
      let lines = summary(&view(state))
        .into_iter()
        .map(Value::from)
        .collect::<Vec<_>>();
      Ok(Value::from(lines))
    }
    Request::DaemonStop => {
      info!("daemon stop requested");
      state.stop_daemon()?;
      Ok(Value::Null)
    }
  }
}

/// Parses a JSON request and renders the answer as `{"status": 0, "data": ...}`, or
/// `{"status": 1, "error": ...}` on failure.
pub fn handle_json(state: &DaemonState, body: &str) -> String {
  let result = serde_json::from_str::<Request>(body)
    .map_err(ListenerError::from)
    .and_then(|req| {
      debug!(?req, "request");
      dispatch(state, req)
    });
  let answer = match result {
    Ok(data) => serde_json::json!({ "status": 0, "data": data.to_json() }),
    Err(e) => {
      warn!(error = %e, "request failed");
      serde_json::json!({ "status": 1, "error": e.to_string() })
    }
  };
  answer.to_string()
}

/// Answers newline-delimited JSON requests read from `input`, one answer line each, until
/// `input` ends.
pub async fn serve_lines<R, W>(
  state: &DaemonState,
  input: R,
  mut output: W,
) -> std::io::Result<()>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut lines = input.lines();
  while let Some(line) = lines.next_line().await? {
    if line.trim().is_empty() {
      continue;
    }
    let mut answer = handle_json(state, line.trim());
    answer.push('\n');
    output.write_all(answer.as_bytes()).await?;
    output.flush().await?;
  }
  debug!("request stream closed");
  Ok(())
}

fn view(state: &DaemonState) -> ClusterView {
  let live = state.heartbeats.beating_at(Instant::now());
  ClusterView::build(
    state.nodename(),
    now(),
    &state.data.snapshot(),
    &live,
    &state.cluster_nodes(),
    state.config().stale_after,
  )
  .with_desynced(state.peers.desynced())
}

/// One line per instance: `<path>@<node>: <monitor status>`, followed by the last log line of
/// the first failing resource when the instance is not healthy.
pub fn summary(view: &ClusterView) -> Vec<String> {
  let mut lines = Vec::new();
  for node in view.cluster_nodes() {
    let data = match view.node(&node) {
      Some(data) if view.is_alive(&node) && !view.is_stale(&node) => data,
      _ => {
        lines.push(format!("{}: no data", node));
        continue;
      }
    };
    for (path, instance) in data.services_status.iter() {
      let mut line = format!("{}@{}: {}", path, node, instance.monitor.status);
      if instance.monitor.status.is_failed() || instance.avail == Avail::Down {
        if let Some(cause) = failure_cause(instance) {
          line.push(' ');
          line.push_str(&cause);
        }
      }
      lines.push(line);
    }
  }
  lines
}

fn failure_cause(instance: &ServiceInstanceStatus) -> Option<String> {
  instance
    .resources
    .iter()
    .filter(|(_, r)| !r.status.is_running())
    .find_map(|(rid, r)| r.log.last().map(|l| format!("({}: {})", rid, l)))
}

#[cfg(test)]
use crate::cluster::{NodeStatus, ServiceGlobalExpect, ServiceStatus};
#[cfg(test)]
use crate::monitor::DaemonConfig;

#[cfg(test)]
fn state() -> DaemonState {
  DaemonState::new(DaemonConfig {
    nodename: "n1".to_string(),
    nodes: vec!["n1".to_string()],
    ..DaemonConfig::default()
  })
}

#[test]
fn test_request_wire_forms() {
  let req: Request = serde_json::from_str(
    r#"{"action": "set_smon", "options": {"path": "svc", "global_expect": "frozen"}}"#,
  )
  .unwrap();
  match req {
    Request::SetSmon { path, update } => {
      assert_eq!(path, "svc");
      assert_eq!(
        update.global_expect,
        crate::cluster::Change::Set(ServiceGlobalExpect::Frozen)
      );
      assert!(!update.reset_retries);
    }
    other => panic!("unexpected {:?}", other),
  }
  let req: Request = serde_json::from_str(r#"{"action": "summary"}"#).unwrap();
  assert_eq!(req, Request::Summary);
  assert!(serde_json::from_str::<Request>(r#"{"action": "reboot"}"#).is_err());
}

#[test]
fn test_handle_json_set_smon_and_summary() {
  let state = state();
  let answer = handle_json(
    &state,
    r#"{"action": "set_smon", "options": {"path": "svc", "status": "start failed"}}"#,
  );
  let answer: serde_json::Value = serde_json::from_str(&answer).unwrap();
  assert_eq!(answer["status"], 0);
  assert_eq!(answer["data"]["changed"], true);
  state
    .post_instance_status(
      "svc",
      vmap! {
        "avail" => "down",
        "resources" => vmap! {
          "fs#1" => vmap! { "status" => "down", "log" => Value::from(vec![Value::from("mount failed")]) },
        },
      },
    )
    .unwrap();
  assert_eq!(state.smon("svc").unwrap().status, ServiceStatus::StartFailed);
  let lines = summary(&view(&state));
  assert_eq!(lines, vec!["svc@n1: start failed (fs#1: mount failed)".to_string()]);

  let answer: serde_json::Value =
    serde_json::from_str(&handle_json(&state, "{not json")).unwrap();
  assert_eq!(answer["status"], 1);
}

#[test]
fn test_daemon_stop_sets_maintenance() {
  let state = state();
  dispatch(&state, Request::DaemonStop).unwrap();
  assert!(state.stop_requested());
  assert_eq!(state.nmon().status, NodeStatus::Maintenance);
}

#[tokio::test]
async fn test_serve_lines_answers_each_request() {
  let state = state();
  let input = concat!(
    r#"{"action": "set_smon", "options": {"path": "svc", "global_expect": "frozen"}}"#,
    "\n\n",
    "{not json\n",
    r#"{"action": "daemon_stop"}"#,
    "\n",
  );
  let mut output = Vec::new();
  serve_lines(&state, input.as_bytes(), &mut output).await.unwrap();
  let answers = String::from_utf8(output)
    .unwrap()
    .lines()
    .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap())
    .collect::<Vec<_>>();
  assert_eq!(answers.len(), 3);
  assert_eq!(answers[0]["data"]["changed"], true);
  assert_eq!(answers[1]["status"], 1);
  assert_eq!(answers[2]["status"], 0);
  assert!(state.stop_requested());
}
