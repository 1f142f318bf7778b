use crate::cluster::data::{node_path, nodes_path};
use crate::core::{DataError, Fragment, JournaledData, PatchError, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// What nodes ship to each other.
///
/// `id` is strictly increasing per sender. A `full` message carries the sender's whole journaled
/// blob and the id of the last patch it already contains, so patches resume at `id + 1`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PeerMessage {
  Patch { id: u64, ts: f64, data: Vec<Fragment> },
  Full { id: u64, ts: f64, data: Value },
}
impl PeerMessage {
  pub fn id(&self) -> u64 {
    match self {
      PeerMessage::Patch { id, .. } | PeerMessage::Full { id, .. } => *id,
    }
  }

  pub fn encode(&self) -> Result<Vec<u8>, PeerError> {
    Ok(serde_cbor::to_vec(self)?)
  }

  pub fn decode(bytes: &[u8]) -> Result<PeerMessage, PeerError> {
    Ok(serde_cbor::from_slice(bytes)?)
  }

  pub fn to_json(&self) -> Result<String, PeerError> {
    Ok(serde_json::to_string(self)?)
  }

  pub fn from_json(s: &str) -> Result<PeerMessage, PeerError> {
    Ok(serde_json::from_str(s)?)
  }
}

#[derive(Error, Debug)]
pub enum PeerError {
  #[error("codec: {0}")]
  Codec(#[from] serde_cbor::Error),
  #[error("json: {0}")]
  Json(#[from] serde_json::Error),
  #[error("data: {0}")]
  Data(#[from] DataError),
  #[error("patch: {0}")]
  Patch(#[from] PatchError),
  #[error("transport: {0}")]
  Transport(String),
}

/// Outcome of handing a peer message to [`PeerSync::receive`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxOutcome {
  Applied,
  /// Already seen; nothing done.
  Duplicate,
  /// The sender must be asked for a full message before any more patches are applied.
  NeedResync,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PeerTrust {
  /// Last applied message id.
  InSync(u64),
  /// Never synced, or desynced by a gap or a failed patch.
  Untrusted,
}

/// Applies peer messages to the shared data, under `cluster.nodes.<peer>`.
pub struct PeerSync {
  peers: Mutex<BTreeMap<String, PeerTrust>>,
}
impl PeerSync {
  pub fn new() -> PeerSync {
    PeerSync {
      peers: Mutex::new(BTreeMap::new()),
    }
  }

  pub fn receive(&self, data: &JournaledData, peer: &str, msg: PeerMessage) -> RxOutcome {
    let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
    let trust = peers.get(peer).copied().unwrap_or(PeerTrust::Untrusted);
    let base = node_path(peer);
    match (trust, msg) {
      (_, PeerMessage::Full { id, data: blob, .. }) => {
        let mut guard = data.lock();
        let applied = guard
          .setnx(&nodes_path(), Value::map())
          .and_then(|_| guard.set(&base, blob));
        match applied {
          Ok(_) => {
            info!(peer, id, "full peer data applied");
            peers.insert(peer.to_string(), PeerTrust::InSync(id));
            RxOutcome::Applied
          }
          Err(e) => {
            error!(peer, id, error = %e, "cannot store full peer data");
            peers.insert(peer.to_string(), PeerTrust::Untrusted);
            RxOutcome::NeedResync
          }
        }
      }
      (PeerTrust::Untrusted, PeerMessage::Patch { id, .. }) => {
        debug!(peer, id, "patch from an unsynced peer");
        RxOutcome::NeedResync
      }
      (PeerTrust::InSync(last), PeerMessage::Patch { id, .. }) if id <= last => {
        RxOutcome::Duplicate
      }
      (PeerTrust::InSync(last), PeerMessage::Patch { id, .. }) if id != last + 1 => {
        warn!(peer, expected = last + 1, got = id, "patch id gap");
        peers.insert(peer.to_string(), PeerTrust::Untrusted);
        RxOutcome::NeedResync
      }
      (PeerTrust::InSync(_), PeerMessage::Patch { id, data: patch, .. }) => {
        let mut guard = data.lock();
        match guard.patch(&base, &patch) {
          Ok(()) => {
            peers.insert(peer.to_string(), PeerTrust::InSync(id));
            RxOutcome::Applied
          }
          Err(e) => {
            let backtrace = std::backtrace::Backtrace::force_capture();
            error!(
              peer,
              id,
              error = %e,
              failures = ?e.failures,
              patch = ?patch,
              data = %guard.get_or(&base, crate::core::Value::Null),
              %backtrace,
              "peer data desync, patch not applicable"
            );
            peers.insert(peer.to_string(), PeerTrust::Untrusted);
            RxOutcome::NeedResync
          }
        }
      }
    }
  }

  /// Whether patches from `peer` are currently applied.
  pub fn is_trusted(&self, peer: &str) -> bool {
    let peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
    matches!(peers.get(peer), Some(PeerTrust::InSync(_)))
  }

  /// Peers whose copy went out of sync after a gap or a failed patch. Their data stays in the
  /// tree, partially patched, until a full message replaces it.
  pub fn desynced(&self) -> BTreeSet<String> {
    let peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
    peers
      .iter()
      .filter(|(_, trust)| **trust == PeerTrust::Untrusted)
      .map(|(peer, _)| peer.clone())
      .collect()
  }

  /// Drops the data of a peer known to be down.
  pub fn purge(&self, data: &JournaledData, peer: &str) -> Result<(), DataError> {
    let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
    peers.remove(peer);
    data.unset_safe(&node_path(peer))?;
    debug!(peer, "peer data purged");
    Ok(())
  }
}
impl Default for PeerSync {
  fn default() -> Self {
    PeerSync::new()
  }
}

/// Turns the local journal into numbered peer messages.
pub struct Publisher {
  last_id: u64,
  /// Patches cut by a resync, not broadcast yet.
  unsent: VecDeque<PeerMessage>,
}
impl Publisher {
  pub fn new() -> Publisher {
    Publisher {
      last_id: 0,
      unsent: VecDeque::new(),
    }
  }

  /// Every patch to broadcast, oldest first: those cut by [`full`](Self::full) since the
  /// previous call, then whatever the journal holds now.
  pub fn next_patches(&mut self, data: &JournaledData, now: f64) -> Vec<PeerMessage> {
    let mut out = self.unsent.drain(..).collect::<Vec<_>>();
    out.extend(self.cut_patch(data.pop_journal(), now));
    out
  }

  /// A full message for a peer asking for a resync.
  ///
  /// Pending journal entries are cut into a patch first, queued for the next
  /// [`next_patches`](Self::next_patches). The full message contains that patch, so the
  /// resyncing peer sees it as a duplicate while every other peer applies it without a gap.
  pub fn full(&mut self, data: &JournaledData, now: f64) -> PeerMessage {
    let mut guard = data.lock();
    let pending = guard.pop_journal();
    if let Some(patch) = self.cut_patch(pending, now) {
      self.unsent.push_back(patch);
    }
    PeerMessage::Full {
      id: self.last_id,
      ts: now,
      data: guard.journal_head().unwrap_or_else(Value::map),
    }
  }

  fn cut_patch(&mut self, frags: Vec<Fragment>, now: f64) -> Option<PeerMessage> {
    if frags.is_empty() {
      return None;
    }
    self.last_id += 1;
    Some(PeerMessage::Patch {
      id: self.last_id,
      ts: now,
      data: frags,
    })
  }
}
impl Default for Publisher {
  fn default() -> Self {
    Publisher::new()
  }
}

/// The heartbeat transports, as seen by the daemon.
#[async_trait]
pub trait PeerTransport: Send + Sync {
  async fn broadcast(&self, msg: &PeerMessage) -> Result<(), PeerError>;
  async fn send_to(&self, peer: &str, msg: &PeerMessage) -> Result<(), PeerError>;
}

#[cfg(test)]
use crate::core::JournalConfig;
#[cfg(test)]
use crate::{path, vmap};

#[cfg(test)]
fn node_store(local: &str) -> JournaledData {
  JournaledData::new(
    vmap! { "cluster" => vmap! { "nodes" => vmap! { local => vmap! {} } } },
    Some(JournalConfig {
      head: node_path(local),
      exclude: vec![path!["stats"]],
    }),
  )
}

#[test]
fn test_patch_message_json_form() {
  let json = r#"{"kind":"patch","id":7,"ts":1.5,"data":[[["monitor","status"],"idle"],[["x"]]]}"#;
  let msg = PeerMessage::from_json(json).unwrap();
  assert_eq!(
    msg,
    PeerMessage::Patch {
      id: 7,
      ts: 1.5,
      data: vec![
        Fragment::set(path!["monitor", "status"], Value::from("idle")),
        Fragment::unset(path!["x"]),
      ],
    }
  );
  assert_eq!(PeerMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
}

#[test]
fn test_patch_before_full_needs_resync() {
  let sync = PeerSync::new();
  let local = node_store("n1");
  let msg = PeerMessage::Patch { id: 1, ts: 0.0, data: vec![] };
  assert_eq!(sync.receive(&local, "n2", msg), RxOutcome::NeedResync);
  assert!(!sync.is_trusted("n2"));
}

#[test]
fn test_sender_and_receiver_converge() {
  let sender = node_store("n2");
  let receiver = node_store("n1");
  let sync = PeerSync::new();
  let mut publisher = Publisher::new();
  let head = node_path("n2");

  sender.set(&head.child("monitor"), vmap! { "status" => "idle" }).unwrap();
  let full = publisher.full(&sender, 1.0);
  assert_eq!(full.id(), 1);
  assert_eq!(sync.receive(&receiver, "n2", full), RxOutcome::Applied);

  sender.set(&head.child("labels"), vmap! { "az" => "b" }).unwrap();
  sender.set(&head.child("stats"), vmap! { "load" => 3 }).unwrap();
  let patches = publisher.next_patches(&sender, 2.0);
  assert_eq!(patches.iter().map(PeerMessage::id).collect::<Vec<_>>(), vec![1, 2]);
  // the first one was cut by the resync and is already part of the full message
  let outcomes = patches
    .iter()
    .map(|p| sync.receive(&receiver, "n2", p.clone()))
    .collect::<Vec<_>>();
  assert_eq!(outcomes, vec![RxOutcome::Duplicate, RxOutcome::Applied]);
  assert_eq!(sync.receive(&receiver, "n2", patches[1].clone()), RxOutcome::Duplicate);
  assert!(publisher.next_patches(&sender, 3.0).is_empty());

  assert_eq!(
    receiver.get(&head),
    Ok(vmap! { "monitor" => vmap! { "status" => "idle" }, "labels" => vmap! { "az" => "b" } })
  );
}

#[test]
fn test_gap_and_bad_patch_untrust_peer() {
  let receiver = node_store("n1");
  let sync = PeerSync::new();
  let full = PeerMessage::Full { id: 4, ts: 0.0, data: vmap! {} };
  assert_eq!(sync.receive(&receiver, "n2", full.clone()), RxOutcome::Applied);
  assert!(sync.desynced().is_empty());
  let gap = PeerMessage::Patch { id: 6, ts: 0.0, data: vec![] };
  assert_eq!(sync.receive(&receiver, "n2", gap), RxOutcome::NeedResync);
  assert!(!sync.is_trusted("n2"));
  assert_eq!(sync.desynced().into_iter().collect::<Vec<_>>(), vec!["n2".to_string()]);

  assert_eq!(sync.receive(&receiver, "n2", full), RxOutcome::Applied);
  assert!(sync.desynced().is_empty());
  let bad = PeerMessage::Patch {
    id: 5,
    ts: 0.0,
    data: vec![
      Fragment::set(path!["ok"], Value::from(1)),
      Fragment::set(path!["no", "parent"], Value::from(1)),
    ],
  };
  assert_eq!(sync.receive(&receiver, "n2", bad), RxOutcome::NeedResync);
  assert!(!sync.is_trusted("n2"));
  // the fragment that applied stays, the peer is flagged instead
  assert!(receiver.exists(&node_path("n2").child("ok")));
  assert!(sync.desynced().contains("n2"));
}

#[test]
fn test_purge_removes_peer_blob() {
  let receiver = node_store("n1");
  let sync = PeerSync::new();
  let full = PeerMessage::Full { id: 1, ts: 0.0, data: vmap! { "a" => 1 } };
  sync.receive(&receiver, "n2", full);
  sync.purge(&receiver, "n2").unwrap();
  assert!(!receiver.exists(&node_path("n2")));
  assert!(!sync.is_trusted("n2"));
  sync.purge(&receiver, "n2").unwrap();
}
