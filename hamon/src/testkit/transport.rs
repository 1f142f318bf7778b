use crate::cluster::{PeerError, PeerMessage, PeerTransport, RxOutcome};
use crate::daemon::DaemonState;
use async_trait::async_trait;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};

/// An in-process [`PeerTransport`]. Messages travel CBOR-encoded, like on the wire, and can be
/// cut per destination to simulate a partition.
pub struct ChannelTransport {
  from: String,
  peers: BTreeMap<String, Sender<(String, Vec<u8>)>>,
  cut: Mutex<BTreeSet<String>>,
}
impl ChannelTransport {
  /// One transport and one inbox per node, every transport reaching every other node.
  pub fn mesh(nodes: &[&str]) -> Vec<(ChannelTransport, ChannelInbox)> {
    let channels = nodes
      .iter()
      .map(|n| (n.to_string(), unbounded::<(String, Vec<u8>)>()))
      .collect::<Vec<_>>();
    channels
      .iter()
      .map(|(name, (_, rx))| {
        let peers = channels
          .iter()
          .filter(|(other, _)| other != name)
          .map(|(other, (tx, _))| (other.clone(), tx.clone()))
          .collect();
        let transport = ChannelTransport {
          from: name.clone(),
          peers: peers,
          cut: Mutex::new(BTreeSet::new()),
        };
        (transport, ChannelInbox { rx: rx.clone() })
      })
      .collect()
  }

  /// Silently drops everything sent to `peer` until [`heal`](Self::heal).
  pub fn cut(&self, peer: &str) {
    self.cut.lock().unwrap_or_else(PoisonError::into_inner).insert(peer.to_string());
  }

  pub fn heal(&self, peer: &str) {
    self.cut.lock().unwrap_or_else(PoisonError::into_inner).remove(peer);
  }

  fn send(&self, peer: &str, bytes: Vec<u8>) -> Result<(), PeerError> {
    if self.cut.lock().unwrap_or_else(PoisonError::into_inner).contains(peer) {
      return Ok(());
    }
    let tx = self
      .peers
      .get(peer)
      .ok_or_else(|| PeerError::Transport(format!("unknown peer {}", peer)))?;
    tx.send((self.from.clone(), bytes))
      .map_err(|_| PeerError::Transport(format!("{} is gone", peer)))
  }
}
#[async_trait]
impl PeerTransport for ChannelTransport {
  async fn broadcast(&self, msg: &PeerMessage) -> Result<(), PeerError> {
    let bytes = msg.encode()?;
    for peer in self.peers.keys() {
      self.send(peer, bytes.clone())?;
    }
    Ok(())
  }

  async fn send_to(&self, peer: &str, msg: &PeerMessage) -> Result<(), PeerError> {
    self.send(peer, msg.encode()?)
  }
}

/// The receiving end of a [`ChannelTransport`] mesh node.
pub struct ChannelInbox {
  rx: Receiver<(String, Vec<u8>)>,
}
impl ChannelInbox {
  /// Hands every queued message to `state`. Returns the outcomes in arrival order.
  pub fn deliver(&self, state: &DaemonState) -> Result<Vec<(String, RxOutcome)>, PeerError> {
    let mut outcomes = Vec::new();
    for (peer, bytes) in self.rx.try_iter() {
      let msg = PeerMessage::decode(&bytes)?;
      let outcome = state.peers.receive(&state.data, &peer, msg);
      outcomes.push((peer, outcome));
    }
    Ok(outcomes)
  }

  pub fn pending(&self) -> usize {
    self.rx.len()
  }
}
