use serde::{Deserialize, Serialize};
use statrs::distribution::{Normal, Univariate};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Configures how heartbeat receivers judge whether a peer is beating.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
  /// The probability of a failure, given the Gaussian distribution of observed inter-beat
  /// intervals, at which a peer stops being considered beating.
  ///
  /// default: `0.995`
  pub phi: f64,
  /// The number of inter-beat intervals each receiver keeps to build its distribution.
  ///
  /// default: `10`
  pub capacity: usize,
  /// Lower bound of the standard deviation, so a very regular peer is not declared down the
  /// moment one beat is late.
  ///
  /// default: `500 milliseconds`
  #[serde(with = "humantime_serde")]
  pub min_std_dev: Duration,
  /// A peer silent for this long is down whatever the distribution says.
  ///
  /// default: `15 seconds`
  #[serde(with = "humantime_serde")]
  pub timeout: Duration,
}
impl Default for HeartbeatConfig {
  fn default() -> Self {
    HeartbeatConfig {
      phi: 0.995,
      capacity: 10,
      min_std_dev: Duration::from_millis(500),
      timeout: Duration::from_secs(15),
    }
  }
}

/// Inter-arrival times of the beats received from one peer, in milliseconds. Intervals are
/// capped at [`MAX_INTERVAL_MS`] so the squared sum cannot overflow.
pub struct IntervalStorage {
  capacity: usize,
  intervals: VecDeque<u64>,
  sum: u128,
  sum_squares: u128,
  latest: Instant,
}
impl IntervalStorage {
  pub fn new(capacity: usize, start: Instant) -> IntervalStorage {
    IntervalStorage {
      capacity: capacity,
      intervals: VecDeque::with_capacity(capacity),
      sum: 0,
      sum_squares: 0,
      latest: start,
    }
  }

  pub fn push_instant(&mut self, i: Instant) {
    while self.intervals.len() >= self.capacity {
      match self.intervals.pop_back() {
        Some(last) => {
          self.sum -= last as u128;
          self.sum_squares -= (last as u128) * (last as u128);
        }
        None => break,
      }
    }
    let first = dur2u64(&i.saturating_duration_since(self.latest)).min(MAX_INTERVAL_MS);
    self.intervals.push_front(first);
    self.sum += first as u128;
    self.sum_squares += (first as u128) * (first as u128);
    self.latest = i;
  }

  pub fn latest(&self) -> Instant {
    self.latest
  }

  pub fn mean(&self) -> f64 {
    self.sum as f64 / self.intervals.len() as f64
  }

  pub fn stdev(&self) -> f64 {
    let mean = self.mean();
    (self.sum_squares as f64 / self.intervals.len() as f64 - mean * mean)
      .max(0.0)
      .sqrt()
  }

  /// Probability that the next beat should already have arrived at `now`. `None` until two
  /// intervals have been observed.
  pub fn phi_at(&self, now: Instant, min_std_dev: Duration) -> Option<f64> {
    if self.intervals.len() < 2 {
      return None;
    }
    let elapsed = dur2u64(&now.saturating_duration_since(self.latest)) as f64;
    let std_dev = self.stdev().max(dur2u64(&min_std_dev) as f64).max(1.0);
    Normal::new(self.mean(), std_dev).ok().map(|n| n.cdf(elapsed))
  }
}
impl Debug for IntervalStorage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("IntervalStorage")
      .field("mean", &self.mean())
      .field("stddev", &self.stdev())
      .finish()
  }
}

/// About 49 days. A peer silent that long is down by timeout anyway.
pub const MAX_INTERVAL_MS: u64 = u32::MAX as u64;

fn dur2u64(dur: &Duration) -> u64 {
  dur.as_millis() as u64
}

enum RxState {
  Receiving(IntervalStorage),
  Down,
}

/// What every heartbeat receiver knows about every peer.
///
/// Transports call [`beat`](Self::beat) for each heartbeat they receive and
/// [`mark_down`](Self::mark_down) when they lose a peer. A peer is beating as long as at least
/// one receiver still considers it alive.
pub struct HeartbeatRegistry {
  config: HeartbeatConfig,
  rx: Mutex<BTreeMap<(String, String), RxState>>,
}
impl HeartbeatRegistry {
  pub fn new(config: HeartbeatConfig) -> HeartbeatRegistry {
    HeartbeatRegistry {
      config: config,
      rx: Mutex::new(BTreeMap::new()),
    }
  }

  pub fn beat(&self, hb: &str, peer: &str) {
    self.beat_at(hb, peer, Instant::now())
  }

  pub fn beat_at(&self, hb: &str, peer: &str, at: Instant) {
    let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
    let key = (hb.to_string(), peer.to_string());
    match rx.get_mut(&key) {
      Some(RxState::Receiving(storage)) => storage.push_instant(at),
      _ => {
        debug!(hb, peer, "receiving heartbeats");
        rx.insert(key, RxState::Receiving(IntervalStorage::new(self.config.capacity, at)));
      }
    }
  }

  pub fn mark_down(&self, hb: &str, peer: &str) {
    let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
    let prev = rx.insert((hb.to_string(), peer.to_string()), RxState::Down);
    if matches!(prev, Some(RxState::Receiving(_))) {
      info!(hb, peer, "heartbeat lost");
    }
  }

  /// Drops everything known about `peer`.
  pub fn forget(&self, peer: &str) {
    let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
    rx.retain(|(_, p), _| p != peer);
  }

  pub fn is_beating(&self, peer: &str) -> bool {
    self.beating_at(Instant::now()).contains(peer)
  }

  /// Peers reported beating by at least one receiver at `now`.
  pub fn beating_at(&self, now: Instant) -> BTreeSet<String> {
    let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
    rx.iter()
      .filter(|(_, state)| match state {
        RxState::Receiving(storage) => self.alive(storage, now),
        RxState::Down => false,
      })
      .map(|((_, peer), _)| peer.clone())
      .collect()
  }

  fn alive(&self, storage: &IntervalStorage, now: Instant) -> bool {
    if now.saturating_duration_since(storage.latest()) > self.config.timeout {
      return false;
    }
    match storage.phi_at(now, self.config.min_std_dev) {
      Some(phi) => phi < self.config.phi,
      None => true,
    }
  }
}

#[test]
fn test_interval_storage_statistics() {
  let start = Instant::now();
  let mut storage = IntervalStorage::new(4, start);
  let mut at = start;
  for ms in &[1000u64, 1000, 1000, 1000, 3000] {
    at += Duration::from_millis(*ms);
    storage.push_instant(at);
  }
  assert_eq!(storage.intervals.len(), 4);
  assert!((storage.mean() - 1500.0).abs() < 1e-9);
  assert!(storage.stdev() > 0.0);
}

#[test]
fn test_huge_interval_is_capped() {
  let start = Instant::now();
  let mut storage = IntervalStorage::new(3, start);
  let later = start + Duration::from_secs(100 * 365 * 24 * 3600);
  storage.push_instant(later);
  storage.push_instant(later + Duration::from_millis(1000));
  assert_eq!(storage.mean(), (MAX_INTERVAL_MS + 1000) as f64 / 2.0);
  assert!(storage.stdev().is_finite());
  for i in 2..5 {
    storage.push_instant(later + Duration::from_millis(1000 * i));
  }
  assert_eq!(storage.mean(), 1000.0);
  assert_eq!(storage.stdev(), 0.0);
}

#[test]
fn test_phi_grows_with_silence() {
  let start = Instant::now();
  let mut storage = IntervalStorage::new(10, start);
  let mut at = start;
  for _ in 0..5 {
    at += Duration::from_millis(1000);
    storage.push_instant(at);
  }
  let min = Duration::from_millis(100);
  let soon = storage.phi_at(at + Duration::from_millis(500), min).unwrap();
  let late = storage.phi_at(at + Duration::from_millis(3000), min).unwrap();
  assert!(soon < 0.5);
  assert!(late > 0.995);
}

#[test]
fn test_registry_any_receiver_keeps_peer_beating() {
  let reg = HeartbeatRegistry::new(HeartbeatConfig::default());
  let start = Instant::now();
  reg.beat_at("hb#1", "n2", start);
  reg.beat_at("hb#2", "n2", start);
  reg.mark_down("hb#1", "n2");
  assert!(reg.beating_at(start).contains("n2"));
  reg.mark_down("hb#2", "n2");
  assert!(!reg.beating_at(start).contains("n2"));
  reg.beat_at("hb#2", "n3", start);
  assert!(!reg.beating_at(start + Duration::from_secs(16)).contains("n3"));
  reg.forget("n3");
  assert!(reg.beating_at(start).is_empty());
}
