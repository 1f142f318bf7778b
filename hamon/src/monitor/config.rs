use crate::cluster::HeartbeatConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("cannot read {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("cannot parse configuration: {0}")]
  Parse(#[from] toml::de::Error),
  #[error("invalid configuration: {0}")]
  Validation(#[from] validator::ValidationErrors),
  #[error("service {path}: {reason}")]
  Service { path: String, reason: String },
}

/// Configures one daemon.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_node_in_cluster"))]
pub struct DaemonConfig {
  /// The name this node publishes its blob under.
  ///
  /// default: the `HOSTNAME` environment variable, else `localhost`
  #[validate(length(min = 1))]
  pub nodename: String,
  /// Declared cluster nodes, in order. The order matters to `nodes order` placement when a
  /// service scope lists nodes the same way.
  ///
  /// default: `[nodename]`
  pub nodes: Vec<String>,
  /// The period of the orchestration loop when nothing wakes it earlier.
  ///
  /// default: `1 second`
  #[serde(with = "humantime_serde")]
  pub monitor_period: Duration,
  /// How long a service holds `ready` before its start is launched, letting peer status
  /// flicker settle. Also the unit of the start retry backoff.
  ///
  /// default: `5 seconds`
  #[serde(with = "humantime_serde")]
  pub ready_period: Duration,
  /// How long a joining node waits for peer data before orchestrating on its own.
  ///
  /// default: `90 seconds`
  #[serde(with = "humantime_serde")]
  pub rejoin_grace_period: Duration,
  /// A peer blob not refreshed for this long is ignored.
  ///
  /// default: `30 seconds`
  #[serde(with = "humantime_serde")]
  pub stale_after: Duration,
  /// How long running actions get between SIGTERM and SIGKILL on daemon stop.
  ///
  /// default: `60 seconds`
  #[serde(with = "humantime_serde")]
  pub stop_tmo: Duration,
  /// Automatic start retries after a `start failed`, with a linearly growing delay.
  ///
  /// default: `0`
  pub max_start_retries: u32,
  /// A file whose presence freezes the local node.
  ///
  /// default: `None`
  pub freeze_flag: Option<PathBuf>,
  /// Where instance status documents are read from, as `<status_dir>/<path>/status.json`.
  ///
  /// default: `/var/lib/hamon/status`
  pub status_dir: PathBuf,
  /// The program launched as `<action_command> <path> <action> [--rid <rid>]...`.
  ///
  /// default: `/usr/libexec/hamon/action`
  pub action_command: PathBuf,
  /// Threads refreshing instance statuses. `0` refreshes inline on the monitor thread.
  ///
  /// default: `min(num_cpus, 4)`
  pub workers: usize,
  pub hb: HeartbeatConfig,
}
impl Default for DaemonConfig {
  fn default() -> Self {
    let nodename = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    DaemonConfig {
      nodes: vec![nodename.clone()],
      nodename: nodename,
      monitor_period: Duration::from_secs(1),
      ready_period: Duration::from_secs(5),
      rejoin_grace_period: Duration::from_secs(90),
      stale_after: Duration::from_secs(30),
      stop_tmo: Duration::from_secs(60),
      max_start_retries: 0,
      freeze_flag: None,
      status_dir: PathBuf::from("/var/lib/hamon/status"),
      action_command: PathBuf::from("/usr/libexec/hamon/action"),
      workers: num_cpus::get().min(4),
      hb: HeartbeatConfig::default(),
    }
  }
}
impl DaemonConfig {
  pub fn from_toml(s: &str) -> Result<DaemonConfig, ConfigError> {
    let config: DaemonConfig = toml::from_str(s)?;
    config.validate()?;
    Ok(config)
  }

  pub fn load(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
      path: path.to_path_buf(),
      source: e,
    })?;
    DaemonConfig::from_toml(&s)
  }

  /// Declared nodes with the local node appended if it was left out.
  pub fn cluster_nodes(&self) -> Vec<String> {
    let mut nodes = Vec::with_capacity(self.nodes.len() + 1);
    for n in self.nodes.iter() {
      if !nodes.contains(n) {
        nodes.push(n.clone());
      }
    }
    if !nodes.contains(&self.nodename) {
      nodes.push(self.nodename.clone());
    }
    nodes
  }
}

fn validate_node_in_cluster(cfg: &DaemonConfig) -> Result<(), ValidationError> {
  if !cfg.nodes.is_empty() && !cfg.nodes.contains(&cfg.nodename) {
    return Err(ValidationError::new("nodename_not_in_nodes"));
  }
  if cfg.monitor_period.is_zero() {
    return Err(ValidationError::new("zero_monitor_period"));
  }
  Ok(())
}

/// A value derived from the configuration, recomputed only when the configuration generation
/// moves.
pub struct Generational<T> {
  cell: Mutex<Option<(u64, T)>>,
}
impl<T: Clone> Generational<T> {
  pub fn new() -> Generational<T> {
    Generational {
      cell: Mutex::new(None),
    }
  }

  pub fn get<F>(&self, generation: u64, compute: F) -> T
  where
    F: FnOnce() -> T,
  {
    let mut cell = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
    match &*cell {
      Some((gen, value)) if *gen == generation => value.clone(),
      _ => {
        let value = compute();
        *cell = Some((generation, value.clone()));
        value
      }
    }
  }

  pub fn invalidate(&self) {
    *self.cell.lock().unwrap_or_else(PoisonError::into_inner) = None;
  }
}
impl<T: Clone> Default for Generational<T> {
  fn default() -> Self {
    Generational::new()
  }
}

#[test]
fn test_config_from_toml() {
  let config = DaemonConfig::from_toml(
    r#"
    nodename = "n2"
    nodes = ["n1", "n2"]
    monitor_period = "500ms"
    ready_period = "2s"
    max_start_retries = 3
    freeze_flag = "/tmp/hamon-frozen"
    workers = 0

    [hb]
    timeout = "20s"
    "#,
  )
  .unwrap();
  assert_eq!(config.nodename, "n2");
  assert_eq!(config.monitor_period, Duration::from_millis(500));
  assert_eq!(config.ready_period, Duration::from_secs(2));
  assert_eq!(config.stale_after, Duration::from_secs(30));
  assert_eq!(config.max_start_retries, 3);
  assert_eq!(config.workers, 0);
  assert_eq!(config.hb.timeout, Duration::from_secs(20));
  assert_eq!(config.hb.capacity, 10);
  assert_eq!(config.cluster_nodes(), vec!["n1".to_string(), "n2".to_string()]);
}

#[test]
fn test_config_errors() {
  assert!(matches!(
    DaemonConfig::from_toml("nodename = 3"),
    Err(ConfigError::Parse(_))
  ));
  assert!(matches!(
    DaemonConfig::from_toml("nodename = \"n3\"\nnodes = [\"n1\", \"n2\"]"),
    Err(ConfigError::Validation(_))
  ));
  assert!(matches!(
    DaemonConfig::load(Path::new("/nonexistent/hamon.toml")),
    Err(ConfigError::Io { .. })
  ));
}

#[test]
fn test_generational_recomputes_on_new_generation() {
  let memo = Generational::new();
  let mut calls = 0;
  assert_eq!(memo.get(1, || { calls += 1; vec![1] }), vec![1]);
  assert_eq!(memo.get(1, || { calls += 1; vec![2] }), vec![1]);
  assert_eq!(memo.get(2, || { calls += 1; vec![3] }), vec![3]);
  memo.invalidate();
  assert_eq!(memo.get(2, || { calls += 1; vec![4] }), vec![4]);
  assert_eq!(calls, 3);
}
