use crate::core::Value;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum StatusError {
  #[error("cannot read status of {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },
  #[error("undecodable status of {path}: {source}")]
  Json {
    path: String,
    #[source]
    source: serde_json::Error,
  },
}

/// Where the monitor gets instance statuses from. Resource drivers write them; the monitor only
/// reads.
pub trait StatusSource: Send + Sync {
  /// The current status document of `path`, `None` if it never reported.
  fn read(&self, path: &str) -> Result<Option<Value>, StatusError>;
}

/// Reads `<dir>/<path>/status.json`.
pub struct FileStatusSource {
  dir: PathBuf,
}
impl FileStatusSource {
  pub fn new(dir: PathBuf) -> FileStatusSource {
    FileStatusSource { dir: dir }
  }
}
impl StatusSource for FileStatusSource {
  fn read(&self, path: &str) -> Result<Option<Value>, StatusError> {
    let file = self.dir.join(path).join("status.json");
    let s = match std::fs::read_to_string(&file) {
      Ok(s) => s,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(e) => {
        return Err(StatusError::Io {
          path: path.to_string(),
          source: e,
        })
      }
    };
    let json: serde_json::Value = serde_json::from_str(&s).map_err(|e| StatusError::Json {
      path: path.to_string(),
      source: e,
    })?;
    Ok(Some(Value::from(json)))
  }
}

pub struct Refreshed {
  pub path: String,
  /// When the document was read, in epoch seconds.
  pub read_at: f64,
  pub result: Result<Option<Value>, StatusError>,
}

/// Status refreshes run off the monitor thread. Results come back on a channel the monitor
/// drains without blocking. A path is queued at most once until its result is drained.
pub struct RefreshPool {
  source: Arc<dyn StatusSource>,
  jobs: Option<Sender<String>>,
  queued: HashSet<String>,
  results: Receiver<Refreshed>,
  inline: Sender<Refreshed>,
  threads: Vec<JoinHandle<()>>,
}
impl RefreshPool {
  /// `workers == 0` refreshes inline: the result is ready when [`submit`](Self::submit)
  /// returns.
  pub fn new(source: Arc<dyn StatusSource>, workers: usize) -> RefreshPool {
    let (res_tx, res_rx) = unbounded::<Refreshed>();
    let (jobs, threads) = if workers == 0 {
      (None, Vec::new())
    } else {
      let (job_tx, job_rx) = unbounded::<String>();
      let threads = (0..workers)
        .map(|i| {
          let jobs = job_rx.clone();
          let results = res_tx.clone();
          let source = source.clone();
          std::thread::Builder::new()
            .name(format!("refresh-{}", i))
            .spawn(move || {
              for path in jobs.iter() {
                trace!(%path, "refreshing status");
                let read_at = crate::daemon::now();
                let result = source.read(&path);
                if results.send(Refreshed { path, read_at, result }).is_err() {
                  break;
                }
              }
            })
        })
        .filter_map(|r| match r {
          Ok(t) => Some(t),
          Err(e) => {
            tracing::error!(error = %e, "cannot spawn status refresh worker");
            None
          }
        })
        .collect::<Vec<_>>();
      if threads.is_empty() {
        (None, threads)
      } else {
        (Some(job_tx), threads)
      }
    };
    RefreshPool {
      source: source,
      jobs: jobs,
      queued: HashSet::new(),
      results: res_rx,
      inline: res_tx,
      threads: threads,
    }
  }

  pub fn submit(&mut self, path: &str) {
    if self.queued.contains(path) {
      trace!(%path, "status refresh already queued");
      return;
    }
    match &self.jobs {
      Some(jobs) if jobs.send(path.to_string()).is_ok() => {
        self.queued.insert(path.to_string());
      }
      _ => {
        let read_at = crate::daemon::now();
        let result = self.source.read(path);
        let _ = self.inline.send(Refreshed {
          path: path.to_string(),
          read_at: read_at,
          result: result,
        });
      }
    }
  }

  /// Every result ready so far.
  pub fn drain(&mut self) -> Vec<Refreshed> {
    let done = self.results.try_iter().collect::<Vec<_>>();
    for r in done.iter() {
      self.queued.remove(&r.path);
    }
    done
  }

  /// Paths waiting for a worker or being read.
  pub fn queued(&self) -> usize {
    self.queued.len()
  }
}
impl Drop for RefreshPool {
  fn drop(&mut self) {
    self.jobs.take();
    for t in self.threads.drain(..) {
      if t.join().is_err() {
        debug!("status refresh worker panicked");
      }
    }
  }
}

#[cfg(test)]
struct Counting;
#[cfg(test)]
impl StatusSource for Counting {
  fn read(&self, path: &str) -> Result<Option<Value>, StatusError> {
    Ok(Some(crate::vmap! { "avail" => "up", "path" => path }))
  }
}

#[test]
fn test_inline_refresh_is_ready_at_once() {
  let mut pool = RefreshPool::new(Arc::new(Counting), 0);
  pool.submit("svc1");
  pool.submit("svc2");
  let done = pool.drain();
  assert_eq!(done.len(), 2);
  assert_eq!(done[0].path, "svc1");
  assert!(pool.drain().is_empty());
}

#[test]
fn test_worker_refresh_comes_back() {
  let mut pool = RefreshPool::new(Arc::new(Counting), 2);
  for i in 0..10 {
    pool.submit(&format!("svc{}", i));
  }
  let mut got = Vec::new();
  let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
  while got.len() < 10 && std::time::Instant::now() < deadline {
    got.extend(pool.drain().into_iter().map(|r| r.path));
    std::thread::yield_now();
  }
  got.sort();
  assert_eq!(got.len(), 10);
  assert_eq!(got[0], "svc0");
}

#[cfg(test)]
struct Gated {
  gate: Receiver<()>,
  reads: std::sync::atomic::AtomicUsize,
}
#[cfg(test)]
impl StatusSource for Gated {
  fn read(&self, _path: &str) -> Result<Option<Value>, StatusError> {
    // Blocks until the test drops the sending side.
    let _ = self.gate.recv();
    self.reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    Ok(None)
  }
}

#[test]
fn test_slow_reads_are_not_queued_twice() {
  let (open, gate) = unbounded::<()>();
  let source = Arc::new(Gated {
    gate: gate,
    reads: std::sync::atomic::AtomicUsize::new(0),
  });
  let mut pool = RefreshPool::new(source.clone(), 1);
  for _ in 0..100 {
    pool.submit("svc1");
    pool.submit("svc2");
    assert!(pool.drain().is_empty());
  }
  assert_eq!(pool.queued(), 2);

  drop(open);
  let mut got = Vec::new();
  let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
  while got.len() < 2 && std::time::Instant::now() < deadline {
    got.extend(pool.drain());
    std::thread::yield_now();
  }
  assert_eq!(got.len(), 2);
  assert_eq!(pool.queued(), 0);
  std::thread::sleep(std::time::Duration::from_millis(50));
  assert!(pool.drain().is_empty());
  assert_eq!(source.reads.load(std::sync::atomic::Ordering::SeqCst), 2);

  pool.submit("svc1");
  assert_eq!(pool.queued(), 1);
}

#[test]
fn test_file_status_source() {
  let dir = std::env::temp_dir().join(format!("hamon-status-{}", std::process::id()));
  std::fs::create_dir_all(dir.join("ns").join("db")).unwrap();
  std::fs::write(dir.join("ns/db/status.json"), r#"{"avail": "up", "frozen": 0}"#).unwrap();
  std::fs::create_dir_all(dir.join("bad")).unwrap();
  std::fs::write(dir.join("bad/status.json"), "{").unwrap();
  let src = FileStatusSource::new(dir.clone());
  let st = src.read("ns/db").unwrap().unwrap();
  assert_eq!(st.get("avail").and_then(Value::as_str), Some("up"));
  assert!(src.read("missing").unwrap().is_none());
  assert!(matches!(src.read("bad"), Err(StatusError::Json { .. })));
  let _ = std::fs::remove_dir_all(&dir);
}
