use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
  Off,
}
impl LogLevel {
  pub const MIN: LogLevel = LogLevel::Trace;

  pub fn filter(self) -> LevelFilter {
    match self {
      LogLevel::Trace => LevelFilter::TRACE,
      LogLevel::Debug => LevelFilter::DEBUG,
      LogLevel::Info => LevelFilter::INFO,
      LogLevel::Warn => LevelFilter::WARN,
      LogLevel::Error => LevelFilter::ERROR,
      LogLevel::Off => LevelFilter::OFF,
    }
  }
}

fn env_filter(level: LogLevel) -> EnvFilter {
  EnvFilter::builder()
    .with_default_directive(level.filter().into())
    .from_env_lossy()
}

/// Installs the process-wide subscriber, writing to stderr. `RUST_LOG` overrides `level`.
/// Later calls are no-ops.
pub fn init(level: LogLevel) {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(env_filter(level))
    .with_writer(std::io::stderr)
    .try_init();
}

/// Like [`init`], with output captured by the test harness.
pub fn init_test(level: LogLevel) {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(env_filter(level))
    .with_test_writer()
    .try_init();
}

#[test]
fn test_levels_are_ordered() {
  assert!(LogLevel::MIN < LogLevel::Warn);
  assert!(LogLevel::Error < LogLevel::Off);
  assert_eq!(LogLevel::Off.filter(), LevelFilter::OFF);
  init_test(LogLevel::Debug);
  init_test(LogLevel::Trace);
}
