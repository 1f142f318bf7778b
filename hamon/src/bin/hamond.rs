use hamon::daemon::{DaemonState, SignalHandler};
use hamon::listener::serve_lines;
use hamon::monitor::{DaemonConfig, FileStatusSource, Monitor, MonitorError, ProcessLauncher};
use hamon::testkit::{self, LogLevel};
use std::env::args;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info, warn};

fn main() -> ExitCode {
  testkit::init(LogLevel::Info);
  let path = match args().nth(1) {
    Some(p) => PathBuf::from(p),
    None => {
      eprintln!("usage: hamond <config.toml>");
      return ExitCode::from(2);
    }
  };
  let config = match DaemonConfig::load(&path) {
    Ok(c) => c,
    Err(e) => {
      error!(path = %path.display(), error = %e, "cannot load configuration");
      return ExitCode::from(1);
    }
  };
  let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
    Ok(rt) => rt,
    Err(e) => {
      error!(error = %e, "cannot start the runtime");
      return ExitCode::from(1);
    }
  };
  info!(node = %config.nodename, nodes = ?config.nodes, "starting");
  let launcher = Arc::new(ProcessLauncher::new(config.action_command.clone()));
  let source = Arc::new(FileStatusSource::new(config.status_dir.clone()));
  let state = Arc::new(DaemonState::with_config_path(config, Some(path)));
  // No peer transport: deployments with one attach it with `Monitor::with_transport`.
  let monitor = Monitor::new(state.clone(), launcher, source);
  let result = runtime.block_on(serve(state, monitor));
  // The stdin reader may still be parked on a blocking thread.
  runtime.shutdown_background();
  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      error!(error = %e, "monitor failed");
      ExitCode::from(1)
    }
  }
}

/// Runs the monitor with the signal handler and a listener answering requests on stdin.
async fn serve(state: Arc<DaemonState>, monitor: Monitor) -> Result<(), MonitorError> {
  match SignalHandler::install() {
    Ok(handler) => {
      tokio::spawn(handler.run(state.clone()));
    }
    Err(e) => warn!(error = %e, "cannot install signal handlers"),
  }
  let listener = state.clone();
  tokio::spawn(async move {
    let input = BufReader::new(tokio::io::stdin());
    if let Err(e) = serve_lines(&listener, input, tokio::io::stdout()).await {
      warn!(error = %e, "listener stopped");
    }
  });
  monitor.run().await
}
