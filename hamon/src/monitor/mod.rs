//! The orchestration side of the daemon: the node and service state machines, and the loop
//! that drives them.
//!
//! ### State machines
//! [`nmon::evaluate`] and [`smon::evaluate`] are pure functions of a [`ClusterView`] and the
//! local monitor records. They return a decision (new status, record changes, at most one
//! [`Action`]) and never touch the shared data themselves, so every rule can be tested on a
//! hand-built view.
//!
//! ### The loop
//! A [`Monitor`] ticks every `monitor_period`, or earlier when woken by a monitor record change.
//! Each tick:
//! 1. reaps finished actions and applies the outcome bound at launch,
//! 2. ingests refreshed instance statuses,
//! 3. runs the node state machine, then every local service against one snapshot,
//! 4. launches the decided actions,
//! 5. purges the data of peers no heartbeat reports alive.
//!
//! Actions run through a [`Launcher`]; statuses come from a [`StatusSource`] read by a
//! [`RefreshPool`]. Both are traits so tests can script them.
//!
//! [`ClusterView`]: crate::cluster::ClusterView

mod actions;
mod config;
#[allow(clippy::module_inception)]
mod monitor;
pub mod nmon;
mod parents;
pub mod smon;
mod status;

#[rustfmt::skip]
pub use {
  actions::terminate_all,
  actions::Action,
  actions::ActionHandle,
  actions::ActionKind,
  actions::LaunchError,
  actions::Launcher,
  actions::Outcome,
  actions::ProcessLauncher,
  config::ConfigError,
  config::DaemonConfig,
  config::Generational,
  monitor::Monitor,
  monitor::MonitorError,
  monitor::MonitorEvent,
  monitor::TickReport,
  parents::parent_state,
  parents::parents_state,
  parents::ParentState,
  status::FileStatusSource,
  status::Refreshed,
  status::RefreshPool,
  status::StatusError,
  status::StatusSource,
};
