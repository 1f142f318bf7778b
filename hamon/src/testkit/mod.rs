//! Deterministic stand-ins for the outside world: hand-built cluster data, scripted actions,
//! in-memory statuses and an in-process peer transport.

mod fakes;
mod fixture;
mod logging;
mod transport;

#[rustfmt::skip]
pub use {
  fakes::FakeLauncher,
  fakes::MemoryStatusSource,
  fixture::beat_steadily,
  fixture::ClusterFixture,
  fixture::FIXTURE_HB,
  logging::init,
  logging::init_test,
  logging::LogLevel,
  transport::ChannelInbox,
  transport::ChannelTransport,
};
