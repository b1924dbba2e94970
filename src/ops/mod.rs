//! Operational tooling: statistics counters and tracing setup.

pub mod stats;
pub mod telemetry;

pub use stats::{spawn_publisher, Stats, StatsHandle};
pub use telemetry::{init_tracing, LogHandle};
