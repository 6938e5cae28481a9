//! Logging setup and packet counters.

mod logging;
mod metrics;

pub use logging::{LogConfig, LogFormat, init_logging};
pub use metrics::{Counter, InterfaceStats, StackStats};
