//! Logging setup.
//!
//! `RUST_LOG` wins over the `[logging]` section of the config file. The
//! section sets a base level, optional per-module levels and the output
//! format:
//!
//! ```toml
//! [logging]
//! level = "info"
//! format = "json"
//! packet_trace = true
//!
//! [logging.modules]
//! "netstack::stack::conntrack" = "debug"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

/// Modules that log once per packet at trace level.
const PACKET_PATH_MODULES: [&str; 3] = [
    "netstack::stack::netstack",
    "netstack::stack::iptables",
    "netstack::link",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// The `[logging]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// error, warn, info, debug or trace
    pub level: String,
    pub format: LogFormat,
    /// Per-module overrides of `level`.
    pub modules: BTreeMap<String, String>,
    /// Raise the packet path modules to trace.
    pub packet_trace: bool,
}

impl LogConfig {
    pub fn new() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            modules: BTreeMap::new(),
            packet_trace: false,
        }
    }

    /// `EnvFilter` directives equivalent to this section.
    pub fn directives(&self) -> String {
        let mut out = vec![parse_level(&self.level).as_str().to_lowercase()];
        if self.packet_trace {
            out.extend(PACKET_PATH_MODULES.iter().map(|m| format!("{}=trace", m)));
        }
        for (module, level) in &self.modules {
            out.push(format!("{}={}", module, parse_level(level).as_str().to_lowercase()));
        }
        out.join(",")
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init_logging(config: Option<&LogConfig>) {
    let defaults = LogConfig::new();
    let config = config.unwrap_or(&defaults);

    let env_filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::try_new(config.directives()).unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE),
            ),
        ),
        LogFormat::Compact => tracing::subscriber::set_global_default(
            registry.with(tracing_subscriber::fmt::layer().compact()),
        ),
        LogFormat::Pretty => {
            tracing::subscriber::set_global_default(registry.with(tracing_subscriber::fmt::layer()))
        }
    };
    if result.is_err() {
        tracing::debug!("logging already initialized");
    }
}

/// Unknown names fall back to info.
fn parse_level(level: &str) -> Level {
    level.trim().parse().unwrap_or(Level::INFO)
}
