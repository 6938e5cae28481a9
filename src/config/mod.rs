//! Configuration management
//!
//! Handles config.toml (user-defined) and config.lock (generated with all defaults).

mod build;
mod types;
mod validation;

pub use build::{
    NicPlan, build_tables, compile_rule, maintenance_schedule, nic_plan, route_entries,
    stack_options,
};
pub use types::*;
pub use validation::{ValidationResult, validate};

use crate::{Error, Result};
use std::path::Path;

pub const DEFAULT_MTU: u32 = 1500;
pub const DEFAULT_REAP_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_REAP_BUCKETS: usize = 256;

/// Load configuration from a TOML file
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Config> {
    toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
}

/// Generate a lock file from config, filling in all defaults
pub fn generate_lock(config: &Config) -> ConfigLock {
    ConfigLock::from_config(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::LogFormat;

    const SAMPLE: &str = r#"
        [logging]
        level = "debug"
        format = "json"

        [[nics]]
        id = 1
        name = "eth0"
        addresses = ["10.0.0.1/24"]

        [[routes]]
        destination = "0.0.0.0/0"
        gateway = "10.0.0.254"
        nic = 1

        [[iptables.policies]]
        table = "filter"
        hook = "forward"
        verdict = "drop"

        [[iptables.rules]]
        table = "filter"
        hook = "input"
        protocol = "udp"
        dport = "5000"
        target = "accept"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = parse(SAMPLE).unwrap();
        assert_eq!(config.nics.len(), 1);
        assert_eq!(config.nics[0].name.as_deref(), Some("eth0"));
        assert_eq!(config.routes[0].gateway.as_deref(), Some("10.0.0.254"));
        assert_eq!(config.iptables.rules.len(), 1);
        assert_eq!(config.logging.as_ref().map(|l| l.format), Some(LogFormat::Json));
    }

    #[test]
    fn test_parse_empty() {
        let config = parse("").unwrap();
        assert!(config.nics.is_empty());
        assert!(config.handle_local());
        assert!(!config.forwarding());
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(parse("[[nics]]\nname = 1"), Err(Error::Config(_))));
    }

    #[test]
    fn test_generate_lock_fills_defaults() {
        let config = parse(SAMPLE).unwrap();
        let lock = generate_lock(&config);
        assert_eq!(lock.nics[0].mtu, DEFAULT_MTU);
        assert_eq!(lock.conntrack.reap_buckets, DEFAULT_REAP_BUCKETS);
        assert_eq!(lock.logging.level, "debug");
        assert!(chrono::DateTime::parse_from_rfc3339(&lock.generated_at).is_ok());
        assert!(toml::to_string_pretty(&lock).is_ok());
    }
}
