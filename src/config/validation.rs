//! Configuration validation

use super::{Config, build};
use crate::tcpip::Subnet;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_stack(config, &mut result);
    validate_nics(config, &mut result);
    validate_routes(config, &mut result);
    validate_iptables(config, &mut result);

    result
}

fn validate_stack(config: &Config, result: &mut ValidationResult) {
    if config.stack.seed.is_none() {
        result.warn("stack.seed: not specified, hashing is seeded randomly");
    }

    if let Some((first, last)) = config.ports.ephemeral_range {
        if first == 0 || first > last {
            result.error(format!(
                "ports.ephemeral_range: invalid range {}-{}",
                first, last
            ));
        }
    }

    if let Some(limit) = config.icmp.limit {
        if !limit.is_finite() || limit < 0.0 {
            result.error(format!("icmp.limit: must be a non-negative number, got {}", limit));
        }
    }
    if config.icmp.burst == Some(0) {
        result.warn("icmp.burst: 0 suppresses every ICMP error");
    }

    if matches!(config.conntrack.buckets, Some(0)) {
        result.error("conntrack.buckets: must be at least 1");
    }
    if matches!(config.conntrack.reap_interval_ms, Some(0)) {
        result.error("conntrack.reap_interval_ms: must be at least 1");
    }
    if matches!(config.buffer.chunk_size, Some(0)) {
        result.error("buffer.chunk_size: must be at least 1");
    }
}

fn validate_nics(config: &Config, result: &mut ValidationResult) {
    let mut seen = HashSet::new();
    for (i, nic) in config.nics.iter().enumerate() {
        if nic.id == crate::tcpip::ANY_NIC {
            result.error(format!("nics[{}]: id 0 is reserved", i));
        }
        if !seen.insert(nic.id) {
            result.error(format!("nics[{}]: duplicate id {}", i, nic.id));
        }
        if nic.mtu.is_none() {
            result.warn(format!(
                "nics[{}]: mtu not specified, using default {}",
                i,
                super::DEFAULT_MTU
            ));
        }
        if nic.addresses.is_empty() && !nic.loopback {
            result.warn(format!("nics[{}]: no addresses configured", i));
        }
        if let Err(e) = build::nic_plan(nic) {
            result.error(format!("nics[{}]: {}", i, e));
        }
    }
}

fn validate_routes(config: &Config, result: &mut ValidationResult) {
    let nic_ids: HashSet<u32> = config.nics.iter().map(|n| n.id).collect();
    for (i, route) in config.routes.iter().enumerate() {
        if !nic_ids.contains(&route.nic) {
            result.error(format!("routes[{}]: nic {} not defined", i, route.nic));
        }

        if !route.destination.contains('/') {
            result.warn(format!(
                "routes[{}]: destination '{}' missing prefix length",
                i, route.destination
            ));
        }
        if Subnet::parse(&route.destination).is_none() {
            result.error(format!(
                "routes[{}]: invalid destination '{}'",
                i, route.destination
            ));
        }
    }
    if let Err(e) = build::route_entries(config) {
        result.error(format!("routes: {}", e));
    }
}

fn validate_iptables(config: &Config, result: &mut ValidationResult) {
    if let Err(e) = build::build_tables(&config.iptables) {
        result.error(format!("iptables: {}", e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NicConfig, RouteConfig};

    fn make_config() -> Config {
        Config {
            stack: crate::config::StackConfig {
                seed: Some(1),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn make_nic(id: u32) -> NicConfig {
        NicConfig {
            id,
            name: None,
            addresses: vec!["10.0.0.1/24".into()],
            mtu: Some(1500),
            mac: None,
            loopback: false,
        }
    }

    #[test]
    fn test_valid_minimal_config() {
        let config = make_config();
        let result = validate(&config);
        assert!(!result.has_errors());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_duplicate_nic_id() {
        let mut config = make_config();
        config.nics = vec![make_nic(1), make_nic(1)];
        let result = validate(&config);
        assert!(result.errors.iter().any(|e| e.contains("duplicate id 1")));
    }

    #[test]
    fn test_reserved_nic_id() {
        let mut config = make_config();
        config.nics = vec![make_nic(0)];
        let result = validate(&config);
        assert!(result.errors.iter().any(|e| e.contains("reserved")));
    }

    #[test]
    fn test_bad_address() {
        let mut config = make_config();
        let mut nic = make_nic(1);
        nic.addresses = vec!["10.0.0.1".into()];
        config.nics = vec![nic];
        assert!(validate(&config).has_errors());
    }

    #[test]
    fn test_route_unknown_nic() {
        let mut config = make_config();
        config.nics = vec![make_nic(1)];
        config.routes = vec![RouteConfig {
            destination: "0.0.0.0/0".into(),
            gateway: Some("10.0.0.254".into()),
            nic: 2,
        }];
        let result = validate(&config);
        assert!(result.errors.iter().any(|e| e.contains("nic 2 not defined")));
    }

    #[test]
    fn test_missing_mtu_warns() {
        let mut config = make_config();
        let mut nic = make_nic(1);
        nic.mtu = None;
        config.nics = vec![nic];
        let result = validate(&config);
        assert!(!result.has_errors());
        assert!(result.warnings.iter().any(|w| w.contains("mtu not specified")));
    }

    #[test]
    fn test_invalid_ephemeral_range() {
        let mut config = make_config();
        config.ports.ephemeral_range = Some((5000, 4000));
        assert!(validate(&config).has_errors());
    }

    #[test]
    fn test_invalid_policy_verdict() {
        let config = crate::config::parse(
            r#"
            [stack]
            seed = 1

            [[iptables.policies]]
            table = "filter"
            hook = "input"
            verdict = "return"
            "#,
        )
        .unwrap();
        let result = validate(&config);
        assert!(result.errors.iter().any(|e| e.starts_with("iptables:")));
    }
}
