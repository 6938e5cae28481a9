//! Configuration types

use crate::telemetry::LogConfig;
use serde::{Deserialize, Serialize};

/// User-defined configuration (config.toml)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: Option<LogConfig>,
    #[serde(default)]
    pub stack: StackConfig,
    #[serde(default)]
    pub conntrack: ConnTrackSection,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub icmp: IcmpConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub nics: Vec<NicConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub iptables: IptablesConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StackConfig {
    /// Hash seed; random when absent.
    pub seed: Option<u32>,
    pub handle_local: Option<bool>,
    pub forwarding: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnTrackSection {
    pub buckets: Option<usize>,
    pub max_connections: Option<usize>,
    pub tcp_established_timeout: Option<u64>,
    pub tcp_transitory_timeout: Option<u64>,
    pub udp_timeout: Option<u64>,
    pub icmp_timeout: Option<u64>,
    /// Milliseconds between reaper ticks.
    pub reap_interval_ms: Option<u64>,
    pub reap_buckets: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortsConfig {
    pub ephemeral_range: Option<(u16, u16)>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IcmpConfig {
    /// Errors per second.
    pub limit: Option<f64>,
    pub burst: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BufferConfig {
    pub chunk_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NicConfig {
    pub id: u32,
    pub name: Option<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
    pub mtu: Option<u32>,
    pub mac: Option<String>,
    #[serde(default)]
    pub loopback: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub destination: String,
    pub gateway: Option<String>,
    pub nic: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IptablesConfig {
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// Install into the IPv6 table set instead of IPv4.
    #[serde(default)]
    pub ipv6: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    pub table: String,
    pub hook: String,
    pub verdict: String,
}

/// One filter rule. Address fields take a `!` prefix to invert.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub table: String,
    pub hook: String,
    pub protocol: Option<String>,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub sport: Option<String>,
    pub dport: Option<String>,
    pub state: Option<String>,
    pub target: String,
    pub to_address: Option<String>,
    pub to_port: Option<u16>,
    pub reject_with: Option<String>,
}

// ============================================================================
// Lock file types (generated, includes all defaults)
// ============================================================================

/// Generated lock file with all defaults filled in
#[derive(Debug, Clone, Serialize)]
pub struct ConfigLock {
    pub generated_at: String,
    pub logging: LogConfig,
    pub stack: StackLock,
    pub conntrack: ConnTrackLock,
    pub ports: PortsLock,
    pub icmp: IcmpLock,
    pub buffer: BufferLock,
    pub nics: Vec<NicLock>,
    pub routes: Vec<RouteLock>,
    pub iptables: IptablesLock,
}

#[derive(Debug, Clone, Serialize)]
pub struct StackLock {
    pub seed: Option<u32>,
    pub handle_local: bool,
    pub forwarding: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnTrackLock {
    pub buckets: usize,
    pub max_connections: usize,
    pub tcp_established_timeout: u64,
    pub tcp_transitory_timeout: u64,
    pub udp_timeout: u64,
    pub icmp_timeout: u64,
    pub reap_interval_ms: u64,
    pub reap_buckets: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortsLock {
    pub ephemeral_range: (u16, u16),
}

#[derive(Debug, Clone, Serialize)]
pub struct IcmpLock {
    pub limit: f64,
    pub burst: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferLock {
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NicLock {
    pub id: u32,
    pub name: String,
    pub addresses: Vec<String>,
    pub mtu: u32,
    pub mac: String,
    pub loopback: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteLock {
    pub destination: String,
    pub gateway: String,
    pub nic: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct IptablesLock {
    pub ipv6: bool,
    pub policies: Vec<PolicyLock>,
    pub rules: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyLock {
    pub table: String,
    pub hook: String,
    pub verdict: String,
}

impl Config {
    pub fn handle_local(&self) -> bool {
        self.stack.handle_local.unwrap_or(true)
    }

    pub fn forwarding(&self) -> bool {
        self.stack.forwarding.unwrap_or(false)
    }
}

impl ConfigLock {
    pub fn from_config(config: &Config) -> Self {
        use crate::buffer::DEFAULT_BUFFER_SIZE;
        use crate::ports::{DEFAULT_FIRST_EPHEMERAL, DEFAULT_LAST_EPHEMERAL};
        use crate::stack::{ConnTrackConfig, icmp_rate_limit};

        let ct_defaults = ConnTrackConfig::default();
        let ct = &config.conntrack;
        let conntrack = ConnTrackLock {
            buckets: ct.buckets.unwrap_or(ct_defaults.buckets),
            max_connections: ct.max_connections.unwrap_or(ct_defaults.max_connections),
            tcp_established_timeout: ct
                .tcp_established_timeout
                .unwrap_or(ct_defaults.timeouts.tcp_established.as_secs()),
            tcp_transitory_timeout: ct
                .tcp_transitory_timeout
                .unwrap_or(ct_defaults.timeouts.tcp_transitory.as_secs()),
            udp_timeout: ct.udp_timeout.unwrap_or(ct_defaults.timeouts.udp.as_secs()),
            icmp_timeout: ct.icmp_timeout.unwrap_or(ct_defaults.timeouts.icmp.as_secs()),
            reap_interval_ms: ct.reap_interval_ms.unwrap_or(super::DEFAULT_REAP_INTERVAL_MS),
            reap_buckets: ct.reap_buckets.unwrap_or(super::DEFAULT_REAP_BUCKETS),
        };

        let nics = config
            .nics
            .iter()
            .map(|nic| NicLock {
                id: nic.id,
                name: nic.name.clone().unwrap_or_else(|| format!("nic{}", nic.id)),
                addresses: nic.addresses.clone(),
                mtu: nic.mtu.unwrap_or(super::DEFAULT_MTU),
                mac: nic.mac.clone().unwrap_or_else(|| "auto".to_string()),
                loopback: nic.loopback,
            })
            .collect();

        let routes = config
            .routes
            .iter()
            .map(|r| RouteLock {
                destination: r.destination.clone(),
                gateway: r.gateway.clone().unwrap_or_else(|| "on-link".to_string()),
                nic: r.nic,
            })
            .collect();

        let iptables = IptablesLock {
            ipv6: config.iptables.ipv6,
            policies: config
                .iptables
                .policies
                .iter()
                .map(|p| PolicyLock {
                    table: p.table.to_lowercase(),
                    hook: p.hook.to_lowercase(),
                    verdict: p.verdict.to_lowercase(),
                })
                .collect(),
            rules: config.iptables.rules.len(),
        };

        Self {
            generated_at: chrono::Utc::now().to_rfc3339(),
            logging: config.logging.clone().unwrap_or_else(LogConfig::new),
            stack: StackLock {
                seed: config.stack.seed,
                handle_local: config.handle_local(),
                forwarding: config.forwarding(),
            },
            conntrack,
            ports: PortsLock {
                ephemeral_range: config
                    .ports
                    .ephemeral_range
                    .unwrap_or((DEFAULT_FIRST_EPHEMERAL, DEFAULT_LAST_EPHEMERAL)),
            },
            icmp: IcmpLock {
                limit: config.icmp.limit.unwrap_or(icmp_rate_limit::DEFAULT_LIMIT),
                burst: config.icmp.burst.unwrap_or(icmp_rate_limit::DEFAULT_BURST),
            },
            buffer: BufferLock {
                chunk_size: config.buffer.chunk_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            },
            nics,
            routes,
            iptables,
        }
    }
}
