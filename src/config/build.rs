//! Turning a parsed [`Config`] into stack options, routes and filter tables.

use super::{
    Config, DEFAULT_MTU, DEFAULT_REAP_BUCKETS, DEFAULT_REAP_INTERVAL_MS, IptablesConfig, NicConfig,
    RuleConfig,
};
use crate::stack::iptables_matchers::{ConnStateMatcher, CtStates, PortMatcher, PortRange};
use crate::stack::iptables_targets::{
    AcceptTarget, DnatTarget, DropTarget, MasqueradeTarget, RedirectTarget, RejectTarget,
    ReturnTarget, SnatTarget,
};
use crate::stack::iptables_types::{InterfaceMatch, IpHeaderFilter, RuleVerdict};
use crate::stack::{
    ConnTrackConfig, ConnTrackTimeouts, Hook, IcmpError, NicOptions, Protocols, RouteEntry, Rule,
    StackOptions, Table, TableBuilder, TableId,
};
use crate::tcpip::{AddressWithPrefix, LinkAddress, Subnet, TransportProtocolNumber};
use crate::{Error, Result};
use std::net::IpAddr;
use std::time::Duration;

/// Stack construction options with every unset value defaulted.
pub fn stack_options(config: &Config, protocols: Protocols) -> StackOptions {
    let defaults = StackOptions::default();
    let ct = &config.conntrack;
    let ct_defaults = ConnTrackTimeouts::default();
    let timeouts = ConnTrackTimeouts {
        tcp_established: ct
            .tcp_established_timeout
            .map(Duration::from_secs)
            .unwrap_or(ct_defaults.tcp_established),
        tcp_transitory: ct
            .tcp_transitory_timeout
            .map(Duration::from_secs)
            .unwrap_or(ct_defaults.tcp_transitory),
        udp: ct.udp_timeout.map(Duration::from_secs).unwrap_or(ct_defaults.udp),
        icmp: ct.icmp_timeout.map(Duration::from_secs).unwrap_or(ct_defaults.icmp),
    };
    let ct_config = ConnTrackConfig::default();

    StackOptions {
        protocols,
        seed: config.stack.seed.unwrap_or(defaults.seed),
        handle_local: config.handle_local(),
        forwarding: config.forwarding(),
        conntrack: ConnTrackConfig {
            buckets: ct.buckets.unwrap_or(ct_config.buckets),
            max_connections: ct.max_connections.unwrap_or(ct_config.max_connections),
            timeouts,
        },
        icmp_limit: config.icmp.limit.unwrap_or(defaults.icmp_limit),
        icmp_burst: config.icmp.burst.unwrap_or(defaults.icmp_burst),
        ephemeral_range: config.ports.ephemeral_range,
        buffer_size: config.buffer.chunk_size.unwrap_or(defaults.buffer_size),
        ..defaults
    }
}

/// Reaper period and buckets swept per tick.
pub fn maintenance_schedule(config: &Config) -> (Duration, usize) {
    let ct = &config.conntrack;
    (
        Duration::from_millis(ct.reap_interval_ms.unwrap_or(DEFAULT_REAP_INTERVAL_MS)),
        ct.reap_buckets.unwrap_or(DEFAULT_REAP_BUCKETS),
    )
}

/// Parsed pieces of a `[[nics]]` entry.
#[derive(Debug, Clone)]
pub struct NicPlan {
    pub id: u32,
    pub options: NicOptions,
    pub addresses: Vec<AddressWithPrefix>,
    pub mtu: u32,
    pub link_address: LinkAddress,
    pub loopback: bool,
}

pub fn nic_plan(nic: &NicConfig) -> Result<NicPlan> {
    let addresses = nic
        .addresses
        .iter()
        .map(|a| a.parse::<AddressWithPrefix>())
        .collect::<Result<Vec<_>>>()?;
    let link_address = match &nic.mac {
        Some(mac) => mac.parse()?,
        // Locally administered, derived from the id.
        None => {
            let id = nic.id.to_be_bytes();
            LinkAddress([0x02, 0x00, id[0], id[1], id[2], id[3]])
        }
    };
    Ok(NicPlan {
        id: nic.id,
        options: NicOptions {
            name: nic.name.clone(),
            disabled: false,
        },
        addresses,
        mtu: nic.mtu.unwrap_or(DEFAULT_MTU),
        link_address,
        loopback: nic.loopback,
    })
}

pub fn route_entries(config: &Config) -> Result<Vec<RouteEntry>> {
    config
        .routes
        .iter()
        .map(|r| {
            let destination = Subnet::parse(&r.destination)
                .ok_or_else(|| Error::Config(format!("invalid route destination: {}", r.destination)))?;
            let gateway = r
                .gateway
                .as_deref()
                .map(|g| {
                    g.parse::<IpAddr>()
                        .map_err(|_| Error::Config(format!("invalid gateway: {}", g)))
                })
                .transpose()?;
            Ok(RouteEntry {
                destination,
                gateway,
                nic: r.nic,
            })
        })
        .collect()
}

/// Compile `[iptables]` into replacement tables. Only tables mentioned by a
/// policy or rule are returned; the rest keep their defaults.
pub fn build_tables(config: &IptablesConfig) -> Result<Vec<(TableId, Table)>> {
    let mut builders: Vec<(TableId, TableBuilder)> = Vec::new();

    fn builder_for(builders: &mut Vec<(TableId, TableBuilder)>, id: TableId) -> TableBuilder {
        match builders.iter().position(|(t, _)| *t == id) {
            Some(i) => builders.remove(i).1,
            None => TableBuilder::new(id),
        }
    }

    for policy in &config.policies {
        let id: TableId = policy.table.parse()?;
        let hook: Hook = policy.hook.parse()?;
        let verdict = match policy.verdict.to_ascii_lowercase().as_str() {
            "accept" => RuleVerdict::Accept,
            "drop" => RuleVerdict::Drop,
            other => return Err(Error::Config(format!("invalid policy verdict: {}", other))),
        };
        let builder = builder_for(&mut builders, id).policy(hook, verdict)?;
        builders.push((id, builder));
    }

    for (index, rule) in config.rules.iter().enumerate() {
        let id: TableId = rule.table.parse()?;
        let hook: Hook = rule.hook.parse()?;
        let compiled = compile_rule(rule)
            .map_err(|e| Error::Config(format!("iptables.rules[{}]: {}", index, e)))?;
        let builder = builder_for(&mut builders, id).append(hook, compiled)?;
        builders.push((id, builder));
    }

    builders
        .into_iter()
        .map(|(id, builder)| Ok((id, builder.build()?)))
        .collect()
}

fn parse_protocol(s: &str) -> Result<TransportProtocolNumber> {
    match s.to_ascii_lowercase().as_str() {
        "tcp" => Ok(TransportProtocolNumber::TCP),
        "udp" => Ok(TransportProtocolNumber::UDP),
        "icmp" => Ok(TransportProtocolNumber::ICMP),
        other => other
            .parse::<u8>()
            .map(TransportProtocolNumber)
            .map_err(|_| Error::Config(format!("unknown protocol: {}", s))),
    }
}

fn parse_subnet(s: &str) -> Result<(Subnet, bool)> {
    let (s, invert) = match s.strip_prefix('!') {
        Some(rest) => (rest.trim(), true),
        None => (s, false),
    };
    let subnet = Subnet::parse(s).ok_or_else(|| Error::Config(format!("invalid address: {}", s)))?;
    Ok((subnet, invert))
}

fn parse_interface(s: &str) -> InterfaceMatch {
    match s.strip_prefix('!') {
        Some(rest) => InterfaceMatch::new(rest.trim(), true),
        None => InterfaceMatch::new(s, false),
    }
}

fn parse_ports(s: &str) -> Result<PortRange> {
    PortRange::parse(s).ok_or_else(|| Error::Config(format!("invalid port range: {}", s)))
}

fn parse_icmp_error(s: &str) -> Result<IcmpError> {
    match s.to_ascii_lowercase().as_str() {
        "net-unreachable" => Ok(IcmpError::NetUnreachable),
        "host-unreachable" => Ok(IcmpError::HostUnreachable),
        "protocol-unreachable" => Ok(IcmpError::ProtocolUnreachable),
        "port-unreachable" => Ok(IcmpError::PortUnreachable),
        "admin-prohibited" => Ok(IcmpError::AdminProhibited),
        other => Err(Error::Config(format!("unknown reject type: {}", other))),
    }
}

fn target_address(rule: &RuleConfig) -> Result<IpAddr> {
    let addr = rule
        .to_address
        .as_deref()
        .ok_or_else(|| Error::Config(format!("{} requires to_address", rule.target)))?;
    addr.parse()
        .map_err(|_| Error::Config(format!("invalid to_address: {}", addr)))
}

pub fn compile_rule(rule: &RuleConfig) -> Result<Rule> {
    let port = rule.to_port.unwrap_or(0);
    let mut compiled = match rule.target.to_ascii_lowercase().as_str() {
        "accept" => Rule::new(AcceptTarget),
        "drop" => Rule::new(DropTarget),
        "return" => Rule::new(ReturnTarget),
        "reject" => {
            let with = match &rule.reject_with {
                Some(s) => parse_icmp_error(s)?,
                None => IcmpError::PortUnreachable,
            };
            Rule::new(RejectTarget { with })
        }
        "redirect" => Rule::new(RedirectTarget { port }),
        "dnat" => Rule::new(DnatTarget {
            addr: target_address(rule)?,
            port,
        }),
        "snat" => Rule::new(SnatTarget {
            addr: target_address(rule)?,
            port,
        }),
        "masquerade" => Rule::new(MasqueradeTarget { port }),
        other => return Err(Error::Config(format!("unknown target: {}", other))),
    };

    let mut filter = IpHeaderFilter::default();
    if let Some(p) = &rule.protocol {
        filter.protocol = Some(parse_protocol(p)?);
    }
    if let Some(s) = &rule.source {
        let (subnet, invert) = parse_subnet(s)?;
        filter.src = Some(subnet);
        filter.src_invert = invert;
    }
    if let Some(s) = &rule.destination {
        let (subnet, invert) = parse_subnet(s)?;
        filter.dst = Some(subnet);
        filter.dst_invert = invert;
    }
    if let Some(s) = &rule.in_interface {
        filter.in_interface = parse_interface(s);
    }
    if let Some(s) = &rule.out_interface {
        filter.out_interface = parse_interface(s);
    }

    if rule.sport.is_some() || rule.dport.is_some() {
        let protocol = match filter.protocol {
            Some(p) if p == TransportProtocolNumber::TCP || p == TransportProtocolNumber::UDP => p,
            _ => return Err(Error::Config("port match requires protocol tcp or udp".into())),
        };
        compiled = compiled.with_matcher(PortMatcher {
            protocol,
            src: rule.sport.as_deref().map(parse_ports).transpose()?,
            dst: rule.dport.as_deref().map(parse_ports).transpose()?,
        });
    }
    if let Some(s) = &rule.state {
        let states = CtStates::parse(s).ok_or_else(|| Error::Config(format!("invalid state list: {}", s)))?;
        compiled = compiled.with_matcher(ConnStateMatcher { states });
    }

    Ok(compiled.with_filter(filter))
}
