//! Table traversal and NAT application.
//!
//! Each hook consults its tables in a fixed order. Within a table the
//! hook's built-in chain is walked rule by rule until a verdict comes out;
//! a chain that runs out of rules (or returns) yields the hook's underflow
//! rule. A dropped packet stops right there, an accepted one moves on to
//! the next table.
//!
//! NAT targets only record a decision on the packet's connection. Once the
//! NAT table is done with a hook, the packet is rewritten to whatever the
//! connection says it should look like in its direction.

use super::conntrack::{ConnTrack, Direction, NatType, TupleId};
use super::iptables_types::{
    HookContext, Hook, NUM_HOOKS, NUM_TABLES, RuleVerdict, Table, TableId, TargetEnv,
    default_table,
};
use super::icmp_rate_limit::IcmpRateLimiter;
use super::packet_buffer::PacketBuffer;
use super::registration::{IcmpError, IcmpErrorSink, Protocols, TransportEndpointId};
use crate::tcpip::{NetworkProtocolNumber, TransportProtocolNumber};
use crate::telemetry::StackStats;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// How deep jumps between chains may nest.
pub const MAX_JUMP_DEPTH: usize = 32;

const PRIORITIES: [&[TableId]; NUM_HOOKS] = [
    &[TableId::Mangle, TableId::Nat],
    &[TableId::Nat, TableId::Filter],
    &[TableId::Filter],
    &[TableId::Mangle, TableId::Nat, TableId::Filter],
    &[TableId::Nat],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainVerdict {
    Accept,
    Drop,
    Return,
}

struct TableSets {
    v4: [Table; NUM_TABLES],
    v6: [Table; NUM_TABLES],
    /// False until a table is replaced. Until then every packet passes
    /// without being tracked.
    modified: bool,
}

impl TableSets {
    fn get(&self, ipv6: bool) -> &[Table; NUM_TABLES] {
        if ipv6 { &self.v6 } else { &self.v4 }
    }
}

/// The packet filter.
pub struct IpTables {
    tables: RwLock<TableSets>,
    protocols: Protocols,
    conntrack: Arc<ConnTrack>,
    icmp_limiter: Arc<IcmpRateLimiter>,
    icmp_sink: RwLock<Option<Arc<dyn IcmpErrorSink>>>,
    stats: Arc<StackStats>,
}

impl IpTables {
    pub fn new(
        protocols: Protocols,
        conntrack: Arc<ConnTrack>,
        icmp_limiter: Arc<IcmpRateLimiter>,
        stats: Arc<StackStats>,
    ) -> Self {
        let defaults = || TableId::ALL.map(default_table);
        Self {
            tables: RwLock::new(TableSets {
                v4: defaults(),
                v6: defaults(),
                modified: false,
            }),
            protocols,
            conntrack,
            icmp_limiter,
            icmp_sink: RwLock::new(None),
            stats,
        }
    }

    pub fn conntrack(&self) -> &Arc<ConnTrack> {
        &self.conntrack
    }

    pub fn icmp_limiter(&self) -> &Arc<IcmpRateLimiter> {
        &self.icmp_limiter
    }

    /// Where Reject targets send their ICMP errors.
    pub fn set_icmp_error_sink(&self, sink: Option<Arc<dyn IcmpErrorSink>>) {
        *self.icmp_sink.write() = sink;
    }

    pub fn icmp_error_sink(&self) -> Option<Arc<dyn IcmpErrorSink>> {
        self.icmp_sink.read().clone()
    }

    pub fn is_modified(&self) -> bool {
        self.tables.read().modified
    }

    pub fn get_table(&self, id: TableId, ipv6: bool) -> Table {
        self.tables.read().get(ipv6)[id as usize].clone()
    }

    /// Swap in a new table. Packets in flight finish against the old one.
    pub fn replace_table(&self, id: TableId, table: Table, ipv6: bool) -> Result<()> {
        table.validate(id)?;
        let mut sets = self.tables.write();
        let set = if ipv6 { &mut sets.v6 } else { &mut sets.v4 };
        set[id as usize] = table;
        sets.modified = true;
        debug!(table = %id, ipv6, "replaced table");
        Ok(())
    }

    /// Run the tables attached to `ctx.hook`. Returns false if the packet
    /// must be dropped.
    pub fn check_packet(&self, pkt: &mut PacketBuffer, ctx: &HookContext<'_>) -> bool {
        let sets = self.tables.read();
        if !sets.modified {
            return true;
        }

        if matches!(ctx.hook, Hook::Prerouting | Hook::Output) && pkt.conn.is_none() {
            pkt.conn = self
                .protocols
                .packet_tuple(pkt)
                .and_then(|tuple| self.conntrack.get_or_create(&tuple));
        }

        let ipv6 = pkt.network_protocol_number == NetworkProtocolNumber::IPV6;
        let tables = sets.get(ipv6);
        let env = TargetEnv::new(&self.conntrack);

        let mut accepted = true;
        for id in PRIORITIES[ctx.hook as usize] {
            match self.check_table(pkt, ctx, &env, *id, &tables[*id as usize]) {
                ChainVerdict::Drop => {
                    trace!(hook = %ctx.hook, table = %id, "packet dropped");
                    accepted = false;
                    break;
                }
                _ => {
                    if *id == TableId::Nat {
                        self.apply_nat(pkt, ctx.hook);
                    }
                }
            }
        }
        let reject = env.pending_reject.take();
        drop(sets);

        if let Some(err) = reject.filter(|_| !accepted) {
            self.send_reject(pkt, ctx.hook, err);
        }
        self.stats.record_verdict(ctx.hook, accepted);
        accepted
    }

    /// Sends the error a Reject target asked for. Runs without the table
    /// lock so the sink may re-enter the filter.
    fn send_reject(&self, pkt: &PacketBuffer, hook: Hook, err: IcmpError) {
        let Some(sink) = self.icmp_error_sink() else {
            return;
        };
        if !self.icmp_limiter.allow() {
            self.stats.icmp_rate_limited.inc();
            return;
        }
        match sink.send_icmp_error(pkt.nic_id, err, pkt) {
            Ok(()) => self.stats.icmp_errors_sent.inc(),
            Err(e) => debug!(hook = %hook, error = %e, "failed to send reject"),
        }
    }

    fn check_table(
        &self,
        pkt: &mut PacketBuffer,
        ctx: &HookContext<'_>,
        env: &TargetEnv<'_>,
        id: TableId,
        table: &Table,
    ) -> ChainVerdict {
        let hook = ctx.hook as usize;
        let Some(start) = table.builtin_chains[hook] else {
            return ChainVerdict::Accept;
        };
        match self.check_chain(pkt, ctx, env, table, start, 0) {
            ChainVerdict::Return => {}
            verdict => return verdict,
        }
        let Some(underflow) = table.underflows[hook].and_then(|i| table.rules.get(i)) else {
            warn!(table = %id, hook = %ctx.hook, "table has no underflow, dropping");
            return ChainVerdict::Drop;
        };
        match underflow.target.action(pkt, ctx, env) {
            RuleVerdict::Accept => ChainVerdict::Accept,
            RuleVerdict::Drop => ChainVerdict::Drop,
            verdict => {
                warn!(table = %id, hook = %ctx.hook, ?verdict, "underflow did not accept or drop");
                ChainVerdict::Drop
            }
        }
    }

    fn check_chain(
        &self,
        pkt: &mut PacketBuffer,
        ctx: &HookContext<'_>,
        env: &TargetEnv<'_>,
        table: &Table,
        start: usize,
        depth: usize,
    ) -> ChainVerdict {
        if depth > MAX_JUMP_DEPTH {
            warn!(hook = %ctx.hook, "jump depth exceeded, dropping");
            return ChainVerdict::Drop;
        }
        let addrs = self.protocols.addresses(pkt);
        let mut index = start;
        while index < table.rules.len() {
            match self.check_rule(pkt, ctx, env, table, index, addrs) {
                RuleVerdict::Accept => return ChainVerdict::Accept,
                RuleVerdict::Drop => return ChainVerdict::Drop,
                RuleVerdict::Return => return ChainVerdict::Return,
                RuleVerdict::Continue => index += 1,
                RuleVerdict::Jump(to) if to == index + 1 => index += 1,
                RuleVerdict::Jump(to) => {
                    match self.check_chain(pkt, ctx, env, table, to, depth + 1) {
                        ChainVerdict::Return => index += 1,
                        verdict => return verdict,
                    }
                }
            }
        }
        ChainVerdict::Return
    }

    fn check_rule(
        &self,
        pkt: &mut PacketBuffer,
        ctx: &HookContext<'_>,
        env: &TargetEnv<'_>,
        table: &Table,
        index: usize,
        addrs: Option<(IpAddr, IpAddr)>,
    ) -> RuleVerdict {
        let rule = &table.rules[index];
        if !rule
            .filter
            .matches(pkt.transport_protocol_number, addrs, ctx.in_nic, ctx.out_nic)
        {
            return RuleVerdict::Continue;
        }
        for matcher in &rule.matchers {
            let (hit, hotdrop) = matcher.matches(ctx, pkt);
            if hotdrop {
                debug!(hook = %ctx.hook, matcher = matcher.name(), "hotdrop");
                return RuleVerdict::Drop;
            }
            if !hit {
                return RuleVerdict::Continue;
            }
        }
        rule.target.action(pkt, ctx, env)
    }

    /// Rewrite the packet to match its connection's NAT decisions for the
    /// manipulation `hook` performs. An undecided original-direction
    /// connection is settled as "no rewrite".
    fn apply_nat(&self, pkt: &mut PacketBuffer, hook: Hook) {
        let nat = match hook {
            Hook::Prerouting | Hook::Output => NatType::Destination,
            Hook::Input | Hook::Postrouting => NatType::Source,
            Hook::Forward => return,
        };
        let done = match nat {
            NatType::Destination => pkt.nat_done.destination,
            NatType::Source => pkt.nat_done.source,
        };
        if done {
            return;
        }
        let Some(tracked) = pkt.conn.clone() else {
            return;
        };
        if tracked.direction == Direction::Original && !tracked.conn.nat_decided(nat) {
            self.conntrack.apply_nat(&tracked, nat, None);
        }

        let target = tracked.nat_target();
        if let Some(current) = self.protocols.packet_tuple(pkt) {
            let result = match nat {
                NatType::Destination
                    if (current.dst_addr, current.dst_port) != (target.dst_addr, target.dst_port) =>
                {
                    debug!(hook = %hook, from = ?(current.dst_addr, current.dst_port), to = ?(target.dst_addr, target.dst_port), "rewriting destination");
                    self.rewrite(pkt, None, Some((target.dst_addr, target.dst_port)))
                }
                NatType::Source
                    if (current.src_addr, current.src_port) != (target.src_addr, target.src_port) =>
                {
                    debug!(hook = %hook, from = ?(current.src_addr, current.src_port), to = ?(target.src_addr, target.src_port), "rewriting source");
                    self.rewrite(pkt, Some((target.src_addr, target.src_port)), None)
                }
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(hook = %hook, error = %e, "NAT rewrite failed");
            }
        }
        match nat {
            NatType::Destination => pkt.nat_done.destination = true,
            NatType::Source => pkt.nat_done.source = true,
        }
    }

    fn rewrite(
        &self,
        pkt: &mut PacketBuffer,
        src: Option<(IpAddr, u16)>,
        dst: Option<(IpAddr, u16)>,
    ) -> Result<()> {
        let net = self
            .protocols
            .network(pkt.network_protocol_number)
            .ok_or(Error::UnknownProtocol)?
            .clone();
        net.rewrite_addresses(pkt, src.map(|s| s.0), dst.map(|d| d.0))?;

        let trans = pkt
            .transport_protocol_number
            .and_then(|n| self.protocols.transport(n))
            .ok_or(Error::UnknownProtocol)?
            .clone();
        let addrs = self.protocols.addresses(pkt).ok_or(Error::MalformedHeader)?;
        trans.rewrite_ports(pkt, addrs, src.map(|s| s.1), dst.map(|d| d.1))
    }

    /// Where a connection accepted by a local endpoint was originally
    /// headed before DNAT or redirect. `id` is the endpoint's view of the
    /// connection.
    pub fn original_destination(
        &self,
        id: &TransportEndpointId,
        network: NetworkProtocolNumber,
        transport: TransportProtocolNumber,
    ) -> Result<(IpAddr, u16)> {
        let (Some(local), Some(remote)) = (id.local_address, id.remote_address) else {
            return Err(Error::NotSupported);
        };
        // Packets from the endpoint travel in the reply direction.
        let reply = TupleId {
            src_addr: local,
            src_port: id.local_port,
            dst_addr: remote,
            dst_port: id.remote_port,
            network,
            transport,
        };
        let tracked = self.conntrack.lookup(&reply).ok_or(Error::NotSupported)?;
        if tracked.direction != Direction::Reply {
            return Err(Error::NotSupported);
        }
        let original = tracked.conn.original();
        Ok((original.dst_addr, original.dst_port))
    }
}

impl fmt::Debug for IpTables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpTables")
            .field("modified", &self.is_modified())
            .field("conntrack", &self.conntrack)
            .finish()
    }
}
