//! Rule targets.

use super::conntrack::{Direction, NatRewrite, NatType};
use super::iptables_types::{Hook, HookContext, RuleVerdict, Target, TargetEnv, TargetKind};
use super::packet_buffer::PacketBuffer;
use super::registration::IcmpError;
use crate::tcpip::NetworkProtocolNumber;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::warn;

/// Lets the packet through this table.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptTarget;

impl Target for AcceptTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Accept
    }

    fn action(&self, _: &mut PacketBuffer, _: &HookContext<'_>, _: &TargetEnv<'_>) -> RuleVerdict {
        RuleVerdict::Accept
    }
}

/// Silently drops the packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropTarget;

impl Target for DropTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Drop
    }

    fn action(&self, _: &mut PacketBuffer, _: &HookContext<'_>, _: &TargetEnv<'_>) -> RuleVerdict {
        RuleVerdict::Drop
    }
}

/// Marks the end of a table's rules. Reaching it is a table bug.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorTarget;

impl Target for ErrorTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Error
    }

    fn action(&self, _: &mut PacketBuffer, ctx: &HookContext<'_>, _: &TargetEnv<'_>) -> RuleVerdict {
        warn!(hook = %ctx.hook, "reached error target, dropping packet");
        RuleVerdict::Drop
    }
}

/// Drops the packet and asks for an ICMP error. The error goes out after
/// the traversal, subject to the rate limiter.
#[derive(Debug, Clone, Copy)]
pub struct RejectTarget {
    pub with: IcmpError,
}

impl Default for RejectTarget {
    fn default() -> Self {
        Self {
            with: IcmpError::PortUnreachable,
        }
    }
}

impl Target for RejectTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Reject
    }

    fn action(&self, _: &mut PacketBuffer, _: &HookContext<'_>, env: &TargetEnv<'_>) -> RuleVerdict {
        env.pending_reject.set(Some(self.with));
        RuleVerdict::Drop
    }
}

/// Returns to the calling chain, or to the underflow of a built-in chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReturnTarget;

impl Target for ReturnTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Return
    }

    fn action(&self, _: &mut PacketBuffer, _: &HookContext<'_>, _: &TargetEnv<'_>) -> RuleVerdict {
        RuleVerdict::Return
    }
}

/// Continues evaluation at a rule index.
#[derive(Debug, Clone, Copy)]
pub struct JumpTarget(pub usize);

impl Target for JumpTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Jump(self.0)
    }

    fn action(&self, _: &mut PacketBuffer, _: &HookContext<'_>, _: &TargetEnv<'_>) -> RuleVerdict {
        RuleVerdict::Jump(self.0)
    }
}

/// Records a NAT decision on the packet's connection. The rewrite itself
/// happens once the NAT table is done with the hook.
fn record_nat(pkt: &PacketBuffer, env: &TargetEnv<'_>, nat: NatType, rewrite: NatRewrite) -> RuleVerdict {
    if let Some(tracked) = &pkt.conn {
        if tracked.direction == Direction::Original {
            env.conntrack.apply_nat(tracked, nat, Some(rewrite));
        }
    }
    RuleVerdict::Accept
}

fn destination_hook(hook: Hook) -> bool {
    matches!(hook, Hook::Prerouting | Hook::Output)
}

fn source_hook(hook: Hook) -> bool {
    matches!(hook, Hook::Input | Hook::Postrouting)
}

fn loopback_for(proto: NetworkProtocolNumber) -> IpAddr {
    if proto == NetworkProtocolNumber::IPV6 {
        IpAddr::V6(Ipv6Addr::LOCALHOST)
    } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }
}

/// Sends the packet to a local port: the incoming NIC's address in
/// prerouting, loopback in output.
#[derive(Debug, Clone, Copy)]
pub struct RedirectTarget {
    /// 0 keeps the destination port.
    pub port: u16,
}

impl Target for RedirectTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Redirect
    }

    fn action(&self, pkt: &mut PacketBuffer, ctx: &HookContext<'_>, env: &TargetEnv<'_>) -> RuleVerdict {
        let addr = match ctx.hook {
            Hook::Output => loopback_for(pkt.network_protocol_number),
            Hook::Prerouting => match ctx.address {
                Some(addr) => addr,
                None => return RuleVerdict::Drop,
            },
            hook => {
                warn!(%hook, "redirect used outside prerouting/output");
                return RuleVerdict::Drop;
            }
        };
        record_nat(pkt, env, NatType::Destination, NatRewrite { addr, port: self.port })
    }
}

/// Rewrites the destination.
#[derive(Debug, Clone, Copy)]
pub struct DnatTarget {
    pub addr: IpAddr,
    /// 0 keeps the destination port.
    pub port: u16,
}

impl Target for DnatTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Dnat
    }

    fn action(&self, pkt: &mut PacketBuffer, ctx: &HookContext<'_>, env: &TargetEnv<'_>) -> RuleVerdict {
        if !destination_hook(ctx.hook) {
            warn!(hook = %ctx.hook, "DNAT used outside prerouting/output");
            return RuleVerdict::Drop;
        }
        let rewrite = NatRewrite {
            addr: self.addr,
            port: self.port,
        };
        record_nat(pkt, env, NatType::Destination, rewrite)
    }
}

/// Rewrites the source.
#[derive(Debug, Clone, Copy)]
pub struct SnatTarget {
    pub addr: IpAddr,
    /// 0 keeps the source port when it does not collide.
    pub port: u16,
}

impl Target for SnatTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Snat
    }

    fn action(&self, pkt: &mut PacketBuffer, ctx: &HookContext<'_>, env: &TargetEnv<'_>) -> RuleVerdict {
        if !source_hook(ctx.hook) {
            warn!(hook = %ctx.hook, "SNAT used outside input/postrouting");
            return RuleVerdict::Drop;
        }
        let rewrite = NatRewrite {
            addr: self.addr,
            port: self.port,
        };
        record_nat(pkt, env, NatType::Source, rewrite)
    }
}

/// Rewrites the source to the outgoing route's local address.
#[derive(Debug, Clone, Copy, Default)]
pub struct MasqueradeTarget {
    pub port: u16,
}

impl Target for MasqueradeTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Masquerade
    }

    fn action(&self, pkt: &mut PacketBuffer, ctx: &HookContext<'_>, env: &TargetEnv<'_>) -> RuleVerdict {
        if ctx.hook != Hook::Postrouting {
            warn!(hook = %ctx.hook, "masquerade used outside postrouting");
            return RuleVerdict::Drop;
        }
        let Some(addr) = ctx.address else {
            return RuleVerdict::Drop;
        };
        record_nat(pkt, env, NatType::Source, NatRewrite { addr, port: self.port })
    }
}
