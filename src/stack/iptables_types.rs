//! Building blocks of the packet filter: hooks, rules, tables.

use super::conntrack::ConnTrack;
use super::packet_buffer::PacketBuffer;
use super::registration::IcmpError;
use crate::tcpip::{Subnet, TransportProtocolNumber};
use crate::{Error, Result};
use std::cell::Cell;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

/// Points in packet traversal where tables are consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// Before a received packet is routed.
    Prerouting = 0,
    /// Before a packet reaches a local endpoint.
    Input = 1,
    /// Once a packet has been picked for forwarding.
    Forward = 2,
    /// After a local endpoint wrote a packet.
    Output = 3,
    /// Just before a packet goes out on the wire.
    Postrouting = 4,
}

pub const NUM_HOOKS: usize = 5;

impl Hook {
    pub const ALL: [Hook; NUM_HOOKS] = [
        Hook::Prerouting,
        Hook::Input,
        Hook::Forward,
        Hook::Output,
        Hook::Postrouting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::Prerouting => "prerouting",
            Hook::Input => "input",
            Hook::Forward => "forward",
            Hook::Output => "output",
            Hook::Postrouting => "postrouting",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Hook {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Hook::ALL
            .into_iter()
            .find(|h| h.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Parse(format!("unknown hook: {}", s)))
    }
}

/// The built-in tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableId {
    Nat = 0,
    Mangle = 1,
    Filter = 2,
}

pub const NUM_TABLES: usize = 3;

impl TableId {
    pub const ALL: [TableId; NUM_TABLES] = [TableId::Nat, TableId::Mangle, TableId::Filter];

    /// Hooks this table may attach to.
    pub fn valid_hooks(&self) -> &'static [Hook] {
        match self {
            TableId::Nat => &[Hook::Prerouting, Hook::Input, Hook::Output, Hook::Postrouting],
            TableId::Mangle => &[Hook::Prerouting, Hook::Output],
            TableId::Filter => &[Hook::Input, Hook::Forward, Hook::Output],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TableId::Nat => "nat",
            TableId::Mangle => "mangle",
            TableId::Filter => "filter",
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TableId::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Parse(format!("unknown table: {}", s)))
    }
}

/// Outcome of evaluating one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleVerdict {
    /// Stop traversing this table; go on to the next one.
    Accept,
    /// Stop; the packet is dropped.
    Drop,
    /// Evaluate the next rule.
    Continue,
    /// Continue at the given rule index.
    Jump(usize),
    /// Return from the current chain.
    Return,
}

/// What a target does, for validation and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Accept,
    Drop,
    Error,
    Reject,
    Return,
    Jump(usize),
    Redirect,
    Dnat,
    Snat,
    Masquerade,
    Other,
}

impl TargetKind {
    pub fn is_nat(&self) -> bool {
        matches!(
            self,
            TargetKind::Redirect | TargetKind::Dnat | TargetKind::Snat | TargetKind::Masquerade
        )
    }
}

/// Per-traversal facts about where the packet is.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub hook: Hook,
    /// Name of the NIC the packet came in on, or empty.
    pub in_nic: &'a str,
    /// Name of the NIC the packet goes out of, or empty.
    pub out_nic: &'a str,
    /// Address used by Redirect (incoming NIC) and Masquerade (outgoing
    /// route).
    pub address: Option<IpAddr>,
}

/// Shared state a target may act on.
pub struct TargetEnv<'a> {
    pub conntrack: &'a ConnTrack,
    /// ICMP error a Reject target asked for. Sent by the caller once the
    /// table lock is released.
    pub pending_reject: Cell<Option<IcmpError>>,
}

impl<'a> TargetEnv<'a> {
    pub fn new(conntrack: &'a ConnTrack) -> Self {
        Self {
            conntrack,
            pending_reject: Cell::new(None),
        }
    }
}

/// Decides whether a packet matches.
pub trait Matcher: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Returns `(matches, hotdrop)`. A hotdrop drops the packet outright.
    fn matches(&self, ctx: &HookContext<'_>, pkt: &PacketBuffer) -> (bool, bool);
}

/// Acts on a matching packet.
pub trait Target: Send + Sync + fmt::Debug {
    fn kind(&self) -> TargetKind;

    fn action(
        &self,
        pkt: &mut PacketBuffer,
        ctx: &HookContext<'_>,
        env: &TargetEnv<'_>,
    ) -> RuleVerdict;
}

/// Interface name comparison with a byte mask.
///
/// `eth0` matches exactly that name; `eth+` matches every name starting
/// with `eth`. The empty pattern matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceMatch {
    name: Vec<u8>,
    mask: Vec<u8>,
    pub invert: bool,
}

impl InterfaceMatch {
    pub fn new(pattern: &str, invert: bool) -> Self {
        let (name, prefix) = match pattern.strip_suffix('+') {
            Some(stem) => (stem, true),
            None => (pattern, false),
        };
        let mut mask = vec![0xff; name.len()];
        if !prefix && !name.is_empty() {
            // Cover the terminator so "eth0" does not match "eth01".
            mask.push(0xff);
        }
        Self {
            name: name.as_bytes().to_vec(),
            mask,
            invert,
        }
    }

    pub fn is_any(&self) -> bool {
        self.mask.is_empty() && !self.invert
    }

    pub fn matches(&self, nic_name: &str) -> bool {
        if self.mask.is_empty() {
            return !self.invert;
        }
        let nic = nic_name.as_bytes();
        let hit = self.mask.iter().enumerate().all(|(i, m)| {
            let want = self.name.get(i).copied().unwrap_or(0);
            let have = nic.get(i).copied().unwrap_or(0);
            (want ^ have) & m == 0
        });
        hit != self.invert
    }
}

/// Header fields common to every rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpHeaderFilter {
    pub protocol: Option<TransportProtocolNumber>,
    pub src: Option<Subnet>,
    pub src_invert: bool,
    pub dst: Option<Subnet>,
    pub dst_invert: bool,
    pub in_interface: InterfaceMatch,
    pub out_interface: InterfaceMatch,
}

impl IpHeaderFilter {
    /// Whether the filter matches every packet.
    pub fn is_default(&self) -> bool {
        self == &IpHeaderFilter::default()
    }

    pub fn matches(
        &self,
        transport: Option<TransportProtocolNumber>,
        addrs: Option<(IpAddr, IpAddr)>,
        in_nic: &str,
        out_nic: &str,
    ) -> bool {
        if let Some(proto) = self.protocol {
            if transport != Some(proto) {
                return false;
            }
        }
        if let Some(src) = &self.src {
            let hit = addrs.is_some_and(|(s, _)| src.contains(&s));
            if hit == self.src_invert {
                return false;
            }
        }
        if let Some(dst) = &self.dst {
            let hit = addrs.is_some_and(|(_, d)| dst.contains(&d));
            if hit == self.dst_invert {
                return false;
            }
        }
        self.in_interface.matches(in_nic) && self.out_interface.matches(out_nic)
    }
}

/// One rule: filter, extra matchers, target.
#[derive(Debug, Clone)]
pub struct Rule {
    pub filter: IpHeaderFilter,
    pub matchers: Vec<Arc<dyn Matcher>>,
    pub target: Arc<dyn Target>,
}

impl Rule {
    /// A rule matching every packet.
    pub fn new(target: impl Target + 'static) -> Self {
        Self {
            filter: IpHeaderFilter::default(),
            matchers: Vec::new(),
            target: Arc::new(target),
        }
    }

    pub fn with_filter(mut self, filter: IpHeaderFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_matcher(mut self, matcher: impl Matcher + 'static) -> Self {
        self.matchers.push(Arc::new(matcher));
        self
    }
}

/// Rules plus per-hook entry points and underflows. `None` means the table
/// is not attached to that hook.
#[derive(Debug, Clone)]
pub struct Table {
    pub rules: Vec<Rule>,
    pub builtin_chains: [Option<usize>; NUM_HOOKS],
    pub underflows: [Option<usize>; NUM_HOOKS],
}

impl Table {
    /// Check that entry points, underflows and jumps reference real rules
    /// and that underflows can only accept or drop.
    pub fn validate(&self, id: TableId) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidTable(format!("{}: {}", id, msg)));
        let len = self.rules.len();
        if len == 0 {
            return invalid("no rules".into());
        }
        for hook in Hook::ALL {
            let entry = self.builtin_chains[hook as usize];
            let underflow = self.underflows[hook as usize];
            if !id.valid_hooks().contains(&hook) {
                if entry.is_some() || underflow.is_some() {
                    return invalid(format!("cannot attach to {}", hook));
                }
                continue;
            }
            let (Some(entry), Some(underflow)) = (entry, underflow) else {
                return invalid(format!("missing entry point or underflow for {}", hook));
            };
            if entry >= len || underflow >= len {
                return invalid(format!("{} references rule past the end", hook));
            }
            let rule = &self.rules[underflow];
            let policy = matches!(rule.target.kind(), TargetKind::Accept | TargetKind::Drop);
            if !rule.matchers.is_empty() || !rule.filter.is_default() || !policy {
                return invalid(format!("underflow for {} must accept or drop everything", hook));
            }
        }
        for (i, rule) in self.rules.iter().enumerate() {
            match rule.target.kind() {
                TargetKind::Jump(to) if to >= len => {
                    return invalid(format!("rule {} jumps past the end", i));
                }
                kind if kind.is_nat() && id != TableId::Nat => {
                    return invalid(format!("rule {} uses a NAT target", i));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Lays out a table: each attached hook's rules followed by its policy
/// rule (the underflow), then a trailing error rule.
#[derive(Debug)]
pub struct TableBuilder {
    id: TableId,
    chains: Vec<(Hook, Vec<Rule>, RuleVerdict)>,
}

impl TableBuilder {
    /// Every valid hook attached with an accept policy and no rules.
    pub fn new(id: TableId) -> Self {
        let chains = id
            .valid_hooks()
            .iter()
            .map(|h| (*h, Vec::new(), RuleVerdict::Accept))
            .collect();
        Self { id, chains }
    }

    fn chain_mut(&mut self, hook: Hook) -> Result<&mut (Hook, Vec<Rule>, RuleVerdict)> {
        let id = self.id;
        self.chains
            .iter_mut()
            .find(|(h, _, _)| *h == hook)
            .ok_or_else(|| Error::InvalidTable(format!("{}: cannot attach to {}", id, hook)))
    }

    pub fn append(mut self, hook: Hook, rule: Rule) -> Result<Self> {
        self.chain_mut(hook)?.1.push(rule);
        Ok(self)
    }

    /// Set the verdict for packets falling off `hook`'s chain. Only
    /// `Accept` and `Drop` are meaningful.
    pub fn policy(mut self, hook: Hook, verdict: RuleVerdict) -> Result<Self> {
        if !matches!(verdict, RuleVerdict::Accept | RuleVerdict::Drop) {
            return Err(Error::InvalidTable(format!(
                "{}: policy for {} must be accept or drop",
                self.id, hook
            )));
        }
        self.chain_mut(hook)?.2 = verdict;
        Ok(self)
    }

    pub fn build(self) -> Result<Table> {
        use super::iptables_targets::{AcceptTarget, DropTarget, ErrorTarget};

        let mut table = Table {
            rules: Vec::new(),
            builtin_chains: [None; NUM_HOOKS],
            underflows: [None; NUM_HOOKS],
        };
        for (hook, rules, policy) in self.chains {
            table.builtin_chains[hook as usize] = Some(table.rules.len());
            table.rules.extend(rules);
            table.underflows[hook as usize] = Some(table.rules.len());
            table.rules.push(match policy {
                RuleVerdict::Drop => Rule::new(DropTarget),
                _ => Rule::new(AcceptTarget),
            });
        }
        table.rules.push(Rule::new(ErrorTarget));
        table.validate(self.id)?;
        Ok(table)
    }
}

/// The accept-everything table installed at startup.
pub fn default_table(id: TableId) -> Table {
    use super::iptables_targets::{AcceptTarget, ErrorTarget};

    let mut table = Table {
        rules: Vec::new(),
        builtin_chains: [None; NUM_HOOKS],
        underflows: [None; NUM_HOOKS],
    };
    for hook in id.valid_hooks() {
        table.builtin_chains[*hook as usize] = Some(table.rules.len());
        table.underflows[*hook as usize] = Some(table.rules.len());
        table.rules.push(Rule::new(AcceptTarget));
    }
    table.rules.push(Rule::new(ErrorTarget));
    table
}
