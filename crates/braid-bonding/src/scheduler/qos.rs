//! QoS classification.
//!
//! A [`RuleSet`] is an immutable, priority-ordered list of rules. The
//! scheduler loads one snapshot per batch; updates replace the whole set.
//! Rules are tried in descending priority rank (configuration order breaks
//! ties) and the first match wins. Packets that match nothing get the
//! default best-effort action.

use serde::Deserialize;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::packet::{PacketMeta, PROTO_ICMP, PROTO_ICMPV6, PROTO_SCTP, PROTO_TCP, PROTO_UDP};

/// Rank given to unclassified traffic.
pub const DEFAULT_PRIORITY: u8 = 5;

// ─── Match Primitives ────────────────────────────────────────────────────────

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// Address or CIDR prefix, e.g. `192.168.1.100` or `10.0.0.0/8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPrefix {
    addr: IpAddr,
    len: u8,
}

impl IpPrefix {
    pub fn new(addr: IpAddr, len: u8) -> Option<Self> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        (len <= max).then_some(Self { addr, len })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                prefix_eq(u32::from(net) as u128, u32::from(ip) as u128, self.len, 32)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                prefix_eq(u128::from(net), u128::from(ip), self.len, 128)
            }
            _ => false,
        }
    }
}

fn prefix_eq(a: u128, b: u128, len: u8, bits: u8) -> bool {
    if len == 0 {
        return true;
    }
    let shift = (bits - len) as u32;
    (a >> shift) == (b >> shift)
}

impl FromStr for IpPrefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, len) = match s.split_once('/') {
            Some((a, l)) => (a, Some(l)),
            None => (s, None),
        };
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| format!("invalid address '{addr}'"))?;
        let len = match len {
            Some(l) => l
                .parse::<u8>()
                .map_err(|_| format!("invalid prefix length '{l}'"))?,
            None if addr.is_ipv4() => 32,
            None => 128,
        };
        IpPrefix::new(addr, len).ok_or_else(|| format!("prefix length {len} too long for {addr}"))
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

/// Parse a protocol name (`tcp`, `udp`, `icmp`, ...) or number.
pub fn parse_protocol(s: &str) -> Option<u8> {
    match s.trim().to_ascii_lowercase().as_str() {
        "tcp" => Some(PROTO_TCP),
        "udp" => Some(PROTO_UDP),
        "icmp" => Some(PROTO_ICMP),
        "icmpv6" | "ipv6-icmp" => Some(PROTO_ICMPV6),
        "sctp" => Some(PROTO_SCTP),
        other => other.parse().ok(),
    }
}

// ─── Rules ───────────────────────────────────────────────────────────────────

/// Match predicate. Every populated field must match. A field that needs
/// data the packet does not carry (a port rule against ICMP, an address
/// rule against a non-IP payload) does not match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchCriteria {
    pub src: Option<IpPrefix>,
    pub dst: Option<IpPrefix>,
    pub protocol: Option<u8>,
    pub src_ports: Option<PortRange>,
    pub dst_ports: Option<PortRange>,
    pub dscp: Option<u8>,
}

impl MatchCriteria {
    pub fn matches(&self, meta: &PacketMeta) -> bool {
        if let Some(dscp) = self.dscp {
            if meta.dscp != dscp {
                return false;
            }
        }
        let needs_flow = self.src.is_some()
            || self.dst.is_some()
            || self.protocol.is_some()
            || self.src_ports.is_some()
            || self.dst_ports.is_some();
        if !needs_flow {
            return true;
        }
        let Some(flow) = meta.flow else {
            return false;
        };

        if self.src.is_some_and(|p| !p.contains(flow.src)) {
            return false;
        }
        if self.dst.is_some_and(|p| !p.contains(flow.dst)) {
            return false;
        }
        if self.protocol.is_some_and(|p| p != flow.protocol) {
            return false;
        }
        if let Some(range) = self.src_ports {
            if !flow.src_port.is_some_and(|p| range.contains(p)) {
                return false;
            }
        }
        if let Some(range) = self.dst_ports {
            if !flow.dst_port.is_some_and(|p| range.contains(p)) {
                return false;
            }
        }
        true
    }
}

/// What the scheduler does with a matching packet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QosAction {
    /// Preferred link ids, most preferred first.
    pub link_preference: Vec<usize>,
    /// Token-bucket policed rate for the class, bits per second.
    pub bandwidth_ceiling_bps: Option<u64>,
    /// Links whose measured latency exceeds this get a near-zero weight.
    pub latency_ceiling: Option<Duration>,
    /// Links whose loss ratio exceeds this get a near-zero weight.
    pub loss_ceiling: Option<f64>,
    /// FEC on/off for the class; `None` uses the global default.
    pub fec: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QosRule {
    pub name: String,
    pub priority: u8,
    pub criteria: MatchCriteria,
    pub action: QosAction,
}

/// Result of classifying one packet.
#[derive(Debug, Clone, Copy)]
pub struct Classification<'a> {
    /// Index into [`RuleSet::rules`], `None` for the default action.
    pub rule: Option<usize>,
    pub priority: u8,
    pub action: &'a QosAction,
}

/// Immutable rule snapshot, sorted by descending priority.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<QosRule>,
    default_action: QosAction,
}

impl RuleSet {
    pub fn new(mut rules: Vec<QosRule>) -> Self {
        // Stable sort keeps configuration order among equal ranks.
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            rules,
            default_action: QosAction::default(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn rules(&self) -> &[QosRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn classify(&self, meta: &PacketMeta) -> Classification<'_> {
        match self
            .rules
            .iter()
            .enumerate()
            .find(|(_, r)| r.criteria.matches(meta))
        {
            Some((idx, rule)) => Classification {
                rule: Some(idx),
                priority: rule.priority,
                action: &rule.action,
            },
            None => Classification {
                rule: None,
                priority: DEFAULT_PRIORITY,
                action: &self.default_action,
            },
        }
    }
}
