//! Ingress packet parsing.
//!
//! The pipeline receives raw IP packets from the local interface and needs
//! just enough of the header to classify them: the 5-tuple and the DSCP
//! marking. Anything that is not a well-formed IPv4/IPv6 header yields an
//! empty [`PacketMeta`] and falls through to the default QoS action.

use bytes::Bytes;
use quanta::Instant;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMPV6: u8 = 58;
pub const PROTO_SCTP: u8 = 132;

const EXT_HOP_BY_HOP: u8 = 0;
const EXT_ROUTING: u8 = 43;
const EXT_FRAGMENT: u8 = 44;
const EXT_DEST_OPTS: u8 = 60;
/// Bound on chained IPv6 extension headers walked before giving up.
const MAX_EXT_HEADERS: usize = 8;

/// Source/destination addresses, protocol and (for port-carrying
/// protocols) ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

/// Classification inputs extracted from a packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketMeta {
    pub flow: Option<FlowKey>,
    pub dscp: u8,
}

impl PacketMeta {
    /// Parse an IPv4 or IPv6 header. Never fails.
    pub fn parse(data: &[u8]) -> Self {
        match data.first().map(|b| b >> 4) {
            Some(4) => parse_ipv4(data).unwrap_or_default(),
            Some(6) => parse_ipv6(data).unwrap_or_default(),
            _ => PacketMeta::default(),
        }
    }

    pub fn protocol(&self) -> Option<u8> {
        self.flow.map(|f| f.protocol)
    }
}

/// A packet accepted at ingress, waiting to be scheduled.
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    /// Tunnel-wide sequence number, assigned at ingress.
    pub sequence: u64,
    pub payload: Bytes,
    pub meta: PacketMeta,
    /// Send timestamp carried in the frame, microseconds.
    pub timestamp_us: u64,
    /// When the packet entered the pipeline; bounds queue wait.
    pub enqueued_at: Instant,
}

impl OutboundPacket {
    pub fn new(sequence: u64, payload: Bytes, timestamp_us: u64, now: Instant) -> Self {
        let meta = PacketMeta::parse(&payload);
        Self {
            sequence,
            payload,
            meta,
            timestamp_us,
            enqueued_at: now,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

fn carries_ports(protocol: u8) -> bool {
    matches!(protocol, PROTO_TCP | PROTO_UDP | PROTO_SCTP)
}

fn read_ports(l4: &[u8]) -> (Option<u16>, Option<u16>) {
    if l4.len() < 4 {
        return (None, None);
    }
    (
        Some(u16::from_be_bytes([l4[0], l4[1]])),
        Some(u16::from_be_bytes([l4[2], l4[3]])),
    )
}

fn parse_ipv4(data: &[u8]) -> Option<PacketMeta> {
    if data.len() < 20 {
        return None;
    }
    let ihl = ((data[0] & 0x0F) as usize) * 4;
    if ihl < 20 || data.len() < ihl {
        return None;
    }
    let dscp = data[1] >> 2;
    let protocol = data[9];
    let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

    // Only the first fragment carries the transport header.
    let frag_offset = u16::from_be_bytes([data[6] & 0x1F, data[7]]);
    let (src_port, dst_port) = if carries_ports(protocol) && frag_offset == 0 {
        read_ports(&data[ihl..])
    } else {
        (None, None)
    };

    Some(PacketMeta {
        flow: Some(FlowKey {
            src: IpAddr::V4(src),
            dst: IpAddr::V4(dst),
            protocol,
            src_port,
            dst_port,
        }),
        dscp,
    })
}

fn parse_ipv6(data: &[u8]) -> Option<PacketMeta> {
    if data.len() < 40 {
        return None;
    }
    let traffic_class = ((data[0] & 0x0F) << 4) | (data[1] >> 4);
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&data[8..24]);
    dst.copy_from_slice(&data[24..40]);

    let upper = skip_ipv6_extensions(data[6], &data[40..]);
    let (protocol, src_port, dst_port) = match upper {
        Upper::Transport { protocol, l4 } if carries_ports(protocol) => {
            let (s, d) = read_ports(l4);
            (protocol, s, d)
        }
        Upper::Transport { protocol, .. } | Upper::Opaque(protocol) => (protocol, None, None),
    };

    Some(PacketMeta {
        flow: Some(FlowKey {
            src: IpAddr::V6(Ipv6Addr::from(src)),
            dst: IpAddr::V6(Ipv6Addr::from(dst)),
            protocol,
            src_port,
            dst_port,
        }),
        dscp: traffic_class >> 2,
    })
}

enum Upper<'a> {
    /// Upper-layer protocol with its header at the start of `l4`.
    Transport { protocol: u8, l4: &'a [u8] },
    /// Ports unreachable: truncated chain, non-first fragment or too many
    /// extension headers.
    Opaque(u8),
}

/// Walk Hop-by-Hop, Routing, Fragment and Destination Options headers.
fn skip_ipv6_extensions(mut next: u8, mut rest: &[u8]) -> Upper<'_> {
    for _ in 0..MAX_EXT_HEADERS {
        let len = match next {
            EXT_HOP_BY_HOP | EXT_ROUTING | EXT_DEST_OPTS => match rest.get(1) {
                Some(&units) => (units as usize + 1) * 8,
                None => return Upper::Opaque(next),
            },
            EXT_FRAGMENT => 8,
            _ => return Upper::Transport { protocol: next, l4: rest },
        };
        if rest.len() < len {
            return Upper::Opaque(next);
        }
        let following = rest[0];
        if next == EXT_FRAGMENT {
            // Only the first fragment carries the transport header.
            let offset = u16::from_be_bytes([rest[2], rest[3]]) >> 3;
            if offset != 0 {
                return Upper::Opaque(following);
            }
        }
        next = following;
        rest = &rest[len..];
    }
    Upper::Opaque(next)
}
