//! # Link Probes
//!
//! A [`Prober`] measures one round trip over one link. Two are shipped:
//!
//! - [`UdpEchoProber`]: a small UDP datagram (magic, probe id, send time)
//!   echoed back by the peer ([`EchoResponder`] is the peer side). Also
//!   runs the bandwidth burst.
//! - [`IcmpProber`]: ICMP echo over an unprivileged datagram socket
//!   (`net.ipv4.ping_group_range` must admit the process group).
//!
//! Both pin their socket to the link interface so the probe measures that
//! WAN path and not whatever the routing table prefers.

use anyhow::Context;
use bytes::{Buf, BufMut, BytesMut};
use quanta::Instant;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::{LinkConfig, ProbeKind};
use crate::net::util::{bind_to_device, bind_udp_for};

const PROBE_MAGIC: [u8; 4] = *b"BRDP";
/// magic + probe id + send time (µs since the Unix epoch)
const PROBE_HEADER: usize = 4 + 8 + 8;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_HEADER: usize = 8;

// ─── Samples ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    Reply(Duration),
    /// No reply within the probe timeout.
    Timeout,
    /// The probe could not be sent or the reply was an error.
    Failed,
}

impl ProbeOutcome {
    pub fn rtt(&self) -> Option<Duration> {
        match self {
            ProbeOutcome::Reply(rtt) => Some(*rtt),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Reply(_))
    }
}

impl From<&Result<Duration, ProbeError>> for ProbeOutcome {
    fn from(result: &Result<Duration, ProbeError>) -> Self {
        match result {
            Ok(rtt) => ProbeOutcome::Reply(*rtt),
            Err(ProbeError::Timeout) => ProbeOutcome::Timeout,
            Err(_) => ProbeOutcome::Failed,
        }
    }
}

/// One probe result, consumed once by the failover controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthSample {
    pub link_id: usize,
    pub kind: ProbeKind,
    pub outcome: ProbeOutcome,
    pub at: Instant,
}

impl HealthSample {
    pub fn reply(link_id: usize, kind: ProbeKind, rtt: Duration, at: Instant) -> Self {
        Self {
            link_id,
            kind,
            outcome: ProbeOutcome::Reply(rtt),
            at,
        }
    }

    pub fn timeout(link_id: usize, kind: ProbeKind, at: Instant) -> Self {
        Self {
            link_id,
            kind,
            outcome: ProbeOutcome::Timeout,
            at,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,
    #[error("link {0} has no probe target")]
    NoTarget(String),
    #[error("{0} is not supported")]
    Unsupported(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

// ─── Prober trait ────────────────────────────────────────────────────────────

pub trait Prober: Send + Sync {
    fn kind(&self) -> ProbeKind;

    /// One round trip over `link`, bounded by `timeout`.
    fn probe(&self, link: &LinkConfig, timeout: Duration) -> Result<Duration, ProbeError>;

    /// Bandwidth estimate in bits per second from a burst of `packets`
    /// datagrams of `size` bytes. `Ok(None)` when this prober cannot
    /// estimate or too few replies came back.
    fn burst(
        &self,
        _link: &LinkConfig,
        _packets: usize,
        _size: usize,
        _timeout: Duration,
    ) -> Result<Option<f64>, ProbeError> {
        Ok(None)
    }
}

fn probe_target(link: &LinkConfig) -> Result<SocketAddr, ProbeError> {
    link.probe_target
        .or(link.peer)
        .ok_or_else(|| ProbeError::NoTarget(link.name.clone()))
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Wait on `socket` until `accept` matches a datagram or `deadline` passes.
/// Returns the arrival time of the match.
fn wait_for(
    socket: &UdpSocket,
    buf: &mut [u8],
    deadline: Instant,
    mut accept: impl FnMut(&[u8]) -> bool,
) -> Result<Instant, ProbeError> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout);
        }
        socket.set_read_timeout(Some(remaining))?;
        match socket.recv(buf) {
            Ok(n) => {
                let at = Instant::now();
                if accept(&buf[..n]) {
                    return Ok(at);
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(ProbeError::Timeout)
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// ─── UDP echo ────────────────────────────────────────────────────────────────

fn encode_udp_probe(buf: &mut BytesMut, id: u64, size: usize) {
    buf.clear();
    buf.put_slice(&PROBE_MAGIC);
    buf.put_u64(id);
    buf.put_u64(unix_micros());
    if size > PROBE_HEADER {
        buf.put_bytes(0, size - PROBE_HEADER);
    }
}

/// Probe id of an echoed datagram, if it is one of ours.
fn parse_udp_probe(mut datagram: &[u8]) -> Option<u64> {
    if datagram.len() < PROBE_HEADER || datagram[..4] != PROBE_MAGIC {
        return None;
    }
    datagram.advance(4);
    Some(datagram.get_u64())
}

#[derive(Debug, Default)]
pub struct UdpEchoProber {
    next_id: AtomicU64,
}

impl UdpEchoProber {
    pub fn new() -> Self {
        Self::default()
    }

    fn connect(&self, link: &LinkConfig) -> Result<UdpSocket, ProbeError> {
        let target = probe_target(link)?;
        let socket = bind_udp_for(target, link.interface.as_deref())?;
        socket.connect(target)?;
        Ok(socket)
    }
}

impl Prober for UdpEchoProber {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Udp
    }

    fn probe(&self, link: &LinkConfig, timeout: Duration) -> Result<Duration, ProbeError> {
        let socket = self.connect(link)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut out = BytesMut::with_capacity(PROBE_HEADER);
        encode_udp_probe(&mut out, id, PROBE_HEADER);

        let sent = Instant::now();
        socket.send(&out)?;
        let mut buf = [0u8; 128];
        let arrived = wait_for(&socket, &mut buf, sent + timeout, |d| {
            parse_udp_probe(d) == Some(id)
        })?;
        Ok(arrived.saturating_duration_since(sent))
    }

    fn burst(
        &self,
        link: &LinkConfig,
        packets: usize,
        size: usize,
        timeout: Duration,
    ) -> Result<Option<f64>, ProbeError> {
        if packets < 2 {
            return Ok(None);
        }
        let size = size.max(PROBE_HEADER);
        let socket = self.connect(link)?;
        let base = self.next_id.fetch_add(packets as u64, Ordering::Relaxed);
        let ids = base..base + packets as u64;

        let mut out = BytesMut::with_capacity(size);
        for id in ids.clone() {
            encode_udp_probe(&mut out, id, size);
            socket.send(&out)?;
        }

        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; size.max(128)];
        let mut first = None;
        let mut last = None;
        let mut received = 0usize;
        while received < packets {
            let is_ours = |d: &[u8]| parse_udp_probe(d).is_some_and(|id| ids.contains(&id));
            match wait_for(&socket, &mut buf, deadline, is_ours) {
                Ok(at) => {
                    first.get_or_insert(at);
                    last = Some(at);
                    received += 1;
                }
                Err(ProbeError::Timeout) => break,
                Err(e) => return Err(e),
            }
        }

        let (Some(first), Some(last)) = (first, last) else {
            return Ok(None);
        };
        let span = last.saturating_duration_since(first).as_secs_f64();
        if received < 2 || span <= 0.0 {
            return Ok(None);
        }
        let bps = ((received - 1) * size * 8) as f64 / span;
        trace!(link_id = link.id, received, bps, "burst estimate");
        Ok(Some(bps))
    }
}

/// Peer side of the UDP echo probe: sends every probe datagram straight
/// back to its source. Stops on drop.
pub struct EchoResponder {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl EchoResponder {
    pub fn bind(addr: impl ToSocketAddrs) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr).context("binding echo responder")?;
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;
        let local = socket.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();

        let handle = thread::Builder::new()
            .name("braid-echo".into())
            .spawn(move || {
                let mut buf = vec![0u8; 65_535];
                while !stop.load(Ordering::Relaxed) {
                    match socket.recv_from(&mut buf) {
                        Ok((n, from)) if parse_udp_probe(&buf[..n]).is_some() => {
                            let _ = socket.send_to(&buf[..n], from);
                        }
                        Ok(_) => {}
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                            ) => {}
                        Err(e) => {
                            debug!(error = %e, "echo responder stopped");
                            break;
                        }
                    }
                }
            })
            .context("spawning echo responder")?;

        Ok(Self {
            addr: local,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EchoResponder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── ICMP echo ───────────────────────────────────────────────────────────────

/// RFC 1071 checksum.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn echo_request(sequence: u16) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(ICMP_HEADER + 8);
    pkt.put_u8(ICMP_ECHO_REQUEST);
    pkt.put_u8(0);
    pkt.put_u16(0);
    // Identifier; ping sockets replace it with the local port.
    pkt.put_u16(0);
    pkt.put_u16(sequence);
    pkt.put_u64(unix_micros());
    let csum = internet_checksum(&pkt);
    pkt[2..4].copy_from_slice(&csum.to_be_bytes());
    pkt
}

/// Sequence number of an echo reply. Ping sockets deliver the ICMP message
/// without the IP header.
fn parse_echo_reply(msg: &[u8]) -> Option<u16> {
    if msg.len() < ICMP_HEADER || msg[0] != ICMP_ECHO_REPLY || msg[1] != 0 {
        return None;
    }
    Some(u16::from_be_bytes([msg[6], msg[7]]))
}

fn icmp_socket() -> io::Result<UdpSocket> {
    use std::os::unix::io::FromRawFd;

    // SAFETY: socket(2) with constant arguments; on success the descriptor
    // is handed to exactly one owner below.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, libc::IPPROTO_ICMP) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` is a freshly created, valid datagram socket we own.
    Ok(unsafe { UdpSocket::from_raw_fd(fd) })
}

#[derive(Debug, Default)]
pub struct IcmpProber {
    next_seq: AtomicU16,
}

impl IcmpProber {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Prober for IcmpProber {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Icmp
    }

    fn probe(&self, link: &LinkConfig, timeout: Duration) -> Result<Duration, ProbeError> {
        let target = probe_target(link)?;
        let IpAddr::V4(ip) = target.ip() else {
            return Err(ProbeError::Unsupported("ICMP probing over IPv6"));
        };
        let socket = icmp_socket()?;
        if let Some(iface) = link.interface.as_deref() {
            bind_to_device(&socket, iface)?;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let request = echo_request(seq);
        let sent = Instant::now();
        socket.send_to(&request, SocketAddr::new(IpAddr::V4(ip), 0))?;
        let mut buf = [0u8; 128];
        let arrived = wait_for(&socket, &mut buf, sent + timeout, |m| {
            parse_echo_reply(m) == Some(seq)
        })?;
        Ok(arrived.saturating_duration_since(sent))
    }
}
