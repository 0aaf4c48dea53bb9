//! # UDP Transport
//!
//! One UDP socket per WAN link, pinned to the link's interface and connected
//! to the peer. Sealed frames go out with a single `send`; frames coming
//! back on the same socket are handed to the receive path by a reader
//! thread.

use anyhow::{Context, Result};
use bytes::Bytes;
use crossbeam_channel::{Sender, TrySendError};
use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::config::LinkConfig;
use crate::net::interface::LinkSender;
use crate::net::util::bind_udp_for;

/// Largest datagram the reader accepts.
const MAX_DATAGRAM: usize = 65_535;

/// A link backed by a connected UDP socket.
pub struct UdpLink {
    id: usize,
    socket: UdpSocket,
    bytes_sent: AtomicU64,
    packets_sent: AtomicU64,
}

impl UdpLink {
    /// Wrap an already bound and connected socket.
    pub fn new(id: usize, socket: UdpSocket) -> Self {
        UdpLink {
            id,
            socket,
            bytes_sent: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
        }
    }

    /// Open the socket for a configured link: bind on the interface (when
    /// set) and connect to the peer.
    pub fn open(config: &LinkConfig) -> Result<Self> {
        let peer = config
            .peer
            .with_context(|| format!("link {} has no peer address", config.name))?;
        let socket = bind_udp_for(peer, config.interface.as_deref()).with_context(|| {
            format!(
                "binding link {} to interface {}",
                config.name,
                config.interface.as_deref().unwrap_or("<any>")
            )
        })?;
        socket
            .connect(peer)
            .with_context(|| format!("connecting link {} to {peer}", config.name))?;
        debug!(link_id = config.id, %peer, "udp link open");
        Ok(Self::new(config.id, socket))
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Spawn a thread that reads frames from this link's socket into
    /// `sink` until `shutdown` is set. A full sink drops the frame.
    pub fn spawn_reader(
        &self,
        sink: Sender<Bytes>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<thread::JoinHandle<()>> {
        let socket = self.socket.try_clone().context("cloning link socket")?;
        spawn_udp_reader(self.id, socket, sink, shutdown)
    }
}

impl LinkSender for UdpLink {
    fn id(&self) -> usize {
        self.id
    }

    fn send(&self, frame: &[u8]) -> Result<usize> {
        let n = self.socket.send(frame)?;
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        Ok(n)
    }
}

/// Read datagrams from `socket` into `sink` on a named thread. Used for
/// link sockets and for a plain listening socket on the receiving end.
pub fn spawn_udp_reader(
    link_id: usize,
    socket: UdpSocket,
    sink: Sender<Bytes>,
    shutdown: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    socket
        .set_read_timeout(Some(Duration::from_millis(100)))
        .context("setting reader timeout")?;
    let handle = thread::Builder::new()
        .name(format!("braid-rx-{link_id}"))
        .spawn(move || {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            while !shutdown.load(Ordering::Relaxed) {
                let n = match socket.recv(&mut buf) {
                    Ok(n) => n,
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) =>
                    {
                        continue
                    }
                    // ICMP port unreachable from a connected socket: peer not up yet.
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => continue,
                    Err(e) => {
                        warn!(link_id, error = %e, "link reader stopped");
                        break;
                    }
                };
                match sink.try_send(Bytes::copy_from_slice(&buf[..n])) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        trace!(link_id, "receive queue full, frame dropped");
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
        })
        .context("spawning link reader")?;
    Ok(handle)
}
