//! # Pipeline Coordinator
//!
//! Runs every stage of the tunnel on its own thread, joined by bounded
//! queues:
//!
//! ```text
//! try_send ─▶ [rtrb ring] ─▶ braid-sched ─▶ [chan per link] ─▶ braid-tx-<id> ─▶ LinkSender
//!
//! inbound() / braid-rx-<id> ─▶ [chan] ─▶ braid-decode ─▶ [chan] ─▶ braid-reorder ─▶ egress()
//!
//! braid-probe: probe cycle ─▶ [chan] ─▶ braid-health: failover ─▶ LinkTable, path jitter
//! ```
//!
//! **Hot path** (packets) never blocks: a full ring or channel drops the
//! packet and counts it. **Control path** (link-down signals) goes through
//! a small crossbeam channel to the health thread, which never waits on a
//! probe: probing runs on its own thread and hands over whole cycles. QoS
//! rules are swapped atomically through an `ArcSwap`.
//!
//! Dropping the pipeline shuts it down: the send side drains for at most the
//! grace period, then the receive side does the same, and whatever is left is
//! discarded and counted.

use anyhow::{anyhow, bail, Context, Result};
use arc_swap::ArcSwap;
use bytes::Bytes;
use crossbeam_channel::{bounded, never, select, Receiver, RecvTimeoutError, Sender, TrySendError};
use quanta::Instant;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use braid_transport::crypto::{FrameCipher, PlaintextCipher};
use braid_transport::stats::FecDecodeStats;
use braid_transport::wire::ShardFrame;

use crate::config::BondingConfig;
use crate::error::{DropCounters, DropReason};
use crate::failover::FailoverController;
use crate::metrics::{FecSnapshot, LinkSnapshot, PipelineSnapshot};
use crate::monitor::probe::{IcmpProber, Prober, UdpEchoProber};
use crate::monitor::{CycleReport, HealthMonitor};
use crate::net::interface::LinkSender;
use crate::net::table::LinkTable;
use crate::net::transport::UdpLink;
use crate::packet::OutboundPacket;
use crate::receiver::{Assembled, ReorderBuffer, ReorderStats, Released, ShardAssembler};
use crate::scheduler::{BondingScheduler, Dispatch, RuleSet, SchedulerStats};

/// How often workers copy their counters into the shared stats.
const PUBLISH_INTERVAL: Duration = Duration::from_millis(50);
/// Receive-side wait per loop; bounds reorder poll latency.
const RECEIVE_TICK: Duration = Duration::from_millis(2);
const EXPIRE_INTERVAL: Duration = Duration::from_millis(10);
const CONTROL_CAPACITY: usize = 64;
const REPORT_CAPACITY: usize = 4;
/// Longest a control-plane thread goes without checking for shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketSendError {
    #[error("ingress ring full")]
    Full,
    #[error("pipeline shut down")]
    Disconnected,
}

enum HealthCommand {
    LinkDown(usize),
}

// ─── Shared counters ─────────────────────────────────────────────────────────

#[derive(Default)]
struct SendSide {
    scheduler: SchedulerStats,
    /// Drops outside the scheduler: full link channels, ring leftovers.
    drops: DropCounters,
}

#[derive(Default)]
struct ReceiveSide {
    fec: FecDecodeStats,
    drops: DropCounters,
}

#[derive(Default)]
struct SharedStats {
    send: Mutex<SendSide>,
    receive: Mutex<ReceiveSide>,
    reorder: Mutex<ReorderStats>,
    packets_in: AtomicU64,
    ingress_dropped: AtomicU64,
    delivered: AtomicU64,
    egress_dropped: AtomicU64,
    transitions: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Assembles a [`Pipeline`] from a configuration and the pieces the
/// configuration cannot describe: link senders, the frame cipher and the
/// health probers.
pub struct PipelineBuilder {
    config: BondingConfig,
    links: Vec<Arc<dyn LinkSender>>,
    readers: Vec<Arc<UdpLink>>,
    cipher: Arc<dyn FrameCipher>,
    probers: Vec<Arc<dyn Prober>>,
}

impl PipelineBuilder {
    pub fn new(config: BondingConfig) -> Self {
        Self {
            config,
            links: Vec::new(),
            readers: Vec::new(),
            cipher: Arc::new(PlaintextCipher),
            probers: Vec::new(),
        }
    }

    pub fn link(mut self, link: Arc<dyn LinkSender>) -> Self {
        self.links.push(link);
        self
    }

    /// A UDP link that also feeds its received datagrams into the pipeline.
    pub fn udp_link(mut self, link: UdpLink) -> Self {
        let link = Arc::new(link);
        self.links.push(link.clone());
        self.readers.push(link);
        self
    }

    pub fn cipher(mut self, cipher: Arc<dyn FrameCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.probers.push(prober);
        self
    }

    pub fn spawn(self) -> Result<Pipeline> {
        let PipelineBuilder {
            config,
            links,
            readers,
            cipher,
            probers,
        } = self;

        let table = Arc::new(LinkTable::new(config.links.iter().cloned()));
        let mut senders: HashMap<usize, Arc<dyn LinkSender>> = HashMap::new();
        for link in links {
            let id = link.id();
            if table.get(id).is_none() {
                bail!("link sender {id} has no configured link");
            }
            if senders.insert(id, link).is_some() {
                bail!("two senders for link {id}");
            }
        }
        if let Some(missing) = table.iter().find(|s| !senders.contains_key(&s.id())) {
            bail!("configured link {} ({}) has no sender", missing.id(), missing.config().name);
        }

        let rules = Arc::new(ArcSwap::from_pointee(config.qos.clone()));
        let scheduler = BondingScheduler::new(
            config.scheduler.clone(),
            config.fec.clone(),
            table.clone(),
            rules.clone(),
        )
        .context("invalid FEC parameters")?;

        let (ingress, ring) = rtrb::RingBuffer::new(config.scheduler.ingress_capacity);
        let (inbound_tx, inbound_rx) = bounded(config.pipeline.receive_capacity);
        let (assembled_tx, assembled_rx) = bounded(config.pipeline.receive_capacity);
        let (egress_tx, egress_rx) = bounded(config.pipeline.egress_capacity);
        let (control_tx, control_rx) = bounded(CONTROL_CAPACITY);

        let mut pipeline = Pipeline {
            ingress,
            next_sequence: 0,
            epoch: Instant::now(),
            inbound: inbound_tx.clone(),
            egress: egress_rx,
            table: table.clone(),
            rules,
            control: control_tx,
            shared: Arc::new(SharedStats::default()),
            send_shutdown: Arc::new(AtomicBool::new(false)),
            recv_shutdown: Arc::new(AtomicBool::new(false)),
            health_shutdown: Arc::new(AtomicBool::new(false)),
            path_jitter_ns: Arc::new(AtomicU64::new(0)),
            grace: config.pipeline.shutdown_grace,
            send_workers: Vec::new(),
            recv_workers: Vec::new(),
            health_workers: Vec::new(),
            stopped: false,
        };

        // Transmit workers first, so the scheduler has somewhere to send.
        let mut link_tx = HashMap::new();
        for slot in table.iter() {
            let id = slot.id();
            let Some(link) = senders.remove(&id) else {
                continue;
            };
            let (tx, rx) = bounded::<Bytes>(config.scheduler.link_queue_depth);
            let table = table.clone();
            let handle = thread::Builder::new()
                .name(format!("braid-tx-{id}"))
                .spawn(move || run_transmit(link, table, rx))
                .with_context(|| format!("spawning transmit worker for link {id}"))?;
            pipeline.send_workers.push(handle);
            link_tx.insert(id, tx);
        }

        let sched = SchedWorker {
            ring,
            scheduler,
            cipher: cipher.clone(),
            link_tx,
            shared: pipeline.shared.clone(),
            shutdown: pipeline.send_shutdown.clone(),
            grace: pipeline.grace,
            drops: DropCounters::default(),
        };
        let handle = thread::Builder::new()
            .name("braid-sched".into())
            .spawn(move || sched.run())
            .context("spawning scheduler worker")?;
        // The scheduler joins before the transmit workers it feeds.
        pipeline.send_workers.insert(0, handle);

        let decode = DecodeWorker {
            inbound: inbound_rx,
            out: assembled_tx,
            cipher,
            assembler: ShardAssembler::new(config.fec.assembly_timeout),
            shared: pipeline.shared.clone(),
            shutdown: pipeline.recv_shutdown.clone(),
            grace: pipeline.grace,
            drops: DropCounters::default(),
        };
        let handle = thread::Builder::new()
            .name("braid-decode".into())
            .spawn(move || decode.run())
            .context("spawning decode worker")?;
        pipeline.recv_workers.push(handle);

        let reorder = ReorderWorker {
            input: assembled_rx,
            egress: egress_tx,
            buffer: ReorderBuffer::starting_at(0, config.reorder.clone()),
            shared: pipeline.shared.clone(),
            path_jitter_ns: pipeline.path_jitter_ns.clone(),
        };
        let handle = thread::Builder::new()
            .name("braid-reorder".into())
            .spawn(move || reorder.run())
            .context("spawning reorder worker")?;
        pipeline.recv_workers.push(handle);

        for link in readers {
            let handle = link
                .spawn_reader(inbound_tx.clone(), pipeline.recv_shutdown.clone())
                .with_context(|| format!("spawning reader for link {}", link.id()))?;
            pipeline.recv_workers.push(handle);
        }

        let reports = if config.monitor.enabled {
            let (report_tx, report_rx) = bounded(REPORT_CAPACITY);
            let probe = ProbeWorker {
                monitor: HealthMonitor::new(config.monitor.clone(), table.clone(), probers),
                reports: report_tx,
                shutdown: pipeline.health_shutdown.clone(),
            };
            let handle = thread::Builder::new()
                .name("braid-probe".into())
                .spawn(move || probe.run())
                .context("spawning probe worker")?;
            pipeline.health_workers.push(handle);
            report_rx
        } else {
            never()
        };

        let health = HealthWorker {
            failover: FailoverController::new(config.failover.clone(), table.clone()),
            table,
            control: control_rx,
            reports,
            shared: pipeline.shared.clone(),
            shutdown: pipeline.health_shutdown.clone(),
            path_jitter_ns: pipeline.path_jitter_ns.clone(),
        };
        let handle = thread::Builder::new()
            .name("braid-health".into())
            .spawn(move || health.run())
            .context("spawning health worker")?;
        pipeline.health_workers.insert(0, handle);

        info!(
            links = pipeline.table.len(),
            mode = ?config.scheduler.mode,
            rules = config.qos.len(),
            fec = config.fec.enabled,
            "pipeline started"
        );
        Ok(pipeline)
    }
}

// ─── Pipeline handle ─────────────────────────────────────────────────────────

/// Handle to a running tunnel data plane.
pub struct Pipeline {
    ingress: rtrb::Producer<OutboundPacket>,
    next_sequence: u64,
    epoch: Instant,
    inbound: Sender<Bytes>,
    egress: Receiver<Released>,
    table: Arc<LinkTable>,
    rules: Arc<ArcSwap<RuleSet>>,
    control: Sender<HealthCommand>,
    shared: Arc<SharedStats>,
    send_shutdown: Arc<AtomicBool>,
    recv_shutdown: Arc<AtomicBool>,
    health_shutdown: Arc<AtomicBool>,
    path_jitter_ns: Arc<AtomicU64>,
    grace: Duration,
    send_workers: Vec<thread::JoinHandle<()>>,
    recv_workers: Vec<thread::JoinHandle<()>>,
    /// Health thread first, then the probe thread (when monitoring).
    health_workers: Vec<thread::JoinHandle<()>>,
    stopped: bool,
}

impl Pipeline {
    pub fn builder(config: BondingConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Opens a UDP socket per configured link (bound to its interface when
    /// one is named), reads replies from each, and probes with ICMP and UDP
    /// echo.
    pub fn from_config(config: BondingConfig) -> Result<Self> {
        let mut builder = PipelineBuilder::new(config.clone())
            .prober(Arc::new(IcmpProber::new()))
            .prober(Arc::new(UdpEchoProber::new()));
        for link in &config.links {
            let udp = UdpLink::open(link).with_context(|| format!("opening link {}", link.name))?;
            builder = builder.udp_link(udp);
        }
        builder.spawn()
    }

    /// Accept one raw IP packet. Assigns the next tunnel sequence number on
    /// success and returns it; a full ring consumes no number.
    pub fn try_send(&mut self, payload: Bytes) -> Result<u64, PacketSendError> {
        if self.send_shutdown.load(Ordering::Relaxed) {
            return Err(PacketSendError::Disconnected);
        }
        let now = Instant::now();
        let timestamp_us = now.saturating_duration_since(self.epoch).as_micros() as u64;
        let sequence = self.next_sequence;
        let packet = OutboundPacket::new(sequence, payload, timestamp_us, now);
        match self.ingress.push(packet) {
            Ok(()) => {
                self.next_sequence += 1;
                self.shared.packets_in.fetch_add(1, Ordering::Relaxed);
                Ok(sequence)
            }
            Err(_) => {
                self.shared.ingress_dropped.fetch_add(1, Ordering::Relaxed);
                Err(PacketSendError::Full)
            }
        }
    }

    /// Sender for raw frames received from the wire.
    pub fn inbound(&self) -> Sender<Bytes> {
        self.inbound.clone()
    }

    /// In-order packets leaving the tunnel.
    pub fn egress(&self) -> &Receiver<Released> {
        &self.egress
    }

    pub fn table(&self) -> &Arc<LinkTable> {
        &self.table
    }

    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.load_full()
    }

    /// Replace the QoS rule set. Packets already being scheduled finish
    /// under the old set.
    pub fn update_rules(&self, rules: RuleSet) {
        info!(rules = rules.len(), "QoS rules updated");
        self.rules.store(Arc::new(rules));
    }

    /// Interface layer reports `link_id` down.
    pub fn link_down(&self, link_id: usize) -> Result<()> {
        self.control
            .send(HealthCommand::LinkDown(link_id))
            .map_err(|e| anyhow!("failed to signal link down: {e}"))
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        let shared = &self.shared;
        let (scheduler, mut drops) = {
            let send = lock(&shared.send);
            (send.scheduler.clone(), send.drops)
        };
        let (fec_decode, receive_drops) = {
            let receive = lock(&shared.receive);
            (receive.fec.clone(), receive.drops)
        };
        let reorder = *lock(&shared.reorder);

        drops.merge(&scheduler.drops);
        drops.merge(&receive_drops);
        drops.add(DropReason::BufferCapacityExceeded, reorder.capacity_drops);
        drops.add(DropReason::BufferAgeExceeded, reorder.age_drops);
        drops.add(DropReason::Late, reorder.late);
        drops.add(DropReason::Duplicate, reorder.duplicate);
        drops.add(
            DropReason::QueueOverflow,
            shared.ingress_dropped.load(Ordering::Relaxed)
                + shared.egress_dropped.load(Ordering::Relaxed),
        );

        let links = self
            .table
            .iter()
            .map(|slot| LinkSnapshot::capture(slot, scheduler.links.get(&slot.id())))
            .collect();

        PipelineSnapshot {
            uptime_ms: Instant::now().saturating_duration_since(self.epoch).as_millis() as u64,
            packets_in: shared.packets_in.load(Ordering::Relaxed),
            packets_scheduled: scheduler.packets_scheduled,
            packets_delivered: shared.delivered.load(Ordering::Relaxed),
            queue_depth: scheduler.queue_depth,
            links,
            fec: FecSnapshot::new(scheduler.fec, fec_decode),
            auth_failures: drops.authentication_failure,
            reorder,
            drops,
            failover_transitions: shared.transitions.load(Ordering::Relaxed),
        }
    }

    /// Drain and stop every worker. Idempotent.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let started = Instant::now();

        // Send side first: the scheduler drains the ring, then the transmit
        // workers drain their channels and exit when it hangs up.
        self.send_shutdown.store(true, Ordering::Relaxed);
        join_all(&mut self.send_workers);

        self.recv_shutdown.store(true, Ordering::Relaxed);
        join_all(&mut self.recv_workers);

        // A probe in flight finishes before its thread joins.
        self.health_shutdown.store(true, Ordering::Relaxed);
        join_all(&mut self.health_workers);
        info!(
            took = ?Instant::now().saturating_duration_since(started),
            grace = ?self.grace,
            "pipeline stopped"
        );
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join_all(handles: &mut Vec<thread::JoinHandle<()>>) {
    for handle in handles.drain(..) {
        let name = handle.thread().name().unwrap_or("worker").to_string();
        if handle.join().is_err() {
            error!(worker = %name, "worker panicked");
        }
    }
}

// ─── Send side ───────────────────────────────────────────────────────────────

struct SchedWorker {
    ring: rtrb::Consumer<OutboundPacket>,
    scheduler: BondingScheduler,
    cipher: Arc<dyn FrameCipher>,
    link_tx: HashMap<usize, Sender<Bytes>>,
    shared: Arc<SharedStats>,
    shutdown: Arc<AtomicBool>,
    grace: Duration,
    drops: DropCounters,
}

impl SchedWorker {
    fn run(mut self) {
        let batch_size = self.scheduler.config().batch_size;
        let mut batch: Vec<Dispatch> = Vec::with_capacity(batch_size);
        let mut last_publish = Instant::now();
        let mut deadline: Option<Instant> = None;

        loop {
            let mut pulled = 0;
            while pulled < batch_size {
                let Ok(packet) = self.ring.pop() else {
                    break;
                };
                let sequence = packet.sequence;
                if let Err(reason) = self.scheduler.enqueue(packet) {
                    trace!(sequence, reason = reason.as_str(), "packet not queued");
                }
                pulled += 1;
            }

            let now = Instant::now();
            batch.clear();
            let scheduled = self.scheduler.run_batch(now, &mut batch);
            for dispatch in batch.drain(..) {
                self.transmit(dispatch);
            }

            if now.saturating_duration_since(last_publish) >= PUBLISH_INTERVAL {
                self.publish();
                last_publish = now;
            }

            if self.shutdown.load(Ordering::Relaxed) {
                let until = *deadline.get_or_insert_with(|| {
                    debug!(pending = self.scheduler.pending(), "scheduler draining");
                    now + self.grace
                });
                let drained = self.ring.slots() == 0 && self.scheduler.pending() == 0;
                if drained || now >= until {
                    break;
                }
            }

            // Brief yield when idle to avoid burning CPU
            if pulled == 0 && scheduled == 0 {
                thread::sleep(Duration::from_micros(100));
            }
        }

        let discarded = self.scheduler.discard_pending();
        let mut leftover = 0u64;
        while self.ring.pop().is_ok() {
            leftover += 1;
        }
        self.drops.add(DropReason::Shutdown, leftover);
        if discarded > 0 || leftover > 0 {
            warn!(discarded, leftover, "send side discarded packets at shutdown");
        }
        self.publish();
    }

    fn transmit(&mut self, dispatch: Dispatch) {
        let Some(tx) = self.link_tx.get(&dispatch.link_id) else {
            self.drops.record(DropReason::LinkIneligible);
            return;
        };
        let frame = self.cipher.seal(
            &dispatch.shard.encode(),
            dispatch.sequence,
            dispatch.timestamp_us,
        );
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.drops.record(DropReason::QueueOverflow);
                trace!(link_id = dispatch.link_id, sequence = dispatch.sequence, "link queue full");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.drops.record(DropReason::LinkIneligible);
            }
        }
    }

    fn publish(&self) {
        let mut send = lock(&self.shared.send);
        send.scheduler = self.scheduler.stats().clone();
        send.drops = self.drops;
    }
}

fn run_transmit(link: Arc<dyn LinkSender>, table: Arc<LinkTable>, rx: Receiver<Bytes>) {
    let link_id = link.id();
    let Some(slot) = table.get(link_id) else {
        return;
    };
    let mut consecutive_errors: u64 = 0;
    for frame in rx.iter() {
        match link.send(&frame) {
            Ok(n) => {
                slot.record_sent(n);
                consecutive_errors = 0;
            }
            Err(e) => {
                slot.record_send_error();
                consecutive_errors += 1;
                if consecutive_errors == 1 {
                    warn!(link_id, error = %e, "link send failed");
                } else if consecutive_errors.is_multiple_of(1000) {
                    warn!(link_id, consecutive_errors, error = %e, "link send still failing");
                }
            }
        }
    }
    debug!(link_id, "transmit worker stopped");
}

// ─── Receive side ────────────────────────────────────────────────────────────

struct DecodeWorker {
    inbound: Receiver<Bytes>,
    out: Sender<Assembled>,
    cipher: Arc<dyn FrameCipher>,
    assembler: ShardAssembler,
    shared: Arc<SharedStats>,
    shutdown: Arc<AtomicBool>,
    grace: Duration,
    drops: DropCounters,
}

impl DecodeWorker {
    fn run(mut self) {
        let mut last_publish = Instant::now();
        let mut last_expire = Instant::now();
        let mut deadline: Option<Instant> = None;

        loop {
            match self.inbound.recv_timeout(RECEIVE_TICK) {
                Ok(frame) => {
                    self.handle(frame, Instant::now());
                    while let Ok(frame) = self.inbound.try_recv() {
                        self.handle(frame, Instant::now());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            if now.saturating_duration_since(last_expire) >= EXPIRE_INTERVAL {
                for lost in self.assembler.expire(now) {
                    self.forward(lost);
                }
                last_expire = now;
            }
            if now.saturating_duration_since(last_publish) >= PUBLISH_INTERVAL {
                self.publish();
                last_publish = now;
            }

            if self.shutdown.load(Ordering::Relaxed) {
                let until = *deadline.get_or_insert(now + self.grace);
                if self.inbound.is_empty() || now >= until {
                    break;
                }
            }
        }

        let leftover = self.inbound.try_iter().count() as u64;
        self.drops.add(DropReason::Shutdown, leftover);
        for lost in self.assembler.flush() {
            self.forward(lost);
        }
        self.publish();
        debug!(leftover, "decode worker stopped");
    }

    fn handle(&mut self, frame: Bytes, now: Instant) {
        let opened = match self.cipher.open(frame) {
            Ok(opened) => opened,
            Err(_) => {
                self.drops.record(DropReason::AuthenticationFailure);
                trace!("frame failed authentication");
                return;
            }
        };
        let shard = match ShardFrame::decode(opened.plaintext) {
            Ok(shard) => shard,
            Err(e) => {
                self.drops.record(DropReason::Malformed);
                trace!(sequence = opened.sequence, error = %e, "malformed shard");
                return;
            }
        };
        if let Some(assembled) = self.assembler.push(opened.sequence, shard, now) {
            self.forward(assembled);
        }
    }

    fn forward(&mut self, assembled: Assembled) {
        if matches!(assembled, Assembled::Lost { .. }) {
            self.drops.record(DropReason::FecInsufficientShards);
        }
        if self.out.try_send(assembled).is_err() {
            self.drops.record(DropReason::QueueOverflow);
        }
    }

    fn publish(&self) {
        let mut receive = lock(&self.shared.receive);
        receive.fec = self.assembler.stats().clone();
        receive.drops = self.drops;
    }
}

struct ReorderWorker {
    input: Receiver<Assembled>,
    egress: Sender<Released>,
    buffer: ReorderBuffer,
    shared: Arc<SharedStats>,
    path_jitter_ns: Arc<AtomicU64>,
}

impl ReorderWorker {
    /// Runs until the decode worker hangs up, then flushes.
    fn run(mut self) {
        let mut last_publish = Instant::now();
        loop {
            match self.input.recv_timeout(RECEIVE_TICK) {
                Ok(item) => {
                    self.accept(item, Instant::now());
                    while let Ok(item) = self.input.try_recv() {
                        self.accept(item, Instant::now());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            let path = Duration::from_nanos(self.path_jitter_ns.load(Ordering::Relaxed));
            self.buffer.set_path_jitter(path);
            for released in self.buffer.poll(now) {
                self.deliver(released);
            }
            if now.saturating_duration_since(last_publish) >= PUBLISH_INTERVAL {
                self.publish();
                last_publish = now;
            }
        }

        for released in self.buffer.flush() {
            self.deliver(released);
        }
        self.publish();
        debug!("reorder worker stopped");
    }

    fn accept(&mut self, item: Assembled, now: Instant) {
        match item {
            Assembled::Packet {
                sequence, payload, ..
            } => {
                self.buffer.insert(sequence, payload, now);
            }
            Assembled::Lost { sequence } => self.buffer.mark_lost(sequence),
        }
    }

    fn deliver(&self, released: Released) {
        trace!(sequence = released.sequence, after_gap = released.after_gap, "release");
        match self.egress.try_send(released) {
            Ok(()) => {
                self.shared.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.shared.egress_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn publish(&self) {
        *lock(&self.shared.reorder) = self.buffer.stats();
    }
}

// ─── Health ──────────────────────────────────────────────────────────────────

/// Runs probe cycles on the monitor's interval and hands each report to the
/// health worker.
struct ProbeWorker {
    monitor: HealthMonitor,
    reports: Sender<CycleReport>,
    shutdown: Arc<AtomicBool>,
}

impl ProbeWorker {
    fn run(mut self) {
        let interval = self.monitor.config().interval;
        let mut next_cycle = Instant::now();

        while !self.shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now < next_cycle {
                thread::sleep(next_cycle.saturating_duration_since(now).min(SHUTDOWN_POLL));
                continue;
            }
            next_cycle = now + interval;
            let report = self.monitor.run_cycle();
            if self.reports.send(report).is_err() {
                break;
            }
        }
        debug!(cycles = self.monitor.cycles(), "probe worker stopped");
    }
}

struct HealthWorker {
    failover: FailoverController,
    table: Arc<LinkTable>,
    control: Receiver<HealthCommand>,
    reports: Receiver<CycleReport>,
    shared: Arc<SharedStats>,
    shutdown: Arc<AtomicBool>,
    path_jitter_ns: Arc<AtomicU64>,
}

impl HealthWorker {
    fn run(mut self) {
        let control = self.control.clone();
        let reports = self.reports.clone();
        let mut cycles = 0u64;

        while !self.shutdown.load(Ordering::Relaxed) {
            select! {
                recv(control) -> command => match command {
                    Ok(HealthCommand::LinkDown(link_id)) => self.link_down(link_id),
                    Err(_) => break,
                },
                recv(reports) -> report => match report {
                    Ok(report) => {
                        cycles += 1;
                        self.apply(report);
                    }
                    Err(_) => break,
                },
                default(SHUTDOWN_POLL) => {}
            }
        }
        debug!(cycles, "health worker stopped");
    }

    fn link_down(&mut self, link_id: usize) {
        if self.failover.link_down(link_id, Instant::now()).is_some() {
            self.shared.transitions.fetch_add(1, Ordering::Relaxed);
        }
        self.publish_path_jitter();
    }

    fn apply(&mut self, report: CycleReport) {
        let mut taken = 0u64;
        for recorded in &report.samples {
            taken += self.failover.observe(&recorded.sample, &recorded.health).len() as u64;
        }
        for link_id in report.interfaces_down {
            if self.failover.link_down(link_id, Instant::now()).is_some() {
                taken += 1;
            }
        }
        self.shared.transitions.fetch_add(taken, Ordering::Relaxed);
        self.publish_path_jitter();
    }

    fn publish_path_jitter(&self) {
        let jitter = self.table.worst_eligible_jitter();
        self.path_jitter_ns
            .store(jitter.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LinkConfig, ProbeKind};
    use crate::monitor::ProbeError;
    use crate::net::interface::LinkState;

    /// Hands every frame straight back to a receive channel.
    struct LoopbackLink {
        id: usize,
        sink: Mutex<Option<Sender<Bytes>>>,
    }

    impl LinkSender for LoopbackLink {
        fn id(&self) -> usize {
            self.id
        }

        fn send(&self, frame: &[u8]) -> Result<usize> {
            if let Some(sink) = lock(&self.sink).as_ref() {
                let _ = sink.try_send(Bytes::copy_from_slice(frame));
            }
            Ok(frame.len())
        }
    }

    fn config(links: usize) -> BondingConfig {
        let mut config = BondingConfig::default();
        config.links = (0..links).map(|i| LinkConfig::new(i, format!("wan{i}"))).collect();
        config.monitor.enabled = false;
        config.pipeline.shutdown_grace = Duration::from_millis(200);
        config
    }

    fn loopback(config: BondingConfig) -> (Pipeline, Vec<Arc<LoopbackLink>>) {
        let links: Vec<Arc<LoopbackLink>> = config
            .links
            .iter()
            .map(|l| {
                Arc::new(LoopbackLink {
                    id: l.id,
                    sink: Mutex::new(None),
                })
            })
            .collect();
        let mut builder = Pipeline::builder(config);
        for link in &links {
            builder = builder.link(link.clone());
        }
        let pipeline = builder.spawn().unwrap();
        for link in &links {
            *lock(&link.sink) = Some(pipeline.inbound());
        }
        (pipeline, links)
    }

    fn recv_n(pipeline: &Pipeline, n: usize) -> Vec<Released> {
        let mut out = Vec::new();
        while out.len() < n {
            match pipeline.egress().recv_timeout(Duration::from_secs(2)) {
                Ok(r) => out.push(r),
                Err(_) => break,
            }
        }
        out
    }

    #[test]
    fn loopback_delivers_in_order() {
        let (mut pipeline, _links) = loopback(config(2));
        for i in 0..50u32 {
            let seq = pipeline.try_send(Bytes::from(i.to_be_bytes().to_vec())).unwrap();
            assert_eq!(seq, u64::from(i));
        }
        let out = recv_n(&pipeline, 50);
        let seqs: Vec<u64> = out.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, (0..50).collect::<Vec<_>>());
        assert_eq!(&out[7].payload[..], &7u32.to_be_bytes());

        pipeline.shutdown();
        let snap = pipeline.snapshot();
        assert_eq!(snap.packets_in, 50);
        assert_eq!(snap.packets_delivered, 50);
        let per_link: u64 = snap.links.iter().map(|l| l.frames_scheduled).sum();
        assert_eq!(per_link, 50);
        assert!(snap.links.iter().all(|l| l.frames_scheduled > 0));
    }

    #[test]
    fn fec_protected_loopback() {
        let mut config = config(3);
        config.fec.enabled = true;
        let (mut pipeline, _links) = loopback(config);
        for i in 0..20u8 {
            pipeline.try_send(Bytes::from(vec![i; 300])).unwrap();
        }
        let out = recv_n(&pipeline, 20);
        assert_eq!(out.len(), 20);
        assert!(out.iter().enumerate().all(|(i, r)| r.payload[..] == vec![i as u8; 300][..]));
        pipeline.shutdown();
        let snap = pipeline.snapshot();
        assert_eq!(snap.fec.encode.blocks_encoded, 20);
        assert!(snap.fec.overhead > 0.3);
    }

    #[test]
    fn rejects_missing_sender() {
        let config = config(2);
        let only_one = Arc::new(LoopbackLink {
            id: 0,
            sink: Mutex::new(None),
        });
        let err = Pipeline::builder(config).link(only_one).spawn().err().unwrap();
        assert!(err.to_string().contains("no sender"));
    }

    #[test]
    fn link_down_signal_reaches_table() {
        let (mut pipeline, _links) = loopback(config(2));
        pipeline.link_down(1).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while pipeline.table().get(1).unwrap().state() != LinkState::Down {
            assert!(std::time::Instant::now() < deadline, "link never went down");
            thread::sleep(Duration::from_millis(5));
        }
        pipeline.shutdown();
        assert_eq!(pipeline.snapshot().failover_transitions, 1);
    }

    /// Holds every probe for a while, like a link timing out.
    struct StallingProber {
        stall: Duration,
        probing: AtomicBool,
    }

    impl Prober for StallingProber {
        fn kind(&self) -> ProbeKind {
            ProbeKind::Udp
        }

        fn probe(&self, _link: &LinkConfig, _timeout: Duration) -> Result<Duration, ProbeError> {
            self.probing.store(true, Ordering::Relaxed);
            thread::sleep(self.stall);
            Err(ProbeError::Timeout)
        }
    }

    #[test]
    fn link_down_is_not_held_behind_a_probe_cycle() {
        let mut config = config(2);
        config.monitor.enabled = true;
        let prober = Arc::new(StallingProber {
            stall: Duration::from_millis(600),
            probing: AtomicBool::new(false),
        });
        let links: Vec<Arc<LoopbackLink>> = (0..2)
            .map(|id| {
                Arc::new(LoopbackLink {
                    id,
                    sink: Mutex::new(None),
                })
            })
            .collect();
        let mut builder = Pipeline::builder(config).prober(prober.clone());
        for link in &links {
            builder = builder.link(link.clone());
        }
        let mut pipeline = builder.spawn().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !prober.probing.load(Ordering::Relaxed) {
            assert!(std::time::Instant::now() < deadline, "probe cycle never started");
            thread::sleep(Duration::from_millis(1));
        }

        let signalled = std::time::Instant::now();
        pipeline.link_down(1).unwrap();
        while pipeline.table().get(1).unwrap().state() != LinkState::Down {
            assert!(
                signalled.elapsed() < Duration::from_millis(150),
                "link down waited for the probe cycle"
            );
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(pipeline.table().get(0).unwrap().state(), LinkState::Up);
        pipeline.shutdown();
    }

    #[test]
    fn send_after_shutdown_is_refused() {
        let (mut pipeline, _links) = loopback(config(1));
        pipeline.shutdown();
        pipeline.shutdown();
        assert_eq!(
            pipeline.try_send(Bytes::from_static(b"x")),
            Err(PacketSendError::Disconnected)
        );
    }
}
