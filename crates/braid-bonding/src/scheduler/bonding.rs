use arc_swap::ArcSwap;
use bytes::Bytes;
use quanta::Instant;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use braid_transport::codec::{FecCodec, FecError};
use braid_transport::stats::FecEncodeStats;
use braid_transport::wire::{ShardFrame, ShardHeader, MAX_SHARD_PAYLOAD};

use crate::config::{FecConfig, SchedulerConfig};
use crate::error::{DropCounters, DropReason};
use crate::net::table::LinkTable;
use crate::packet::OutboundPacket;
use crate::scheduler::qos::{QosAction, RuleSet};
use crate::scheduler::select::{self, Candidate, Selector, Tier};

/// One shard bound for one link, ready to be sealed and sent.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub link_id: usize,
    pub sequence: u64,
    pub timestamp_us: u64,
    pub shard: ShardFrame,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LinkTraffic {
    pub frames: u64,
    pub bytes: u64,
}

/// Scheduler-owned counters. Link state is read, never written, by the
/// scheduler; these are the only things it writes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub packets_in: u64,
    pub packets_scheduled: u64,
    pub links: BTreeMap<usize, LinkTraffic>,
    pub drops: DropCounters,
    pub fec: FecEncodeStats,
    pub queue_depth: usize,
}

/// Per-class bandwidth ceiling.
#[derive(Debug, Clone)]
struct TokenBucket {
    /// Bytes per second.
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(ceiling_bps: u64, now: Instant) -> Self {
        let rate = ceiling_bps as f64 / 8.0;
        // 100 ms of traffic, and never less than two full-size packets.
        let burst = (rate / 10.0).max(3000.0);
        Self {
            rate,
            burst,
            tokens: burst,
            last: now,
        }
    }

    fn try_take(&mut self, bytes: usize, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last = now;
        if self.tokens >= bytes as f64 {
            self.tokens -= bytes as f64;
            true
        } else {
            false
        }
    }
}

/// Per-packet link selection under QoS policy.
///
/// **Per batch:**
/// ```text
/// 1. drop pending packets older than the queue wait
/// 2. stop if no link is eligible (packets keep waiting)
/// 3. load the rule set once; it is fixed for the rest of the batch
/// 4. for up to batch_size packets:
///      classify → police ceiling → build tier → FEC encode (if enabled)
///      → pick a link per shard
/// ```
pub struct BondingScheduler {
    config: SchedulerConfig,
    fec: FecConfig,
    codec: FecCodec,
    table: Arc<LinkTable>,
    rules: Arc<ArcSwap<RuleSet>>,
    active_rules: Arc<RuleSet>,
    /// Indexed like `active_rules.rules()`; `None` for rules without a
    /// bandwidth ceiling.
    buckets: Vec<Option<TokenBucket>>,
    selector: Selector,
    pending: VecDeque<OutboundPacket>,
    stats: SchedulerStats,
    /// Packets dropped in a row while no link was eligible (for escalation).
    consecutive_dead: u64,
}

impl BondingScheduler {
    pub fn new(
        config: SchedulerConfig,
        fec: FecConfig,
        table: Arc<LinkTable>,
        rules: Arc<ArcSwap<RuleSet>>,
    ) -> Result<Self, FecError> {
        let codec = FecCodec::new(fec.params)?;
        let active_rules = rules.load_full();
        Ok(Self {
            selector: Selector::new(config.mode),
            pending: VecDeque::with_capacity(config.queue_bound.min(4096)),
            config,
            fec,
            codec,
            table,
            rules,
            buckets: Vec::new(),
            active_rules,
            stats: SchedulerStats::default(),
            consecutive_dead: 0,
        }
        .with_buckets(Instant::now()))
    }

    fn with_buckets(mut self, now: Instant) -> Self {
        self.rebuild_buckets(now);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn codec(&self) -> &FecCodec {
        &self.codec
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Queue a packet for scheduling. Never blocks: when the pending queue
    /// is at its bound the new packet is dropped.
    pub fn enqueue(&mut self, packet: OutboundPacket) -> Result<(), DropReason> {
        self.stats.packets_in += 1;
        if self.pending.len() >= self.config.queue_bound {
            self.drop_packet(DropReason::QueueOverflow, packet.sequence);
            return Err(DropReason::QueueOverflow);
        }
        self.pending.push_back(packet);
        self.stats.queue_depth = self.pending.len();
        Ok(())
    }

    /// Schedule up to one batch of pending packets into `out`. Returns the
    /// number of packets handed to links.
    pub fn run_batch(&mut self, now: Instant, out: &mut Vec<Dispatch>) -> usize {
        self.expire(now);
        if self.pending.is_empty() {
            return 0;
        }
        if !self.table.any_eligible() {
            trace!(pending = self.pending.len(), "no eligible link, holding packets");
            return 0;
        }

        let rules = self.rules.load_full();
        if !Arc::ptr_eq(&rules, &self.active_rules) {
            self.active_rules = rules.clone();
            self.rebuild_buckets(now);
            debug!(rules = rules.len(), "rule set swapped");
        }

        let mut scheduled = 0;
        for _ in 0..self.config.batch_size {
            let Some(packet) = self.pending.pop_front() else {
                break;
            };
            let class = rules.classify(&packet.meta);

            if let Some(bucket) = class.rule.and_then(|i| self.buckets.get_mut(i)?.as_mut()) {
                if !bucket.try_take(packet.len(), now) {
                    self.drop_packet(DropReason::RateLimited, packet.sequence);
                    continue;
                }
            }

            let Some((tier, candidates)) = select::candidates(&self.table, class.action) else {
                // Every link left service mid-batch; wait for the next pass.
                self.pending.push_front(packet);
                break;
            };
            trace!(
                sequence = packet.sequence,
                priority = class.priority,
                tier = tier.as_str(),
                "scheduling packet"
            );

            let protect = class.action.fec.unwrap_or(self.fec.enabled);
            if protect {
                self.dispatch_protected(packet, class.action, tier, &candidates, now, out);
            } else {
                self.dispatch_plain(packet, &candidates, now, out);
            }
            scheduled += 1;
        }

        if scheduled > 0 {
            self.consecutive_dead = 0;
        }
        self.stats.packets_scheduled += scheduled as u64;
        self.stats.queue_depth = self.pending.len();
        scheduled
    }

    /// Discard everything still pending, counted as shutdown drops.
    pub fn discard_pending(&mut self) -> usize {
        let n = self.pending.len();
        self.stats.drops.add(DropReason::Shutdown, n as u64);
        self.pending.clear();
        self.stats.queue_depth = 0;
        n
    }

    fn expire(&mut self, now: Instant) {
        while let Some(front) = self.pending.front() {
            if now.saturating_duration_since(front.enqueued_at) <= self.config.queue_wait {
                break;
            }
            let sequence = front.sequence;
            self.pending.pop_front();
            self.drop_packet(DropReason::QueueTimeout, sequence);
        }
        self.stats.queue_depth = self.pending.len();
    }

    fn rebuild_buckets(&mut self, now: Instant) {
        self.buckets = self
            .active_rules
            .rules()
            .iter()
            .map(|r| {
                r.action
                    .bandwidth_ceiling_bps
                    .map(|bps| TokenBucket::new(bps, now))
            })
            .collect();
    }

    fn dispatch_plain(
        &mut self,
        packet: OutboundPacket,
        candidates: &[Candidate],
        now: Instant,
        out: &mut Vec<Dispatch>,
    ) {
        if packet.len() > MAX_SHARD_PAYLOAD {
            self.drop_packet(DropReason::Malformed, packet.sequence);
            return;
        }
        let header = ShardHeader::unprotected(packet.sequence, packet.len());
        let frame = ShardFrame::new(header, packet.payload);
        let _ = self.emit(packet.sequence, packet.timestamp_us, frame, candidates, now, out);
    }

    /// Encodes one block and spreads its shards. While enough links of the
    /// candidates' state are eligible, no link carries more than `m` shards
    /// of the block, so losing any single link leaves it recoverable. The
    /// first shards stay on the primary tier.
    fn dispatch_protected(
        &mut self,
        packet: OutboundPacket,
        action: &QosAction,
        tier: Tier,
        candidates: &[Candidate],
        now: Instant,
        out: &mut Vec<Dispatch>,
    ) {
        let shards: Vec<Bytes> = match self.codec.encode(&packet.payload) {
            Ok(shards) => shards,
            Err(e) => {
                self.stats.fec.encode_errors += 1;
                debug!(sequence = packet.sequence, error = %e, "FEC encode failed, sending unprotected");
                return self.dispatch_plain(packet, candidates, now, out);
            }
        };
        let (k, m) = (self.codec.data_shards(), self.codec.parity_shards());
        let kind = self.codec.kind();
        let spread = if m > 0 {
            select::widen(&self.table, action, tier, candidates, (k + m).div_ceil(m))
        } else {
            candidates.to_vec()
        };

        let mut carried: HashMap<usize, usize> = HashMap::with_capacity(spread.len());
        for (index, shard) in shards.into_iter().enumerate() {
            let open = |c: &&Candidate| carried.get(&c.id).copied().unwrap_or(0) < m;
            let mut pool: Vec<Candidate> = candidates.iter().filter(open).cloned().collect();
            if pool.is_empty() {
                pool = spread.iter().filter(open).cloned().collect();
            }
            if pool.is_empty() {
                pool = candidates.to_vec();
            }

            let header = ShardHeader {
                fec: Some(kind),
                block_id: packet.sequence,
                shard_index: index as u8,
                data_shards: k as u8,
                parity_shards: m as u8,
                block_len: packet.len() as u32,
                payload_len: 0,
            };
            let frame = ShardFrame::new(header, shard);
            if let Some(link_id) =
                self.emit(packet.sequence, packet.timestamp_us, frame, &pool, now, out)
            {
                *carried.entry(link_id).or_default() += 1;
            }
        }
        if spread.len() > candidates.len() {
            trace!(
                sequence = packet.sequence,
                links = carried.len(),
                "FEC block widened past primary tier"
            );
        }
        self.stats.fec.record_block(k, m);
    }

    fn emit(
        &mut self,
        sequence: u64,
        timestamp_us: u64,
        shard: ShardFrame,
        candidates: &[Candidate],
        now: Instant,
        out: &mut Vec<Dispatch>,
    ) -> Option<usize> {
        let link_id = self.selector.select(candidates, now)?;
        let bytes = shard.encoded_len();
        let capacity = candidates
            .iter()
            .find(|c| c.id == link_id)
            .and_then(|c| c.capacity_bps);
        self.selector.on_sent(link_id, bytes, capacity, now);

        let traffic = self.stats.links.entry(link_id).or_default();
        traffic.frames += 1;
        traffic.bytes += bytes as u64;

        out.push(Dispatch {
            link_id,
            sequence,
            timestamp_us,
            shard,
        });
        Some(link_id)
    }

    fn drop_packet(&mut self, reason: DropReason, sequence: u64) {
        self.stats.drops.record(reason);
        trace!(sequence, reason = reason.as_str(), "packet dropped");
        if matches!(reason, DropReason::QueueOverflow | DropReason::QueueTimeout)
            && !self.table.any_eligible()
        {
            self.note_dead_drop(sequence);
        }
    }

    /// Escalating log for drops while every link is out of service: warn on
    /// the first, error at 100, then every 1000.
    fn note_dead_drop(&mut self, sequence: u64) {
        self.consecutive_dead += 1;
        let total = self.stats.drops.queue_overflow + self.stats.drops.queue_timeout;
        if self.consecutive_dead == 1 {
            warn!(sequence, "no eligible link: dropping queued packets");
        } else if self.consecutive_dead == 100 {
            error!(
                consecutive = self.consecutive_dead,
                total, "no eligible link for 100 consecutive drops"
            );
        } else if self.consecutive_dead.is_multiple_of(1000) {
            error!(
                consecutive = self.consecutive_dead,
                total, "still no eligible link"
            );
        }
    }
}
