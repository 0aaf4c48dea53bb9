use bytes::Bytes;
use quanta::Instant;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::ReorderConfig;

/// Inter-arrival samples kept for the jitter distribution.
const JITTER_SAMPLES: usize = 128;
/// Below this many samples the p95 is meaningless; hold for max age.
const JITTER_WARMUP: usize = 5;
const JITTER_ALPHA: f64 = 0.1;

/// What happened to a packet handed to [`ReorderBuffer::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Buffered,
    /// Below the next expected sequence; already released or skipped.
    Late,
    /// Already held.
    Duplicate,
}

/// A packet leaving the buffer in sequence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub sequence: u64,
    pub payload: Bytes,
    /// Released by declaring the numbers before it lost.
    pub after_gap: bool,
}

/// Observed inter-arrival jitter, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct JitterDistribution {
    pub mean_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
    pub smoothed_ms: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ReorderStats {
    pub buffered: u64,
    pub released_in_order: u64,
    pub released_after_gap: u64,
    /// Sequence numbers skipped without ever arriving.
    pub gap_skipped: u64,
    pub age_drops: u64,
    pub capacity_drops: u64,
    pub late: u64,
    pub duplicate: u64,
    pub declared_lost: u64,
    /// Packets that arrived ahead of a missing predecessor.
    pub packets_reordered: u64,
    /// Largest `sequence - next_expected` seen at arrival.
    pub max_reorder_distance: u64,
    /// Mean hold time of reordered packets, arrival to release.
    pub average_reorder_delay_ms: f64,
    pub occupancy: usize,
    pub occupancy_bytes: usize,
    pub hold_threshold_ms: f64,
    pub jitter: JitterDistribution,
}

struct Entry {
    payload: Bytes,
    arrived: Instant,
    reordered: bool,
}

fn percentile(samples: &VecDeque<f64>, pct: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut v: Vec<f64> = samples.iter().copied().collect();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((v.len() - 1) as f64 * pct).round() as usize;
    v[idx.min(v.len() - 1)]
}

/// Sequence-ordered jitter buffer.
///
/// Packets wait in a `BTreeMap` keyed by sequence number and leave through
/// [`poll`](Self::poll) strictly in ascending order. The next expected
/// number is released as soon as it is present. When it is missing, the
/// buffer waits until the oldest held packet has aged past the hold
/// threshold, then declares a gap: every missing number below that packet
/// is counted as lost and release continues from it.
///
/// The hold threshold adapts to inter-arrival jitter measured here and to
/// the worst link jitter reported by the health monitor:
/// `clamp(multiplier * max(p95, path), min_hold, max_age)`. Until enough
/// samples exist it sits at max age.
///
/// Eviction, age drops and gap declaration all happen in explicit calls;
/// `insert` never releases anything.
pub struct ReorderBuffer {
    config: ReorderConfig,
    entries: BTreeMap<u64, Entry>,
    lost: BTreeSet<u64>,
    bytes: usize,
    next_expected: Option<u64>,

    last_arrival: Option<Instant>,
    avg_iat: f64,
    jitter_smoothed: f64,
    jitter_samples: VecDeque<f64>,
    path_jitter: Duration,

    reorder_delay_sum: Duration,
    reorder_delay_count: u64,
    stats: ReorderStats,
}

impl ReorderBuffer {
    /// Anchors the expected sequence on the first packet (or loss) seen.
    pub fn new(config: ReorderConfig) -> Self {
        Self {
            config,
            entries: BTreeMap::new(),
            lost: BTreeSet::new(),
            bytes: 0,
            next_expected: None,
            last_arrival: None,
            avg_iat: 0.0,
            jitter_smoothed: 0.0,
            jitter_samples: VecDeque::with_capacity(JITTER_SAMPLES),
            path_jitter: Duration::ZERO,
            reorder_delay_sum: Duration::ZERO,
            reorder_delay_count: 0,
            stats: ReorderStats::default(),
        }
    }

    /// Expects `sequence` first; anything below it is late.
    pub fn starting_at(sequence: u64, config: ReorderConfig) -> Self {
        let mut buf = Self::new(config);
        buf.next_expected = Some(sequence);
        buf
    }

    pub fn config(&self) -> &ReorderConfig {
        &self.config
    }

    pub fn next_expected(&self) -> Option<u64> {
        self.next_expected
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn insert(&mut self, sequence: u64, payload: Bytes, now: Instant) -> InsertOutcome {
        self.record_arrival(now);
        let next = *self.next_expected.get_or_insert(sequence);

        if sequence < next {
            self.stats.late += 1;
            trace!(sequence, next, "late arrival");
            return InsertOutcome::Late;
        }
        if self.entries.contains_key(&sequence) {
            self.stats.duplicate += 1;
            return InsertOutcome::Duplicate;
        }
        // The data made it after all.
        self.lost.remove(&sequence);

        let distance = sequence - next;
        if distance > 0 {
            self.stats.packets_reordered += 1;
            self.stats.max_reorder_distance = self.stats.max_reorder_distance.max(distance);
        }
        self.bytes += payload.len();
        self.entries.insert(
            sequence,
            Entry {
                payload,
                arrived: now,
                reordered: distance > 0,
            },
        );
        self.stats.buffered += 1;
        self.enforce_capacity();
        InsertOutcome::Buffered
    }

    /// Records that `sequence` will never arrive (FEC gave up on it), so
    /// release does not wait for it.
    /// Marks further ahead than the packet capacity are ignored.
    pub fn mark_lost(&mut self, sequence: u64) {
        let next = *self.next_expected.get_or_insert(sequence);
        if sequence < next || self.entries.contains_key(&sequence) {
            return;
        }
        if sequence - next > self.config.capacity_packets as u64 {
            trace!(sequence, next, "loss mark beyond buffer reach ignored");
            return;
        }
        if self.lost.insert(sequence) {
            self.stats.declared_lost += 1;
        }
    }

    /// Feeds the worst monitored link jitter into the hold threshold.
    pub fn set_path_jitter(&mut self, jitter: Duration) {
        self.path_jitter = jitter;
    }

    /// How long the oldest packet may wait for a missing predecessor.
    pub fn hold_threshold(&self) -> Duration {
        if self.jitter_samples.len() < JITTER_WARMUP {
            return self.config.max_age;
        }
        let observed = percentile(&self.jitter_samples, 0.95);
        let jitter = observed.max(self.path_jitter.as_secs_f64());
        let scaled = self.config.jitter_multiplier * jitter;
        let min = self.config.min_hold.as_secs_f64();
        let max = self.config.max_age.as_secs_f64().max(min);
        Duration::from_secs_f64(scaled.clamp(min, max))
    }

    /// Drops over-age packets, then releases everything that is ready.
    pub fn poll(&mut self, now: Instant) -> Vec<Released> {
        let mut out = Vec::new();
        let skipped = self.drop_aged(now);
        self.release_ready(&mut out, skipped, Some(now));

        let threshold = self.hold_threshold();
        while let Some((&first, entry)) = self.entries.first_key_value() {
            if now.saturating_duration_since(entry.arrived) < threshold {
                break;
            }
            self.skip_to(first);
            self.release_ready(&mut out, true, Some(now));
        }
        out
    }

    /// Releases everything still held, skipping holes (shutdown drain).
    pub fn flush(&mut self) -> Vec<Released> {
        let mut out = Vec::new();
        self.release_ready(&mut out, false, None);
        while let Some(&first) = self.entries.keys().next() {
            self.skip_to(first);
            self.release_ready(&mut out, true, None);
        }
        self.lost.clear();
        out
    }

    pub fn stats(&self) -> ReorderStats {
        let mut stats = self.stats;
        stats.occupancy = self.entries.len();
        stats.occupancy_bytes = self.bytes;
        stats.hold_threshold_ms = self.hold_threshold().as_secs_f64() * 1000.0;
        stats.jitter = self.jitter_distribution();
        if self.reorder_delay_count > 0 {
            stats.average_reorder_delay_ms = self.reorder_delay_sum.as_secs_f64() * 1000.0
                / self.reorder_delay_count as f64;
        }
        stats
    }

    // ─── Release ─────────────────────────────────────────────────────────

    /// `now` is `None` on the shutdown drain, which leaves the delay
    /// average alone.
    fn release_ready(
        &mut self,
        out: &mut Vec<Released>,
        mut after_gap: bool,
        now: Option<Instant>,
    ) {
        let Some(mut next) = self.next_expected else {
            return;
        };
        loop {
            if let Some(entry) = self.entries.remove(&next) {
                self.bytes -= entry.payload.len();
                if let Some(now) = now.filter(|_| entry.reordered) {
                    self.reorder_delay_sum += now.saturating_duration_since(entry.arrived);
                    self.reorder_delay_count += 1;
                }
                if after_gap {
                    self.stats.released_after_gap += 1;
                } else {
                    self.stats.released_in_order += 1;
                }
                out.push(Released {
                    sequence: next,
                    payload: entry.payload,
                    after_gap,
                });
                after_gap = false;
            } else if !self.lost.remove(&next) {
                break;
            }
            next += 1;
        }
        self.next_expected = Some(next);
    }

    /// Moves the expected sequence up to `target`, counting every number
    /// skipped on the way that was not already declared lost.
    fn skip_to(&mut self, target: u64) {
        let next = self.next_expected.unwrap_or(target);
        if target <= next {
            return;
        }
        let declared = self.lost.range(next..target).count() as u64;
        let skipped = target - next - declared;
        self.lost = self.lost.split_off(&target);
        self.stats.gap_skipped += skipped;
        debug!(from = next, to = target, skipped, "reorder gap declared");
        self.next_expected = Some(target);
    }

    // ─── Bounds ──────────────────────────────────────────────────────────

    fn enforce_capacity(&mut self) {
        while self.entries.len() > self.config.capacity_packets
            || (self.bytes > self.config.capacity_bytes && !self.entries.is_empty())
        {
            let Some((sequence, entry)) = self.entries.pop_first() else {
                break;
            };
            self.bytes -= entry.payload.len();
            self.stats.capacity_drops += 1;
            trace!(sequence, "reorder buffer full, evicting oldest");
            self.skip_to(sequence);
            self.next_expected = Some(sequence + 1);
        }
    }

    /// Returns whether the expected sequence moved.
    fn drop_aged(&mut self, now: Instant) -> bool {
        let before = self.next_expected;
        let max_age = self.config.max_age;
        let aged: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.arrived) > max_age)
            .map(|(seq, _)| *seq)
            .collect();
        for sequence in aged {
            if let Some(entry) = self.entries.remove(&sequence) {
                self.bytes -= entry.payload.len();
                self.stats.age_drops += 1;
                trace!(sequence, "reorder entry exceeded max age");
                // Release passes over the dropped number. Younger entries
                // below it stay releasable: never skip past a held packet.
                self.lost.insert(sequence);
                let target = self
                    .entries
                    .first_key_value()
                    .map_or(sequence, |(&first, _)| first.min(sequence));
                self.skip_to(target);
            }
        }
        self.next_expected != before
    }

    // ─── Jitter ──────────────────────────────────────────────────────────

    fn record_arrival(&mut self, now: Instant) {
        if let Some(last) = self.last_arrival {
            let iat = now.saturating_duration_since(last).as_secs_f64();
            self.avg_iat = (1.0 - JITTER_ALPHA) * self.avg_iat + JITTER_ALPHA * iat;
            let jitter = (iat - self.avg_iat).abs();
            self.jitter_smoothed =
                (1.0 - JITTER_ALPHA) * self.jitter_smoothed + JITTER_ALPHA * jitter;
            self.jitter_samples.push_back(jitter);
            if self.jitter_samples.len() > JITTER_SAMPLES {
                self.jitter_samples.pop_front();
            }
        }
        self.last_arrival = Some(now);
    }

    fn jitter_distribution(&self) -> JitterDistribution {
        let n = self.jitter_samples.len();
        if n == 0 {
            return JitterDistribution::default();
        }
        let sum: f64 = self.jitter_samples.iter().sum();
        let max = self.jitter_samples.iter().copied().fold(0.0, f64::max);
        JitterDistribution {
            mean_ms: sum / n as f64 * 1000.0,
            p95_ms: percentile(&self.jitter_samples, 0.95) * 1000.0,
            max_ms: max * 1000.0,
            smoothed_ms: self.jitter_smoothed * 1000.0,
            samples: n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = (actual.as_secs_f64() - expected.as_secs_f64()).abs();
        assert!(diff < 1e-6, "{actual:?} != {expected:?}");
    }

    fn pkt(seq: u64) -> Bytes {
        Bytes::from(format!("packet-{seq}"))
    }

    fn seqs(released: &[Released]) -> Vec<u64> {
        released.iter().map(|r| r.sequence).collect()
    }

    #[test]
    fn in_order_release() {
        let now = Instant::now();
        let mut buf = ReorderBuffer::new(ReorderConfig::default());
        for seq in 10..14 {
            assert_eq!(buf.insert(seq, pkt(seq), now), InsertOutcome::Buffered);
        }
        let out = buf.poll(now);
        assert_eq!(seqs(&out), vec![10, 11, 12, 13]);
        assert!(out.iter().all(|r| !r.after_gap));
        assert_eq!(buf.stats().released_in_order, 4);
        assert!(buf.is_empty());
        assert_eq!(buf.bytes(), 0);
    }

    #[test]
    fn late_straggler_fills_hole_without_gap() {
        let start = Instant::now();
        let mut buf = ReorderBuffer::starting_at(1, ReorderConfig::default());
        let mut released = Vec::new();

        buf.insert(1, pkt(1), start);
        released.extend(buf.poll(start));
        buf.insert(3, pkt(3), start + ms(10));
        buf.insert(4, pkt(4), start + ms(15));
        // Polled often while 2 is missing.
        for t in (10..95).step_by(5) {
            released.extend(buf.poll(start + ms(t)));
        }
        assert_eq!(seqs(&released), vec![1]);

        buf.insert(2, pkt(2), start + ms(95));
        released.extend(buf.poll(start + ms(95)));
        assert_eq!(seqs(&released), vec![1, 2, 3, 4]);

        let stats = buf.stats();
        assert_eq!(stats.gap_skipped, 0);
        assert_eq!(stats.released_after_gap, 0);
        assert_eq!(stats.age_drops, 0);
    }

    #[test]
    fn gap_declared_after_hold_threshold() {
        let start = Instant::now();
        let mut buf = ReorderBuffer::starting_at(0, ReorderConfig::default());
        // Steady 1 ms arrivals warm the jitter estimate up.
        for seq in 0..20 {
            buf.insert(seq, pkt(seq), start + ms(seq));
        }
        assert_eq!(buf.poll(start + ms(19)).len(), 20);
        assert_close(buf.hold_threshold(), ms(10));

        buf.insert(21, pkt(21), start + ms(20));
        buf.insert(22, pkt(22), start + ms(21));
        assert!(buf.poll(start + ms(25)).is_empty());

        let out = buf.poll(start + ms(31));
        assert_eq!(seqs(&out), vec![21, 22]);
        assert!(out[0].after_gap);
        assert!(!out[1].after_gap);
        let stats = buf.stats();
        assert_eq!(stats.gap_skipped, 1);
        assert_eq!(stats.released_after_gap, 1);

        // 20 shows up after being skipped.
        assert_eq!(buf.insert(20, pkt(20), start + ms(32)), InsertOutcome::Late);
        assert_eq!(buf.stats().late, 1);
    }

    #[test]
    fn path_jitter_raises_threshold() {
        let start = Instant::now();
        let mut buf = ReorderBuffer::starting_at(0, ReorderConfig::default());
        for seq in 0..20 {
            buf.insert(seq, pkt(seq), start + ms(seq));
        }
        buf.poll(start + ms(19));
        buf.set_path_jitter(ms(15));
        assert_close(buf.hold_threshold(), ms(60));
        buf.set_path_jitter(ms(500));
        assert_close(buf.hold_threshold(), ms(100));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let now = Instant::now();
        let config = ReorderConfig {
            capacity_packets: 2,
            ..ReorderConfig::default()
        };
        let mut buf = ReorderBuffer::new(config);
        buf.insert(1, pkt(1), now);
        buf.insert(2, pkt(2), now);
        buf.insert(3, pkt(3), now);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.stats().capacity_drops, 1);
        assert_eq!(buf.next_expected(), Some(2));
        assert_eq!(seqs(&buf.poll(now)), vec![2, 3]);
    }

    #[test]
    fn byte_capacity_evicts_oldest() {
        let now = Instant::now();
        let config = ReorderConfig {
            capacity_bytes: 25,
            ..ReorderConfig::default()
        };
        let mut buf = ReorderBuffer::starting_at(0, config);
        buf.insert(5, Bytes::from(vec![0u8; 10]), now);
        buf.insert(6, Bytes::from(vec![0u8; 10]), now);
        buf.insert(7, Bytes::from(vec![0u8; 10]), now);
        assert_eq!(buf.bytes(), 20);
        let stats = buf.stats();
        assert_eq!(stats.capacity_drops, 1);
        // 0..5 skipped on the way past 5.
        assert_eq!(stats.gap_skipped, 5);
        assert_eq!(seqs(&buf.poll(now)), vec![6, 7]);
    }

    #[test]
    fn aged_entries_dropped() {
        let start = Instant::now();
        let config = ReorderConfig {
            max_age: ms(50),
            ..ReorderConfig::default()
        };
        let mut buf = ReorderBuffer::starting_at(0, config);
        buf.insert(3, pkt(3), start);
        buf.insert(4, pkt(4), start + ms(40));
        // No poll for a while: 3 is past max age and dropped, 4 is not.
        let out = buf.poll(start + ms(60));
        let stats = buf.stats();
        assert_eq!(stats.age_drops, 1);
        assert_eq!(stats.gap_skipped, 3);
        assert_eq!(seqs(&out), vec![4]);
    }

    #[test]
    fn aged_entry_never_strands_younger_predecessor() {
        let start = Instant::now();
        let mut buf = ReorderBuffer::starting_at(0, ReorderConfig::default());
        buf.insert(7, pkt(7), start);
        buf.insert(5, pkt(5), start + ms(95));
        let out = buf.poll(start + ms(101));
        assert_eq!(seqs(&out), vec![5]);
        assert!(out[0].after_gap);
        assert_eq!(buf.stats().age_drops, 1);
        assert_eq!(buf.next_expected(), Some(6));

        // 6 arrives late but in time: it goes out, 7 is passed over.
        buf.insert(6, pkt(6), start + ms(102));
        buf.insert(8, pkt(8), start + ms(103));
        assert_eq!(seqs(&buf.poll(start + ms(103))), vec![6, 8]);
        assert_eq!(buf.stats().gap_skipped, 5);
    }

    #[test]
    fn declared_loss_skipped_without_waiting() {
        let now = Instant::now();
        let mut buf = ReorderBuffer::starting_at(0, ReorderConfig::default());
        buf.insert(0, pkt(0), now);
        buf.mark_lost(1);
        buf.insert(2, pkt(2), now);
        let out = buf.poll(now);
        assert_eq!(seqs(&out), vec![0, 2]);
        let stats = buf.stats();
        assert_eq!(stats.declared_lost, 1);
        assert_eq!(stats.gap_skipped, 0);
        assert_eq!(stats.released_in_order, 2);
    }

    #[test]
    fn duplicate_counted() {
        let now = Instant::now();
        let mut buf = ReorderBuffer::starting_at(0, ReorderConfig::default());
        buf.insert(1, pkt(1), now);
        assert_eq!(buf.insert(1, pkt(1), now), InsertOutcome::Duplicate);
        assert_eq!(buf.stats().duplicate, 1);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn flush_drains_in_order() {
        let now = Instant::now();
        let mut buf = ReorderBuffer::starting_at(0, ReorderConfig::default());
        for seq in [9, 4, 7, 5] {
            buf.insert(seq, pkt(seq), now);
        }
        let out = buf.flush();
        assert_eq!(seqs(&out), vec![4, 5, 7, 9]);
        assert!(buf.is_empty());
        assert_eq!(buf.stats().gap_skipped, 4 + 1 + 1);
    }

    #[test]
    fn jitter_distribution_reported() {
        let start = Instant::now();
        let mut buf = ReorderBuffer::new(ReorderConfig::default());
        let mut t = 0;
        for seq in 0..40u64 {
            t += if seq % 2 == 0 { 2 } else { 18 };
            buf.insert(seq, pkt(seq), start + ms(t));
        }
        let jitter = buf.stats().jitter;
        assert_eq!(jitter.samples, 39);
        assert!(jitter.p95_ms > 5.0, "{jitter:?}");
        assert!(jitter.max_ms >= jitter.p95_ms);
        assert!(jitter.mean_ms > 0.0);
    }

    #[test]
    fn percentile_basics() {
        let samples: VecDeque<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&samples, 0.5), 51.0);
        assert_eq!(percentile(&samples, 0.95), 95.0);
        assert_eq!(percentile(&VecDeque::new(), 0.95), 0.0);
    }
}
