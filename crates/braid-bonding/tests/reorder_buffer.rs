//! Jitter/reorder buffer scenarios.
//!
//! Covers: late stragglers inside the age budget, capacity eviction,
//! interplay with FEC-declared losses, and the release ordering invariant
//! under random arrival orders.

use bytes::Bytes;
use proptest::prelude::*;
use quanta::Instant;
use std::collections::BTreeSet;
use std::time::Duration;

use braid_bonding::config::ReorderConfig;
use braid_bonding::receiver::{InsertOutcome, ReorderBuffer, Released};

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn pkt(seq: u64) -> Bytes {
    Bytes::from(seq.to_be_bytes().to_vec())
}

fn seqs(released: &[Released]) -> Vec<u64> {
    released.iter().map(|r| r.sequence).collect()
}

// ────────────────────────────────────────────────────────────────
// 1. Straggler arrives within max age: no gap
// ────────────────────────────────────────────────────────────────

#[test]
fn straggler_within_max_age_releases_in_order() {
    let config = ReorderConfig {
        max_age: ms(100),
        ..ReorderConfig::default()
    };
    let mut buf = ReorderBuffer::new(config);
    let start = Instant::now();
    let mut released = Vec::new();

    // 1, 3, 4, 2 at t = 0, 10, 15, 95 ms, polled every millisecond.
    let arrivals = [(0u64, 1u64), (10, 3), (15, 4), (95, 2)];
    for t in 0..=100u64 {
        for &(at, seq) in &arrivals {
            if at == t {
                assert_eq!(buf.insert(seq, pkt(seq), start + ms(t)), InsertOutcome::Buffered);
            }
        }
        released.extend(buf.poll(start + ms(t)));
        if t < 95 {
            assert_eq!(seqs(&released), vec![1], "released early at t={t}");
        }
    }

    assert_eq!(seqs(&released), vec![1, 2, 3, 4]);
    assert!(released.iter().all(|r| !r.after_gap));
    let stats = buf.stats();
    assert_eq!(stats.gap_skipped, 0);
    assert_eq!(stats.age_drops, 0);
    assert_eq!(stats.released_in_order, 4);
    // 3 and 4 came in ahead of 2, then waited 85 and 80 ms for it.
    assert_eq!(stats.packets_reordered, 2);
    assert_eq!(stats.max_reorder_distance, 2);
    assert!((stats.average_reorder_delay_ms - 82.5).abs() < 1e-6);
}

// ────────────────────────────────────────────────────────────────
// 1b. Adaptive hold once the jitter estimate is warm
// ────────────────────────────────────────────────────────────────

#[test]
fn warm_threshold_follows_jitter_estimate() {
    let mut buf = ReorderBuffer::starting_at(0, ReorderConfig::default());
    let start = Instant::now();
    for seq in 0..6 {
        buf.insert(seq, pkt(seq), start);
    }
    assert_eq!(seqs(&buf.poll(start)), (0..6).collect::<Vec<_>>());
    // Jitter free: the 10 ms floor applies instead of the 100 ms max age.
    assert_eq!(buf.hold_threshold(), ms(10));

    buf.insert(7, pkt(7), start);
    assert!(buf.poll(start + ms(9)).is_empty(), "gap held below the threshold");
    let out = buf.poll(start + ms(10));
    assert_eq!(seqs(&out), vec![7]);
    assert!(out[0].after_gap);
    assert_eq!(buf.stats().gap_skipped, 1);

    // Worst link jitter of 20 ms: hold for 4 x 20 ms.
    buf.set_path_jitter(ms(20));
    let threshold = buf.hold_threshold();
    assert!((threshold.as_secs_f64() - 0.080).abs() < 1e-6, "{threshold:?}");

    buf.insert(9, pkt(9), start + ms(10));
    assert!(buf.poll(start + ms(89)).is_empty(), "short gap held");
    buf.insert(8, pkt(8), start + ms(89));
    let out = buf.poll(start + ms(89));
    assert_eq!(seqs(&out), vec![8, 9]);
    assert!(out.iter().all(|r| !r.after_gap));
    assert_eq!(buf.stats().gap_skipped, 1);
}

// ────────────────────────────────────────────────────────────────
// 2. Capacity eviction
// ────────────────────────────────────────────────────────────────

#[test]
fn capacity_two_evicts_oldest_of_three() {
    let config = ReorderConfig {
        capacity_packets: 2,
        ..ReorderConfig::default()
    };
    let mut buf = ReorderBuffer::new(config);
    let now = Instant::now();
    for seq in [10, 11, 12] {
        buf.insert(seq, pkt(seq), now);
    }
    let stats = buf.stats();
    assert_eq!(stats.capacity_drops, 1);
    assert_eq!(stats.occupancy, 2);

    let out = buf.poll(now);
    assert_eq!(seqs(&out), vec![11, 12]);
    // The evicted packet cannot come back.
    assert_eq!(buf.insert(10, pkt(10), now), InsertOutcome::Late);
}

// ────────────────────────────────────────────────────────────────
// 3. FEC losses do not stall release
// ────────────────────────────────────────────────────────────────

#[test]
fn declared_losses_release_without_waiting() {
    let mut buf = ReorderBuffer::starting_at(0, ReorderConfig::default());
    let now = Instant::now();
    buf.insert(0, pkt(0), now);
    buf.insert(3, pkt(3), now);
    buf.mark_lost(2);
    assert_eq!(seqs(&buf.poll(now)), vec![0]);

    buf.mark_lost(1);
    let out = buf.poll(now);
    assert_eq!(seqs(&out), vec![3]);
    assert!(!out[0].after_gap);
    assert_eq!(buf.stats().declared_lost, 2);
}

#[test]
fn loss_marks_beyond_capacity_are_ignored() {
    let config = ReorderConfig {
        capacity_packets: 16,
        ..ReorderConfig::default()
    };
    let mut buf = ReorderBuffer::starting_at(0, config);
    buf.mark_lost(16);
    buf.mark_lost(17);
    buf.mark_lost(u64::MAX);
    assert_eq!(buf.stats().declared_lost, 1);
}

#[test]
fn recovered_packet_overrides_loss_marker() {
    let mut buf = ReorderBuffer::starting_at(0, ReorderConfig::default());
    let now = Instant::now();
    buf.mark_lost(0);
    buf.insert(0, pkt(0), now);
    assert_eq!(seqs(&buf.poll(now)), vec![0]);
}

// ────────────────────────────────────────────────────────────────
// 4. Ordering invariant
// ────────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn output_strictly_increasing_and_accounted(
        order in Just((0u64..64).collect::<Vec<_>>()).prop_shuffle(),
        missing in prop::collection::btree_set(0u64..64, 0..8),
        delays in prop::collection::vec(0u64..30, 64),
    ) {
        let mut buf = ReorderBuffer::starting_at(0, ReorderConfig::default());
        let start = Instant::now();
        let mut released = Vec::new();
        let mut t = 0;
        for (i, seq) in order.iter().enumerate() {
            t += delays[i];
            if !missing.contains(seq) {
                buf.insert(*seq, pkt(*seq), start + ms(t));
            }
            released.extend(buf.poll(start + ms(t)));
        }
        released.extend(buf.poll(start + ms(t + 200)));
        released.extend(buf.flush());

        let out = seqs(&released);
        prop_assert!(out.windows(2).all(|w| w[0] < w[1]), "not increasing: {:?}", out);

        let delivered: BTreeSet<u64> = out.iter().copied().collect();
        let stats = buf.stats();
        let dropped = stats.age_drops + stats.capacity_drops + stats.late;
        let accounted = delivered.len() as u64 + dropped + stats.gap_skipped;
        // Every number up to the last one handled is delivered, dropped or skipped.
        let last = buf.next_expected().unwrap_or(0);
        prop_assert!(accounted >= last, "accounted {} < {}", accounted, last);
        for seq in delivered {
            prop_assert!(!missing.contains(&seq));
        }
    }
}
