//! # Link Table
//!
//! Fixed arena of per-link slots shared by every stage. Each slot holds the
//! immutable link configuration plus two atomically swapped snapshots:
//!
//! - [`HealthSnapshot`], written by the health monitor;
//! - [`LinkStatus`], written by the failover controller.
//!
//! Readers (the scheduler, metrics) load whole snapshots and never block
//! writers. Slots are created once at startup; the set of links does not
//! change while the pipeline runs.

use arc_swap::ArcSwap;
use quanta::Instant;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::LinkConfig;
use crate::net::interface::LinkState;

/// Latest measured health of a link.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthSnapshot {
    /// EWMA round-trip time; `None` until a probe succeeds, and again when
    /// the window holds no successes.
    pub latency: Option<Duration>,
    /// EWMA of the absolute difference between consecutive RTTs.
    pub jitter: Duration,
    /// Loss ratio over the probe window; 1.0 with no successes.
    pub loss: f64,
    /// EWMA of burst bandwidth estimates, bits per second.
    pub bandwidth_bps: Option<f64>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Probes currently in the window.
    pub window_len: usize,
    pub window_successes: usize,
    pub window_full: bool,
    /// Total probe samples seen.
    pub samples: u64,
    pub updated_at: Option<Instant>,
}

impl HealthSnapshot {
    /// A full window with no successful probe.
    pub fn is_hard_down(&self) -> bool {
        self.window_full && self.window_successes == 0
    }
}

/// Failover state as published by the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkStatus {
    pub state: LinkState,
    /// Transitions since startup.
    pub transitions: u64,
    pub since: Option<Instant>,
}

/// Send-side counters for one link, written by the transmit stage.
#[derive(Debug, Default)]
pub struct LinkCounters {
    pub frames_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_errors: AtomicU64,
}

pub struct LinkSlot {
    config: LinkConfig,
    health: ArcSwap<HealthSnapshot>,
    status: ArcSwap<LinkStatus>,
    pub counters: LinkCounters,
}

impl LinkSlot {
    fn new(config: LinkConfig) -> Self {
        Self {
            config,
            health: ArcSwap::from_pointee(HealthSnapshot::default()),
            status: ArcSwap::from_pointee(LinkStatus::default()),
            counters: LinkCounters::default(),
        }
    }

    pub fn id(&self) -> usize {
        self.config.id
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn health(&self) -> Arc<HealthSnapshot> {
        self.health.load_full()
    }

    pub fn status(&self) -> LinkStatus {
        **self.status.load()
    }

    pub fn state(&self) -> LinkState {
        self.status.load().state
    }

    pub fn publish_health(&self, snapshot: HealthSnapshot) {
        self.health.store(Arc::new(snapshot));
    }

    pub fn publish_status(&self, status: LinkStatus) {
        self.status.store(Arc::new(status));
    }

    pub fn record_sent(&self, bytes: usize) {
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_send_error(&self) {
        self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Arena of link slots, addressable by position or link id.
pub struct LinkTable {
    slots: Vec<LinkSlot>,
    by_id: HashMap<usize, usize>,
}

impl LinkTable {
    /// Builds the table in configuration order. Duplicate ids keep the
    /// first entry; configuration loading rejects them earlier.
    pub fn new(links: impl IntoIterator<Item = LinkConfig>) -> Self {
        let mut slots = Vec::new();
        let mut by_id = HashMap::new();
        for link in links {
            if by_id.contains_key(&link.id) {
                continue;
            }
            by_id.insert(link.id, slots.len());
            slots.push(LinkSlot::new(link));
        }
        Self { slots, by_id }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[LinkSlot] {
        &self.slots
    }

    pub fn iter(&self) -> impl Iterator<Item = &LinkSlot> {
        self.slots.iter()
    }

    /// Slot position of a link id.
    pub fn index_of(&self, id: usize) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    pub fn get(&self, id: usize) -> Option<&LinkSlot> {
        self.index_of(id).map(|i| &self.slots[i])
    }

    pub fn id_by_name(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .find(|s| s.config.name == name)
            .map(|s| s.id())
    }

    /// Whether any link can carry traffic right now.
    pub fn any_eligible(&self) -> bool {
        self.slots.iter().any(|s| s.state().is_eligible())
    }

    /// Largest smoothed jitter among eligible links.
    pub fn worst_eligible_jitter(&self) -> Duration {
        self.slots
            .iter()
            .filter(|s| s.state().is_eligible())
            .map(|s| s.health().jitter)
            .max()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LinkTable {
        LinkTable::new(vec![
            LinkConfig::new(4, "wan0"),
            LinkConfig::new(9, "lte0"),
            LinkConfig::new(4, "dup"),
        ])
    }

    #[test]
    fn slots_addressable_by_id_and_name() {
        let t = table();
        assert_eq!(t.len(), 2);
        assert_eq!(t.index_of(9), Some(1));
        assert_eq!(t.get(4).unwrap().config().name, "wan0");
        assert_eq!(t.id_by_name("lte0"), Some(9));
        assert!(t.get(5).is_none());
    }

    #[test]
    fn new_links_start_up_with_empty_health() {
        let t = table();
        let slot = t.get(4).unwrap();
        assert_eq!(slot.state(), LinkState::Up);
        assert_eq!(slot.health().latency, None);
        assert!(t.any_eligible());
    }

    #[test]
    fn published_snapshots_are_visible() {
        let t = table();
        let slot = t.get(9).unwrap();
        slot.publish_health(HealthSnapshot {
            jitter: Duration::from_millis(7),
            loss: 0.1,
            ..HealthSnapshot::default()
        });
        slot.publish_status(LinkStatus {
            state: LinkState::Degraded,
            transitions: 1,
            since: None,
        });
        assert_eq!(slot.state(), LinkState::Degraded);
        assert_eq!(slot.status().transitions, 1);
        assert_eq!(t.worst_eligible_jitter(), Duration::from_millis(7));

        t.get(4).unwrap().publish_status(LinkStatus {
            state: LinkState::Down,
            ..LinkStatus::default()
        });
        slot.publish_status(LinkStatus {
            state: LinkState::Down,
            ..LinkStatus::default()
        });
        assert!(!t.any_eligible());
        assert_eq!(t.worst_eligible_jitter(), Duration::ZERO);
    }

    #[test]
    fn hard_down_needs_full_window() {
        let mut h = HealthSnapshot {
            window_len: 5,
            window_successes: 0,
            window_full: false,
            ..HealthSnapshot::default()
        };
        assert!(!h.is_hard_down());
        h.window_full = true;
        assert!(h.is_hard_down());
    }

    #[test]
    fn counters_accumulate() {
        let t = table();
        let slot = t.get(4).unwrap();
        slot.record_sent(100);
        slot.record_sent(50);
        slot.record_send_error();
        assert_eq!(slot.counters.frames_sent.load(Ordering::Relaxed), 2);
        assert_eq!(slot.counters.bytes_sent.load(Ordering::Relaxed), 150);
        assert_eq!(slot.counters.send_errors.load(Ordering::Relaxed), 1);
    }
}
