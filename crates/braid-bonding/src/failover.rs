//! # Failover Controller
//!
//! Owns the per-link state machine. Consumes health samples, applies the
//! hysteresis thresholds and publishes every state change to the link
//! table, where the scheduler picks it up on its next batch.
//!
//! ```text
//!   UP ──(3 failures | loss > 25%)──▶ DEGRADED ──(6 failures | hard down)──▶ DOWN
//!    ▲                                  │                                     │
//!    └──────(5 successes, loss ok)──────┘                              (1 success)
//!    ▲                                                                        ▼
//!    └───────────────(5 successes)─────────── RECOVERING ◀────────────────────┘
//!                                                 │ (any failure)
//!                                                 └────────────▶ DOWN
//! ```
//!
//! An explicit link-down signal forces DOWN from any state.

use quanta::Instant;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::FailoverConfig;
use crate::monitor::HealthSample;
use crate::net::interface::LinkState;
use crate::net::table::{HealthSnapshot, LinkStatus, LinkTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    ConsecutiveFailures,
    LossAboveThreshold,
    HardDown,
    LinkDown,
    ProbeSuccess,
    Recovered,
    RecoveryFailed,
}

impl TransitionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionReason::ConsecutiveFailures => "consecutive_failures",
            TransitionReason::LossAboveThreshold => "loss_above_threshold",
            TransitionReason::HardDown => "hard_down",
            TransitionReason::LinkDown => "link_down",
            TransitionReason::ProbeSuccess => "probe_success",
            TransitionReason::Recovered => "recovered",
            TransitionReason::RecoveryFailed => "recovery_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub link_id: usize,
    pub from: LinkState,
    pub to: LinkState,
    pub reason: TransitionReason,
    pub at: Instant,
}

/// Hysteresis counters for one link. Counts are the controller's own and
/// restart at every transition, so a link must re-earn each step.
#[derive(Debug, Clone, Copy, Default)]
struct LinkFsm {
    state: LinkState,
    failures: u32,
    successes: u32,
    transitions: u64,
}

pub struct FailoverController {
    config: FailoverConfig,
    table: Arc<LinkTable>,
    /// Parallel to the table's slots.
    links: Vec<LinkFsm>,
}

impl FailoverController {
    pub fn new(config: FailoverConfig, table: Arc<LinkTable>) -> Self {
        let links = table
            .iter()
            .map(|slot| LinkFsm {
                state: slot.state(),
                ..LinkFsm::default()
            })
            .collect();
        Self {
            config,
            table,
            links,
        }
    }

    pub fn state(&self, link_id: usize) -> Option<LinkState> {
        self.table.index_of(link_id).map(|i| self.links[i].state)
    }

    pub fn transitions(&self, link_id: usize) -> u64 {
        self.table
            .index_of(link_id)
            .map_or(0, |i| self.links[i].transitions)
    }

    /// Apply one health sample. `health` is the link's snapshot after the
    /// sample was recorded. Returns the transitions taken, in order.
    pub fn observe(&mut self, sample: &HealthSample, health: &HealthSnapshot) -> Vec<Transition> {
        let Some(idx) = self.table.index_of(sample.link_id) else {
            return Vec::new();
        };
        let success = sample.outcome.is_success();
        let cfg = &self.config;
        let fsm = &mut self.links[idx];
        if success {
            fsm.successes += 1;
            fsm.failures = 0;
        } else {
            fsm.failures += 1;
            fsm.successes = 0;
        }

        let loss_high = health.window_full && health.loss > cfg.loss_threshold;
        let mut taken = Vec::new();
        // A single sample can carry a link across more than one threshold,
        // e.g. DOWN -> RECOVERING -> UP with a recovery threshold of 1.
        loop {
            let next = match fsm.state {
                LinkState::Up if fsm.failures >= cfg.failure_threshold => {
                    Some((LinkState::Degraded, TransitionReason::ConsecutiveFailures))
                }
                LinkState::Up if loss_high => {
                    Some((LinkState::Degraded, TransitionReason::LossAboveThreshold))
                }
                LinkState::Degraded if fsm.failures >= cfg.down_threshold => {
                    Some((LinkState::Down, TransitionReason::ConsecutiveFailures))
                }
                LinkState::Degraded if health.is_hard_down() => {
                    Some((LinkState::Down, TransitionReason::HardDown))
                }
                LinkState::Degraded
                    if fsm.successes >= cfg.recovery_threshold && !loss_high =>
                {
                    Some((LinkState::Up, TransitionReason::Recovered))
                }
                LinkState::Down if success => {
                    Some((LinkState::Recovering, TransitionReason::ProbeSuccess))
                }
                LinkState::Recovering if !success => {
                    Some((LinkState::Down, TransitionReason::RecoveryFailed))
                }
                LinkState::Recovering if fsm.successes >= cfg.recovery_threshold => {
                    Some((LinkState::Up, TransitionReason::Recovered))
                }
                _ => None,
            };
            let Some((to, reason)) = next else {
                break;
            };
            let from = fsm.state;
            fsm.state = to;
            fsm.transitions += 1;
            // The first success after DOWN opens the recovery streak; every
            // other transition starts counting afresh.
            if reason != TransitionReason::ProbeSuccess {
                fsm.failures = 0;
                fsm.successes = 0;
            }
            taken.push(Transition {
                link_id: sample.link_id,
                from,
                to,
                reason,
                at: sample.at,
            });
        }

        for t in &taken {
            self.publish(idx, t);
        }
        taken
    }

    /// Explicit link-down from the interface layer. Forces DOWN from any
    /// state; no-op for a link already DOWN.
    pub fn link_down(&mut self, link_id: usize, now: Instant) -> Option<Transition> {
        let idx = self.table.index_of(link_id)?;
        let fsm = &mut self.links[idx];
        if fsm.state == LinkState::Down {
            return None;
        }
        let t = Transition {
            link_id,
            from: fsm.state,
            to: LinkState::Down,
            reason: TransitionReason::LinkDown,
            at: now,
        };
        fsm.state = LinkState::Down;
        fsm.transitions += 1;
        fsm.failures = 0;
        fsm.successes = 0;
        self.publish(idx, &t);
        Some(t)
    }

    fn publish(&self, idx: usize, t: &Transition) {
        let slot = &self.table.slots()[idx];
        let fsm = &self.links[idx];
        slot.publish_status(LinkStatus {
            state: t.to,
            transitions: fsm.transitions,
            since: Some(t.at),
        });
        let name = slot.config().name.as_str();
        if t.from == LinkState::Up {
            warn!(
                link_id = t.link_id,
                link = name,
                from = t.from.as_str(),
                state = t.to.as_str(),
                reason = t.reason.as_str(),
                "link left UP"
            );
        } else if t.to == LinkState::Up {
            info!(
                link_id = t.link_id,
                link = name,
                from = t.from.as_str(),
                reason = t.reason.as_str(),
                "link back UP"
            );
        } else {
            info!(
                link_id = t.link_id,
                link = name,
                from = t.from.as_str(),
                state = t.to.as_str(),
                reason = t.reason.as_str(),
                "link state changed"
            );
        }
    }
}
