//! Per-packet failure kinds.
//!
//! Nothing on the packet path is fatal: every stage reports what happened to
//! a packet as a value and bumps the matching counter. Only configuration
//! loading aborts (see [`crate::config::ConfigError`]).

use serde::Serialize;
use thiserror::Error;

/// Why a packet (or frame) left the pipeline without being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum DropReason {
    /// No link was eligible and the packet could not be queued for later.
    #[error("no eligible link")]
    LinkIneligible,
    /// The pending queue or a bounded stage channel was full.
    #[error("queue overflow")]
    QueueOverflow,
    /// The packet waited longer than the queue wait limit.
    #[error("queue wait exceeded")]
    QueueTimeout,
    /// Class bandwidth ceiling exceeded.
    #[error("rate limited")]
    RateLimited,
    /// Too few shards of a block arrived before it timed out.
    #[error("insufficient FEC shards")]
    FecInsufficientShards,
    /// The frame cipher rejected the frame.
    #[error("authentication failure")]
    AuthenticationFailure,
    /// Shard header or framing did not parse.
    #[error("malformed frame")]
    Malformed,
    /// Evicted from a full reorder buffer.
    #[error("reorder buffer capacity exceeded")]
    BufferCapacityExceeded,
    /// Held in the reorder buffer past its max age.
    #[error("reorder buffer age exceeded")]
    BufferAgeExceeded,
    /// Arrived below the next expected sequence number.
    #[error("late arrival")]
    Late,
    /// Already held, or already delivered.
    #[error("duplicate")]
    Duplicate,
    /// Discarded when the shutdown grace period ran out.
    #[error("discarded at shutdown")]
    Shutdown,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::LinkIneligible => "link_ineligible",
            DropReason::QueueOverflow => "queue_overflow",
            DropReason::QueueTimeout => "queue_timeout",
            DropReason::RateLimited => "rate_limited",
            DropReason::FecInsufficientShards => "fec_insufficient_shards",
            DropReason::AuthenticationFailure => "authentication_failure",
            DropReason::Malformed => "malformed",
            DropReason::BufferCapacityExceeded => "buffer_capacity_exceeded",
            DropReason::BufferAgeExceeded => "buffer_age_exceeded",
            DropReason::Late => "late",
            DropReason::Duplicate => "duplicate",
            DropReason::Shutdown => "shutdown",
        }
    }
}

/// One counter per [`DropReason`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropCounters {
    pub link_ineligible: u64,
    pub queue_overflow: u64,
    pub queue_timeout: u64,
    pub rate_limited: u64,
    pub fec_insufficient_shards: u64,
    pub authentication_failure: u64,
    pub malformed: u64,
    pub buffer_capacity_exceeded: u64,
    pub buffer_age_exceeded: u64,
    pub late: u64,
    pub duplicate: u64,
    pub shutdown: u64,
}

impl DropCounters {
    pub fn record(&mut self, reason: DropReason) {
        self.add(reason, 1);
    }

    pub fn add(&mut self, reason: DropReason, n: u64) {
        let slot = match reason {
            DropReason::LinkIneligible => &mut self.link_ineligible,
            DropReason::QueueOverflow => &mut self.queue_overflow,
            DropReason::QueueTimeout => &mut self.queue_timeout,
            DropReason::RateLimited => &mut self.rate_limited,
            DropReason::FecInsufficientShards => &mut self.fec_insufficient_shards,
            DropReason::AuthenticationFailure => &mut self.authentication_failure,
            DropReason::Malformed => &mut self.malformed,
            DropReason::BufferCapacityExceeded => &mut self.buffer_capacity_exceeded,
            DropReason::BufferAgeExceeded => &mut self.buffer_age_exceeded,
            DropReason::Late => &mut self.late,
            DropReason::Duplicate => &mut self.duplicate,
            DropReason::Shutdown => &mut self.shutdown,
        };
        *slot += n;
    }

    pub fn get(&self, reason: DropReason) -> u64 {
        match reason {
            DropReason::LinkIneligible => self.link_ineligible,
            DropReason::QueueOverflow => self.queue_overflow,
            DropReason::QueueTimeout => self.queue_timeout,
            DropReason::RateLimited => self.rate_limited,
            DropReason::FecInsufficientShards => self.fec_insufficient_shards,
            DropReason::AuthenticationFailure => self.authentication_failure,
            DropReason::Malformed => self.malformed,
            DropReason::BufferCapacityExceeded => self.buffer_capacity_exceeded,
            DropReason::BufferAgeExceeded => self.buffer_age_exceeded,
            DropReason::Late => self.late,
            DropReason::Duplicate => self.duplicate,
            DropReason::Shutdown => self.shutdown,
        }
    }

    /// Element-wise sum, used to merge per-stage counters into one view.
    pub fn merge(&mut self, other: &DropCounters) {
        self.link_ineligible += other.link_ineligible;
        self.queue_overflow += other.queue_overflow;
        self.queue_timeout += other.queue_timeout;
        self.rate_limited += other.rate_limited;
        self.fec_insufficient_shards += other.fec_insufficient_shards;
        self.authentication_failure += other.authentication_failure;
        self.malformed += other.malformed;
        self.buffer_capacity_exceeded += other.buffer_capacity_exceeded;
        self.buffer_age_exceeded += other.buffer_age_exceeded;
        self.late += other.late;
        self.duplicate += other.duplicate;
        self.shutdown += other.shutdown;
    }

    pub fn total(&self) -> u64 {
        self.link_ineligible
            + self.queue_overflow
            + self.queue_timeout
            + self.rate_limited
            + self.fec_insufficient_shards
            + self.authentication_failure
            + self.malformed
            + self.buffer_capacity_exceeded
            + self.buffer_age_exceeded
            + self.late
            + self.duplicate
            + self.shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_merge() {
        let mut a = DropCounters::default();
        a.record(DropReason::QueueOverflow);
        a.add(DropReason::RateLimited, 3);
        let mut b = DropCounters::default();
        b.record(DropReason::QueueOverflow);
        a.merge(&b);
        assert_eq!(a.get(DropReason::QueueOverflow), 2);
        assert_eq!(a.get(DropReason::RateLimited), 3);
        assert_eq!(a.total(), 5);
    }

    #[test]
    fn reason_names_match_counter_fields() {
        let mut c = DropCounters::default();
        c.record(DropReason::BufferAgeExceeded);
        let json = serde_json::to_value(c).unwrap();
        assert_eq!(json[DropReason::BufferAgeExceeded.as_str()], 1);
        assert_eq!(DropReason::AuthenticationFailure.to_string(), "authentication failure");
    }
}
