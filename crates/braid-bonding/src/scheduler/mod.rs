//! # Packet Scheduler
//!
//! Per-packet egress selection. [`qos`] classifies packets against the rule
//! set, [`select`] builds candidate tiers and applies the scheduling mode,
//! and [`bonding`] drives both per batch, adding the pending queue, class
//! policing and FEC fan-out.

pub mod bonding;
pub mod qos;
pub mod select;

pub use bonding::{BondingScheduler, Dispatch, SchedulerStats};
pub use qos::{Classification, QosAction, QosRule, RuleSet};
pub use select::{Candidate, Selector, Tier};
