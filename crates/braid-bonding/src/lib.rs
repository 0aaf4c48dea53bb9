//! # braid-bonding
//!
//! Data plane of a Braid tunnel: several WAN links bonded into one logical
//! path.
//!
//! ```text
//! send:    ingress ─▶ classify ─▶ schedule ─▶ FEC encode ─▶ seal ─▶ link tx
//! receive: link rx ─▶ open ─▶ FEC assemble ─▶ reorder ─▶ egress
//!
//! health:  probers ─▶ HealthMonitor ─▶ FailoverController ─▶ LinkTable
//! ```
//!
//! The health loop runs beside the packet path and only publishes
//! snapshots into the [`net::table::LinkTable`]; the scheduler reads them
//! without locking.

pub mod config;
pub mod error;
pub mod failover;
pub mod metrics;
pub mod monitor;
pub mod net;
pub mod packet;
pub mod pipeline;
pub mod receiver;
pub mod scheduler;
pub mod telemetry;
