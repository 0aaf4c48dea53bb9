//! # braid-transport
//!
//! Wire layer shared by both ends of a Braid tunnel.
//!
//! Every packet that crosses a WAN link travels as one or more *shards*.
//! A shard carries a small header that ties it to an FEC block, and the
//! whole frame is sealed by an external authenticated-encryption service
//! that owns the outer sequence number and timestamp fields.
//!
//! ## Crate structure
//!
//! - [`wire`] — Shard header serialization
//! - [`codec`] — FEC encoding/decoding (Reed-Solomon erasure coding or single-parity XOR)
//! - [`crypto`] — Frame cipher seam (`seal` / `open`) and a clear-text implementation
//! - [`stats`] — Codec counters for telemetry

pub mod codec;
pub mod crypto;
pub mod stats;
pub mod wire;
