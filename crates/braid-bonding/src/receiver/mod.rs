//! # Receive Path
//!
//! Frames come off the links as shards. [`assembler`] collects them into
//! FEC blocks and rebuilds packets, [`reorder`] puts the packets back into
//! tunnel sequence order before they leave the pipeline.

pub mod assembler;
pub mod reorder;

pub use assembler::{Assembled, ShardAssembler};
pub use reorder::{InsertOutcome, ReorderBuffer, ReorderStats, Released};
