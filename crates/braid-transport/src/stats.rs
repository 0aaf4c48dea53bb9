//! # Codec Statistics
//!
//! Counters for the FEC encode and decode sides. Owned by whichever stage
//! drives the codec and exported through the pipeline snapshot.

use serde::Serialize;

// ─── Encoder Stats ───────────────────────────────────────────────────────────

/// Send-side FEC counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FecEncodeStats {
    /// Blocks encoded with parity.
    pub blocks_encoded: u64,
    /// Data shards emitted.
    pub data_shards: u64,
    /// Parity shards emitted.
    pub parity_shards: u64,
    /// Encode calls that failed (oversized block, backend error).
    pub encode_errors: u64,
}

impl FecEncodeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one encoded block of `k` data and `m` parity shards.
    pub fn record_block(&mut self, k: usize, m: usize) {
        self.blocks_encoded += 1;
        self.data_shards += k as u64;
        self.parity_shards += m as u64;
    }

    /// Observed redundancy: parity shards / all shards sent.
    pub fn overhead(&self) -> f64 {
        let total = self.data_shards + self.parity_shards;
        if total == 0 {
            0.0
        } else {
            self.parity_shards as f64 / total as f64
        }
    }
}

// ─── Decoder Stats ───────────────────────────────────────────────────────────

/// Receive-side FEC counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FecDecodeStats {
    /// Shards accepted into an assembly.
    pub shards_received: u64,
    /// Shards for blocks already completed or abandoned.
    pub shards_stale: u64,
    /// Shards whose index was already held.
    pub shards_duplicate: u64,
    /// Blocks delivered with every data shard present.
    pub blocks_complete: u64,
    /// Blocks delivered after rebuilding missing data shards.
    pub blocks_recovered: u64,
    /// Blocks abandoned without enough shards.
    pub blocks_lost: u64,
    /// Decode attempts that returned an error despite `can_recover`.
    pub decode_errors: u64,
}

impl FecDecodeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of blocks with missing data shards that FEC managed to
    /// rebuild. `1.0` when no block needed recovery.
    pub fn recovery_rate(&self) -> f64 {
        let attempts = self.blocks_recovered + self.blocks_lost;
        if attempts == 0 {
            1.0
        } else {
            self.blocks_recovered as f64 / attempts as f64
        }
    }
}
