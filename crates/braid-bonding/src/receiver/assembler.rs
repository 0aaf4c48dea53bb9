use bytes::Bytes;
use quanta::Instant;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, trace};

use braid_transport::codec::{FecCodec, FecParams, ShardMask};
use braid_transport::stats::FecDecodeStats;
use braid_transport::wire::ShardFrame;

/// Completed block ids remembered for late-shard detection.
const COMPLETED_MEMORY: usize = 4096;

/// What the assembler hands to the reorder stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    Packet {
        sequence: u64,
        payload: Bytes,
        /// Rebuilt from parity rather than received whole.
        recovered: bool,
    },
    /// The block could not be rebuilt; the reorder buffer may skip it.
    Lost { sequence: u64 },
}

impl Assembled {
    pub fn sequence(&self) -> u64 {
        match self {
            Assembled::Packet { sequence, .. } | Assembled::Lost { sequence } => *sequence,
        }
    }
}

struct PendingBlock {
    sequence: u64,
    params: FecParams,
    block_len: usize,
    shards: Vec<Option<Bytes>>,
    present: ShardMask,
    first_seen: Instant,
}

/// Collects the shards of FEC blocks and rebuilds each block as soon as
/// enough shards are in.
///
/// Unprotected frames pass straight through. A protected block completes
/// when every data shard arrived, or earlier when the codec reports the
/// present set recoverable; shards arriving after completion are stale.
/// Blocks still incomplete after the assembly timeout are reported lost.
pub struct ShardAssembler {
    timeout: Duration,
    pending: HashMap<u64, PendingBlock>,
    codecs: HashMap<FecParams, FecCodec>,
    completed: HashSet<u64>,
    completed_order: VecDeque<u64>,
    stats: FecDecodeStats,
}

impl ShardAssembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: HashMap::new(),
            codecs: HashMap::new(),
            completed: HashSet::new(),
            completed_order: VecDeque::with_capacity(COMPLETED_MEMORY),
            stats: FecDecodeStats::default(),
        }
    }

    pub fn stats(&self) -> &FecDecodeStats {
        &self.stats
    }

    /// Blocks waiting for more shards.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, sequence: u64, frame: ShardFrame, now: Instant) -> Option<Assembled> {
        let header = frame.header;
        let Some(kind) = header.fec else {
            return Some(Assembled::Packet {
                sequence,
                payload: frame.payload,
                recovered: false,
            });
        };
        let block_id = header.block_id;
        if self.completed.contains(&block_id) {
            self.stats.shards_stale += 1;
            return None;
        }

        let params = FecParams::new(
            kind,
            header.data_shards as usize,
            header.parity_shards as usize,
        );
        let block_len = header.block_len as usize;
        if !self.codecs.contains_key(&params) {
            match FecCodec::new(params) {
                Ok(c) => {
                    self.codecs.insert(params, c);
                }
                Err(e) => {
                    self.stats.decode_errors += 1;
                    debug!(block_id, error = %e, "unusable FEC parameters");
                    return None;
                }
            }
        }
        let codec = &self.codecs[&params];

        let index = header.shard_index as usize;
        let expected = if index < params.data_shards {
            codec.shard_len(block_len)
        } else {
            codec.parity_len(block_len)
        };
        if frame.payload.len() != expected {
            self.stats.decode_errors += 1;
            trace!(block_id, index, expected, actual = frame.payload.len(), "shard length mismatch");
            return None;
        }

        let block = self.pending.entry(block_id).or_insert_with(|| PendingBlock {
            sequence,
            params,
            block_len,
            shards: vec![None; params.total_shards()],
            present: 0,
            first_seen: now,
        });
        if block.params != params || block.block_len != block_len {
            self.stats.decode_errors += 1;
            trace!(block_id, "shard disagrees with its block geometry");
            return None;
        }
        if block.shards[index].is_some() {
            self.stats.shards_duplicate += 1;
            return None;
        }
        block.shards[index] = Some(frame.payload);
        block.present |= 1 << index;
        self.stats.shards_received += 1;

        if !codec.can_recover(block.present) {
            return None;
        }
        let all_data = block.present.count_ones() as usize >= params.data_shards
            && block.shards[..params.data_shards].iter().all(Option::is_some);
        let result = codec.decode(&block.shards, block.block_len);
        let sequence = block.sequence;
        self.pending.remove(&block_id);
        self.remember(block_id);

        match result {
            Ok(payload) => {
                if all_data {
                    self.stats.blocks_complete += 1;
                } else {
                    self.stats.blocks_recovered += 1;
                    trace!(block_id, "block rebuilt from parity");
                }
                Some(Assembled::Packet {
                    sequence,
                    payload,
                    recovered: !all_data,
                })
            }
            Err(e) => {
                self.stats.decode_errors += 1;
                self.stats.blocks_lost += 1;
                debug!(block_id, error = %e, "FEC decode failed");
                Some(Assembled::Lost { sequence })
            }
        }
    }

    /// Give up on blocks older than the assembly timeout. Returned in
    /// sequence order.
    pub fn expire(&mut self, now: Instant) -> Vec<Assembled> {
        let timeout = self.timeout;
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, b)| now.saturating_duration_since(b.first_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        self.abandon(expired)
    }

    /// Give up on every pending block (shutdown).
    pub fn flush(&mut self) -> Vec<Assembled> {
        let all: Vec<u64> = self.pending.keys().copied().collect();
        self.abandon(all)
    }

    fn abandon(&mut self, ids: Vec<u64>) -> Vec<Assembled> {
        let mut lost: Vec<Assembled> = ids
            .into_iter()
            .filter_map(|id| {
                let block = self.pending.remove(&id)?;
                self.remember(id);
                self.stats.blocks_lost += 1;
                trace!(
                    block_id = id,
                    present = block.present.count_ones(),
                    needed = block.params.data_shards,
                    "block expired"
                );
                Some(Assembled::Lost {
                    sequence: block.sequence,
                })
            })
            .collect();
        lost.sort_by_key(Assembled::sequence);
        lost
    }

    fn remember(&mut self, block_id: u64) {
        if self.completed.insert(block_id) {
            self.completed_order.push_back(block_id);
            if self.completed_order.len() > COMPLETED_MEMORY {
                if let Some(old) = self.completed_order.pop_front() {
                    self.completed.remove(&old);
                }
            }
        }
    }
}
