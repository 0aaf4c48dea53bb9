//! # FEC Codec: block erasure coding
//!
//! A block (one packet in byte-window mode) is split into `k` data shards
//! and extended with `m` parity shards. Two schemes are supported:
//!
//! - **Reed-Solomon**: true erasure coding via `reed-solomon-simd`; any `k`
//!   of the `k + m` shards reconstruct the block.
//! - **XOR**: single parity. Every parity shard is the XOR of all data
//!   shards, so at most one missing data shard can be rebuilt no matter how
//!   large `m` is. Extra parity shards only add path diversity.
//!
//! The codec is stateless. Callers track which shards arrived in a
//! [`ShardMask`] and must consult [`FecCodec::can_recover`] before calling
//! [`FecCodec::decode`]; the two agree exactly.
//!
//! ## Shard geometry
//!
//! `shard_len = max(1, ceil(len / k))`. The tail data shard is zero padded
//! and the original length travels in the shard header. The Reed-Solomon
//! backend only works on even shard sizes, so its parity shards are rounded
//! up to the next even length; data shards never carry that extra byte.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wire::MAX_SHARD_PAYLOAD;

/// Upper bound on `k + m`: presence is tracked in a `u64`.
pub const MAX_SHARDS: usize = 64;

/// Bit `i` set means shard `i` is present.
pub type ShardMask = u64;

// ─── Parameters ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FecKind {
    ReedSolomon,
    Xor,
}

impl FecKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FecKind::ReedSolomon => "reed_solomon",
            FecKind::Xor => "xor",
        }
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            FecKind::ReedSolomon => 1,
            FecKind::Xor => 2,
        }
    }

    pub(crate) fn from_wire(v: u8) -> Option<Self> {
        match v {
            1 => Some(FecKind::ReedSolomon),
            2 => Some(FecKind::Xor),
            _ => None,
        }
    }
}

/// Scheme plus `(k, m)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FecParams {
    pub kind: FecKind,
    pub data_shards: usize,
    pub parity_shards: usize,
}

impl FecParams {
    pub fn new(kind: FecKind, data_shards: usize, parity_shards: usize) -> Self {
        Self {
            kind,
            data_shards,
            parity_shards,
        }
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    pub fn validate(&self) -> Result<(), FecError> {
        if self.data_shards == 0 {
            return Err(FecError::InvalidParams {
                data_shards: self.data_shards,
                parity_shards: self.parity_shards,
                reason: "at least one data shard is required",
            });
        }
        if self.total_shards() > MAX_SHARDS {
            return Err(FecError::InvalidParams {
                data_shards: self.data_shards,
                parity_shards: self.parity_shards,
                reason: "k + m must not exceed 64",
            });
        }
        Ok(())
    }
}

impl Default for FecParams {
    fn default() -> Self {
        Self::new(FecKind::ReedSolomon, 4, 2)
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FecError {
    #[error("invalid FEC parameters k={data_shards} m={parity_shards}: {reason}")]
    InvalidParams {
        data_shards: usize,
        parity_shards: usize,
        reason: &'static str,
    },

    #[error("insufficient shards: {present} present, block needs {required}")]
    InsufficientShards { present: usize, required: usize },

    #[error("expected {expected} shard slots, got {actual}")]
    ShardCount { expected: usize, actual: usize },

    #[error("shard {index} has length {actual}, expected {expected}")]
    ShardLength {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("block of {len} bytes exceeds the {max} byte limit")]
    BlockTooLarge { len: usize, max: usize },

    #[error("reed-solomon backend: {0}")]
    Backend(String),
}

impl From<reed_solomon_simd::Error> for FecError {
    fn from(e: reed_solomon_simd::Error) -> Self {
        FecError::Backend(e.to_string())
    }
}

// ─── Codec ───────────────────────────────────────────────────────────────────

/// Reed-Solomon erasure coding over `k + m` shards.
#[derive(Debug, Clone)]
pub struct ReedSolomonCodec {
    k: usize,
    m: usize,
}

/// Single-parity XOR coding.
#[derive(Debug, Clone)]
pub struct XorCodec {
    k: usize,
    m: usize,
}

/// FEC codec, selected once at construction.
#[derive(Debug, Clone)]
pub enum FecCodec {
    ReedSolomon(ReedSolomonCodec),
    Xor(XorCodec),
}

impl FecCodec {
    pub fn new(params: FecParams) -> Result<Self, FecError> {
        params.validate()?;
        let (k, m) = (params.data_shards, params.parity_shards);
        Ok(match params.kind {
            FecKind::ReedSolomon => FecCodec::ReedSolomon(ReedSolomonCodec { k, m }),
            FecKind::Xor => FecCodec::Xor(XorCodec { k, m }),
        })
    }

    pub fn kind(&self) -> FecKind {
        match self {
            FecCodec::ReedSolomon(_) => FecKind::ReedSolomon,
            FecCodec::Xor(_) => FecKind::Xor,
        }
    }

    pub fn params(&self) -> FecParams {
        let (k, m) = self.geometry();
        FecParams::new(self.kind(), k, m)
    }

    pub fn data_shards(&self) -> usize {
        self.geometry().0
    }

    pub fn parity_shards(&self) -> usize {
        self.geometry().1
    }

    pub fn total_shards(&self) -> usize {
        let (k, m) = self.geometry();
        k + m
    }

    /// Fraction of transmitted shards that are redundancy: `m / (k + m)`.
    pub fn overhead(&self) -> f64 {
        let (k, m) = self.geometry();
        m as f64 / (k + m) as f64
    }

    /// Largest block this codec can encode.
    pub fn max_block_len(&self) -> usize {
        // Keep the even-rounded parity length within a u16 payload.
        self.data_shards() * (MAX_SHARD_PAYLOAD - 1)
    }

    /// Length of each data shard for a block of `len` bytes.
    pub fn shard_len(&self, len: usize) -> usize {
        len.div_ceil(self.data_shards()).max(1)
    }

    /// Length of each parity shard for a block of `len` bytes.
    pub fn parity_len(&self, len: usize) -> usize {
        match self {
            FecCodec::ReedSolomon(_) => round_up_even(self.shard_len(len)),
            FecCodec::Xor(_) => self.shard_len(len),
        }
    }

    /// Split `data` into `k` data shards followed by `m` parity shards.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Bytes>, FecError> {
        if data.len() > self.max_block_len() {
            return Err(FecError::BlockTooLarge {
                len: data.len(),
                max: self.max_block_len(),
            });
        }
        let shard_len = self.shard_len(data.len());
        let data_shards = split_padded(data, self.data_shards(), shard_len);

        let parity = match self {
            FecCodec::ReedSolomon(rs) => rs.encode_parity(&data_shards, shard_len)?,
            FecCodec::Xor(x) => x.encode_parity(&data_shards, shard_len),
        };

        let mut out = Vec::with_capacity(self.total_shards());
        out.extend(data_shards.into_iter().map(Bytes::from));
        out.extend(parity);
        Ok(out)
    }

    /// Whether the shards flagged in `present` are enough to rebuild the
    /// block. Bits at or beyond `k + m` are ignored.
    pub fn can_recover(&self, present: ShardMask) -> bool {
        let (k, m) = self.geometry();
        let present = present & mask_below(k + m);
        let data_missing = k - (present & mask_below(k)).count_ones() as usize;
        if data_missing == 0 {
            return true;
        }
        match self {
            FecCodec::ReedSolomon(_) => present.count_ones() as usize >= k,
            FecCodec::Xor(_) => data_missing == 1 && m > 0 && (present >> k) != 0,
        }
    }

    /// Rebuild the original `original_len` bytes from the shards that
    /// arrived. `shards` has one slot per shard index.
    pub fn decode(&self, shards: &[Option<Bytes>], original_len: usize) -> Result<Bytes, FecError> {
        let (k, m) = self.geometry();
        if shards.len() != k + m {
            return Err(FecError::ShardCount {
                expected: k + m,
                actual: shards.len(),
            });
        }
        if original_len > self.max_block_len() {
            return Err(FecError::BlockTooLarge {
                len: original_len,
                max: self.max_block_len(),
            });
        }

        let shard_len = self.shard_len(original_len);
        let parity_len = self.parity_len(original_len);
        for (index, shard) in shards.iter().enumerate() {
            if let Some(s) = shard {
                let expected = if index < k { shard_len } else { parity_len };
                if s.len() != expected {
                    return Err(FecError::ShardLength {
                        index,
                        expected,
                        actual: s.len(),
                    });
                }
            }
        }

        let present = presence_mask(shards);
        if !self.can_recover(present) {
            let available = present.count_ones() as usize;
            return Err(FecError::InsufficientShards {
                present: available,
                required: k,
            });
        }

        // Fast path: every data shard arrived.
        if (present & mask_below(k)) == mask_below(k) {
            return Ok(join_data(shards[..k].iter().flatten(), original_len));
        }

        let rebuilt = match self {
            FecCodec::ReedSolomon(rs) => rs.reconstruct(shards, shard_len, parity_len)?,
            FecCodec::Xor(_) => XorCodec::reconstruct(shards, k, shard_len),
        };
        Ok(join_data(rebuilt.iter(), original_len))
    }

    fn geometry(&self) -> (usize, usize) {
        match self {
            FecCodec::ReedSolomon(c) => (c.k, c.m),
            FecCodec::Xor(c) => (c.k, c.m),
        }
    }
}

/// Build a presence mask from shard slots.
pub fn presence_mask(shards: &[Option<Bytes>]) -> ShardMask {
    shards
        .iter()
        .take(MAX_SHARDS)
        .enumerate()
        .filter(|(_, s)| s.is_some())
        .fold(0, |mask, (i, _)| mask | (1u64 << i))
}

// ─── Reed-Solomon ────────────────────────────────────────────────────────────

impl ReedSolomonCodec {
    fn encode_parity(&self, data: &[Vec<u8>], shard_len: usize) -> Result<Vec<Bytes>, FecError> {
        if self.m == 0 {
            return Ok(Vec::new());
        }
        let even = round_up_even(shard_len);
        let padded: Vec<Vec<u8>> = data.iter().map(|s| pad_to(s, even)).collect();
        let parity = reed_solomon_simd::encode(self.k, self.m, &padded)?;
        Ok(parity.into_iter().map(Bytes::from).collect())
    }

    /// Returns all `k` data shards, trimmed to `shard_len`.
    fn reconstruct(
        &self,
        shards: &[Option<Bytes>],
        shard_len: usize,
        parity_len: usize,
    ) -> Result<Vec<Bytes>, FecError> {
        let originals: Vec<(usize, Vec<u8>)> = shards[..self.k]
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, pad_to(s, parity_len))))
            .collect();
        let recovery = shards[self.k..]
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, &s[..])));

        let mut restored = reed_solomon_simd::decode(
            self.k,
            self.m,
            originals.iter().map(|(i, s)| (*i, s.as_slice())),
            recovery,
        )?;

        let mut out = Vec::with_capacity(self.k);
        for (index, shard) in shards[..self.k].iter().enumerate() {
            let bytes = match shard {
                Some(s) => s.clone(),
                None => {
                    let mut s = restored.remove(&index).ok_or(FecError::InsufficientShards {
                        present: presence_mask(shards).count_ones() as usize,
                        required: self.k,
                    })?;
                    s.truncate(shard_len);
                    Bytes::from(s)
                }
            };
            out.push(bytes);
        }
        Ok(out)
    }
}

// ─── XOR ─────────────────────────────────────────────────────────────────────

impl XorCodec {
    fn encode_parity(&self, data: &[Vec<u8>], shard_len: usize) -> Vec<Bytes> {
        if self.m == 0 {
            return Vec::new();
        }
        let mut parity = vec![0u8; shard_len];
        for shard in data {
            xor_into(&mut parity, shard);
        }
        let parity = Bytes::from(parity);
        vec![parity; self.m]
    }

    /// Exactly one data shard is missing and a parity shard is present;
    /// `can_recover` has already checked.
    fn reconstruct(shards: &[Option<Bytes>], k: usize, shard_len: usize) -> Vec<Bytes> {
        let mut missing = vec![0u8; shard_len];
        if let Some(parity) = shards[k..].iter().flatten().next() {
            xor_into(&mut missing, parity);
        }
        for shard in shards[..k].iter().flatten() {
            xor_into(&mut missing, shard);
        }
        let mut missing = Some(Bytes::from(missing));
        shards[..k]
            .iter()
            .map(|s| match s {
                Some(s) => s.clone(),
                None => missing.take().unwrap_or_default(),
            })
            .collect()
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn mask_below(n: usize) -> ShardMask {
    if n >= 64 {
        u64::MAX
    } else {
        (1u64 << n) - 1
    }
}

fn round_up_even(n: usize) -> usize {
    n + (n & 1)
}

fn pad_to(src: &[u8], len: usize) -> Vec<u8> {
    let mut v = Vec::with_capacity(len);
    v.extend_from_slice(src);
    v.resize(len, 0);
    v
}

fn split_padded(data: &[u8], k: usize, shard_len: usize) -> Vec<Vec<u8>> {
    (0..k)
        .map(|i| {
            let start = (i * shard_len).min(data.len());
            let end = ((i + 1) * shard_len).min(data.len());
            pad_to(&data[start..end], shard_len)
        })
        .collect()
}

fn join_data<'a>(shards: impl Iterator<Item = &'a Bytes>, original_len: usize) -> Bytes {
    let mut out = BytesMut::with_capacity(original_len);
    for shard in shards {
        let take = shard.len().min(original_len - out.len());
        out.extend_from_slice(&shard[..take]);
        if out.len() == original_len {
            break;
        }
    }
    out.freeze()
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}
