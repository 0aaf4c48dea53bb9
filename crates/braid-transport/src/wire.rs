//! # Braid Wire Format
//!
//! Every frame on a WAN link is one FEC shard. The frame cipher owns the
//! outer fields (sequence number, timestamp, authentication tag); this module
//! owns the inner shard header, which is sealed together with the payload.
//!
//! ## Sealed frame
//!
//! ```text
//! +-------------------------------+
//! | Sequence (64)                 |  outer, written by the FrameCipher
//! | Timestamp µs (64)             |
//! +-------------------------------+
//! | Ver (8) | FEC (8)             |  inner shard header (19 bytes)
//! | Block ID (64)                 |
//! | Shard Idx (8) | K (8) | M (8) |
//! | Block Length (32)             |
//! | Payload Length (16)           |
//! +-------------------------------+
//! | Payload                       |
//! +-------------------------------+
//! | Authentication tag (opaque)   |
//! +-------------------------------+
//! ```
//!
//! All integers are big-endian. Unprotected packets travel as a block of one
//! data shard and no parity (`FEC = 0`, `K = 1`, `M = 0`).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::codec::{FecKind, MAX_SHARDS};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Shard header version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Encoded size of [`ShardHeader`]: 1 + 1 + 8 + 1 + 1 + 1 + 4 + 2.
pub const SHARD_HEADER_SIZE: usize = 19;

/// Largest payload a single shard can carry.
pub const MAX_SHARD_PAYLOAD: usize = u16::MAX as usize;

const SCHEME_NONE: u8 = 0;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Reasons a shard frame fails to parse. Malformed frames are dropped by the
/// receiver and counted, never surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unsupported shard header version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown FEC scheme {0}")]
    UnknownScheme(u8),

    #[error("invalid shard geometry: index {index} with k={data_shards} m={parity_shards}")]
    InvalidGeometry {
        index: u8,
        data_shards: u8,
        parity_shards: u8,
    },

    #[error("payload length {declared} does not match {actual} remaining bytes")]
    LengthMismatch { declared: usize, actual: usize },
}

// ─── Shard Header ────────────────────────────────────────────────────────────

/// Inner header carried by every shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardHeader {
    /// FEC scheme of the block, `None` for unprotected packets.
    pub fec: Option<FecKind>,
    /// Ties the shards of one block together on the decode side.
    pub block_id: u64,
    /// Position of this shard in the block; parity shards follow data shards.
    pub shard_index: u8,
    /// `k`: number of data shards in the block.
    pub data_shards: u8,
    /// `m`: number of parity shards in the block.
    pub parity_shards: u8,
    /// Original length of the block before padding.
    pub block_len: u32,
    /// Length of this shard's payload.
    pub payload_len: u16,
}

impl ShardHeader {
    /// Header for a packet sent without FEC protection.
    pub fn unprotected(block_id: u64, len: usize) -> Self {
        Self {
            fec: None,
            block_id,
            shard_index: 0,
            data_shards: 1,
            parity_shards: 0,
            block_len: len as u32,
            payload_len: len as u16,
        }
    }

    /// `k + m`.
    pub fn total_shards(&self) -> usize {
        self.data_shards as usize + self.parity_shards as usize
    }

    /// Whether this shard is one of the parity shards of its block.
    pub fn is_parity(&self) -> bool {
        self.shard_index >= self.data_shards
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.fec.map(FecKind::to_wire).unwrap_or(SCHEME_NONE));
        buf.put_u64(self.block_id);
        buf.put_u8(self.shard_index);
        buf.put_u8(self.data_shards);
        buf.put_u8(self.parity_shards);
        buf.put_u32(self.block_len);
        buf.put_u16(self.payload_len);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < SHARD_HEADER_SIZE {
            return Err(WireError::Truncated {
                needed: SHARD_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }

        let scheme = buf.get_u8();
        let fec = match scheme {
            SCHEME_NONE => None,
            other => Some(FecKind::from_wire(other).ok_or(WireError::UnknownScheme(other))?),
        };

        let header = ShardHeader {
            fec,
            block_id: buf.get_u64(),
            shard_index: buf.get_u8(),
            data_shards: buf.get_u8(),
            parity_shards: buf.get_u8(),
            block_len: buf.get_u32(),
            payload_len: buf.get_u16(),
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<(), WireError> {
        let total = self.total_shards();
        let geometry_ok = self.data_shards >= 1
            && total <= MAX_SHARDS
            && (self.shard_index as usize) < total
            && (self.fec.is_some() || (self.data_shards == 1 && self.parity_shards == 0));
        if !geometry_ok {
            return Err(WireError::InvalidGeometry {
                index: self.shard_index,
                data_shards: self.data_shards,
                parity_shards: self.parity_shards,
            });
        }
        Ok(())
    }
}

// ─── Shard Frame ─────────────────────────────────────────────────────────────

/// A shard header plus its payload: the plaintext handed to the frame cipher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFrame {
    pub header: ShardHeader,
    pub payload: Bytes,
}

impl ShardFrame {
    pub fn new(mut header: ShardHeader, payload: Bytes) -> Self {
        header.payload_len = payload.len() as u16;
        Self { header, payload }
    }

    /// Total encoded size.
    pub fn encoded_len(&self) -> usize {
        SHARD_HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a frame, taking the payload as a zero-copy slice of `buf`.
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let header = ShardHeader::decode(&mut buf)?;
        let declared = header.payload_len as usize;
        if declared != buf.len() {
            return Err(WireError::LengthMismatch {
                declared,
                actual: buf.len(),
            });
        }
        Ok(Self {
            header,
            payload: buf,
        })
    }
}
