//! Wire protocol for the chunkd chunkserver: frame type ids, status bytes,
//! protocol size constants and the `type | length | payload` framing codec.
//!
//! All integers on the wire are big-endian.

mod codec;
pub mod msg;
pub mod status;

pub use codec::{Frame, FrameCodec, FrameError};

/// Size of a chunk block in bytes (64 KiB).
pub const BLOCK_SIZE: u32 = 1 << BLOCK_BITS;

/// log2 of [`BLOCK_SIZE`].
pub const BLOCK_BITS: u32 = 16;

/// Mask of the in-block offset bits.
pub const BLOCK_MASK: u32 = BLOCK_SIZE - 1;

/// Number of blocks in a chunk.
pub const BLOCKS_IN_CHUNK: u32 = 1024;

/// Maximum size of a chunk in bytes (64 MiB).
pub const CHUNK_SIZE: u32 = BLOCK_SIZE * BLOCKS_IN_CHUNK;

/// Maximum number of erasure-coding parts a replication command may carry.
pub const MAX_EC_PARTS: usize = 17;

/// Upper bound on a data-path frame payload (write/read data plus headroom).
pub const DATA_MAX_PACKET_SIZE: u32 = 100_000;

/// Upper bound on a master-link frame payload.
pub const MASTER_MAX_PACKET_SIZE: u32 = 1 << 16;

/// Payload bound for small forwarded control frames in the write chain.
pub const SMALL_PACKET_SIZE: u32 = 12;

/// An 8-byte NOP frame (`type = NOP`, `length = 0`).
pub const NOP_FRAME: [u8; 8] = [0; 8];

/// Packs a dotted version into the single integer exchanged at registration.
pub const fn version_int(major: u32, mid: u32, minor: u32) -> u32 {
    (major << 16) | (mid << 8) | minor
}

/// Version advertised in the registration frame.
pub const SERVER_VERSION: u32 = version_int(0, 4, 0);
