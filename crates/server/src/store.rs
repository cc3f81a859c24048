//! Blocking interface to the on-disk chunk store.
//!
//! The store's internals (folders, crc files, scanning) live outside this
//! crate; the server only needs the operations below. All methods may block
//! and are called through `spawn_blocking`.

use bytes::Bytes;
use chunkd_proto::status;

/// A chunk-level failure, carrying the wire status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkError(pub u8);

impl std::fmt::Display for ChunkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(status::name(self.0))
    }
}

impl std::error::Error for ChunkError {}

pub type ChunkResult<T> = Result<T, ChunkError>;

/// Collapses a store result into the status byte a reply frame carries.
pub fn status_of<T>(res: &ChunkResult<T>) -> u8 {
    match res {
        Ok(_) => status::OK,
        Err(err) => err.0,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceStats {
    pub used: u64,
    pub total: u64,
    pub chunks: u32,
    /// "to delete" counterparts: space on drives marked for removal.
    pub td_used: u64,
    pub td_total: u64,
    pub td_chunks: u32,
}

/// One block read from a chunk: the stored CRC and the data bytes.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub crc: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkInfoKind {
    Blocks,
    Checksum,
    ChecksumTab,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkInfo {
    Blocks(u16),
    Checksum(u32),
    /// One CRC per block, raw big-endian, 4 * 1024 bytes.
    ChecksumTab(Vec<u8>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebalanceState {
    pub low_speed: bool,
    pub high_speed: bool,
}

/// The blocking chunk store consumed by the job engine and the master
/// connection.
///
/// `chunkop` multiplexes every chunk-lifecycle operation through one call,
/// selected by the argument combination:
///
/// - `newversion > 0 && length == 0xFFFFFFFF && copychunkid == 0` — set version
/// - `newversion > 0 && length == 0xFFFFFFFF && copychunkid > 0` — duplicate
/// - `newversion > 0 && length <= CHUNK_SIZE && copychunkid == 0` — truncate
/// - `newversion > 0 && length <= CHUNK_SIZE && copychunkid > 0` — duptrunc
/// - `newversion > 0 && length & 0x80000000` — local split (low bits are the
///   missing-part mask, `copyversion` the part count)
/// - `newversion == 0 && length == 0|1|2|10|11` — delete / create / test /
///   replicated delete / replicated create
pub trait ChunkStore: Send + Sync + 'static {
    fn open(&self, chunkid: u64, version: u32) -> ChunkResult<()>;
    fn close(&self, chunkid: u64) -> ChunkResult<()>;
    /// Hint that a range is about to be read; best effort.
    fn precache(&self, chunkid: u64, offset: u32, size: u32);
    fn read_block(
        &self,
        chunkid: u64,
        version: u32,
        blocknum: u16,
        offset: u16,
        size: u32,
    ) -> ChunkResult<BlockData>;
    fn write_block(
        &self,
        chunkid: u64,
        version: u32,
        blocknum: u16,
        offset: u16,
        size: u32,
        crc: u32,
        data: &[u8],
    ) -> ChunkResult<()>;
    fn chunkop(
        &self,
        chunkid: u64,
        version: u32,
        newversion: u32,
        copychunkid: u64,
        copyversion: u32,
        length: u32,
    ) -> ChunkResult<()>;
    fn get_chunk_info(
        &self,
        chunkid: u64,
        version: u32,
        kind: ChunkInfoKind,
    ) -> ChunkResult<ChunkInfo>;
    /// Moves chunks between folders (paths are store-defined identifiers).
    fn move_chunks(&self, src: &str, dst: &str) -> ChunkResult<()>;

    /// Opaque per-chunk status payload answered to the master.
    fn chunk_status(&self, chunkid: u64) -> Vec<u8>;

    fn space(&self) -> SpaceStats;
    /// True when space figures changed since the last call.
    fn space_changed(&self) -> bool;
    /// Number of I/O errors since the last call.
    fn error_counter(&self) -> u32;

    fn damaged_chunks(&self) -> Vec<u64>;
    fn lost_chunks(&self, limit: u32) -> Vec<u64>;
    fn new_chunks(&self, limit: u32) -> Vec<(u64, u32)>;
    /// Version-changed chunks; each is reported as lost + new.
    fn changed_chunks(&self, limit: u32) -> Vec<(u64, u32)>;
    fn nonexistent_chunks(&self, limit: u32) -> Vec<u64>;

    /// Opens the incremental registration cursor.
    fn chunks_begin(&self);
    /// Next batch of `(chunkid, version)` pairs, at most `limit`.
    fn chunks_next(&self, limit: u32) -> Vec<(u64, u32)>;
    fn chunks_end(&self);
    /// Master asks for this chunk to be registered first.
    fn reg_first(&self, chunkid: u64);

    fn rebalance(&self) -> RebalanceState;
    /// Number of chunks currently being sent out by the replicator.
    fn sending_chunks(&self) -> u8;

    fn meta_id(&self) -> u64;
    fn set_meta_id(&self, meta_id: u64);
}
