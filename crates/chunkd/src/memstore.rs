//! Volatile in-memory chunk store for development runs.
//!
//! Real deployments plug a disk-backed store into the [`ChunkStore`] trait;
//! this one keeps chunks in maps so the server is runnable end to end
//! without any drives configured.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use chunkd_proto::{status, BLOCK_SIZE};
use chunkd_server::{
    BlockData, ChunkError, ChunkInfo, ChunkInfoKind, ChunkResult, ChunkStore, RebalanceState,
    ReplicaSource, ReplicationMode, Replicator, SpaceStats,
};

const DEV_TOTAL_SPACE: u64 = 8 << 30;

#[derive(Default)]
struct Chunk {
    version: u32,
    blocks: HashMap<u16, Vec<u8>>,
}

impl Chunk {
    fn used(&self) -> u64 {
        self.blocks.len() as u64 * BLOCK_SIZE as u64
    }
}

#[derive(Default)]
pub struct MemChunkStore {
    chunks: Mutex<BTreeMap<u64, Chunk>>,
    cursor: Mutex<Option<Vec<(u64, u32)>>>,
    meta_id: AtomicU64,
    dirty: AtomicBool,
}

impl MemChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkStore for MemChunkStore {
    fn open(&self, chunkid: u64, version: u32) -> ChunkResult<()> {
        let chunks = self.chunks.lock();
        match chunks.get(&chunkid) {
            Some(chunk) if chunk.version == version => Ok(()),
            Some(_) => Err(ChunkError(status::WRONG_VERSION)),
            None => Err(ChunkError(status::NO_CHUNK)),
        }
    }

    fn close(&self, _chunkid: u64) -> ChunkResult<()> {
        Ok(())
    }

    fn precache(&self, _chunkid: u64, _offset: u32, _size: u32) {}

    fn read_block(
        &self,
        chunkid: u64,
        _version: u32,
        blocknum: u16,
        offset: u16,
        size: u32,
    ) -> ChunkResult<BlockData> {
        let chunks = self.chunks.lock();
        let chunk = chunks.get(&chunkid).ok_or(ChunkError(status::NO_CHUNK))?;
        let empty = vec![0u8; BLOCK_SIZE as usize];
        let block = chunk.blocks.get(&blocknum).unwrap_or(&empty);
        let from = offset as usize;
        let to = from + size as usize;
        if to > block.len() {
            return Err(ChunkError(status::WRONG_OFFSET));
        }
        let data = Bytes::copy_from_slice(&block[from..to]);
        let crc = crc32fast::hash(&data);
        Ok(BlockData { crc, data })
    }

    fn write_block(
        &self,
        chunkid: u64,
        _version: u32,
        blocknum: u16,
        offset: u16,
        size: u32,
        crc: u32,
        data: &[u8],
    ) -> ChunkResult<()> {
        if data.len() != size as usize || offset as u32 + size > BLOCK_SIZE {
            return Err(ChunkError(status::WRONG_SIZE));
        }
        if crc32fast::hash(data) != crc {
            return Err(ChunkError(status::CRC_ERROR));
        }
        let mut chunks = self.chunks.lock();
        let chunk = chunks
            .get_mut(&chunkid)
            .ok_or(ChunkError(status::NO_CHUNK))?;
        let block = chunk
            .blocks
            .entry(blocknum)
            .or_insert_with(|| vec![0u8; BLOCK_SIZE as usize]);
        let from = offset as usize;
        block[from..from + data.len()].copy_from_slice(data);
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn chunkop(
        &self,
        chunkid: u64,
        version: u32,
        newversion: u32,
        copychunkid: u64,
        _copyversion: u32,
        length: u32,
    ) -> ChunkResult<()> {
        let mut chunks = self.chunks.lock();
        self.dirty.store(true, Ordering::Relaxed);
        if newversion == 0 {
            return match length {
                0 | 10 => chunks
                    .remove(&chunkid)
                    .map(|_| ())
                    .ok_or(ChunkError(status::NO_CHUNK)),
                1 | 11 => {
                    chunks.insert(
                        chunkid,
                        Chunk {
                            version,
                            blocks: HashMap::new(),
                        },
                    );
                    Ok(())
                }
                2 => chunks
                    .get(&chunkid)
                    .map(|_| ())
                    .ok_or(ChunkError(status::NO_CHUNK)),
                _ => Err(ChunkError(status::EINVAL)),
            };
        }
        let Some(chunk) = chunks.get_mut(&chunkid) else {
            return Err(ChunkError(status::NO_CHUNK));
        };
        if chunk.version != version {
            return Err(ChunkError(status::WRONG_VERSION));
        }
        chunk.version = newversion;
        if length & 0x8000_0000 != 0 {
            // local split: nothing to rearrange in a flat in-memory store
            return Ok(());
        }
        if copychunkid > 0 {
            let blocks = chunk.blocks.clone();
            chunks.insert(
                copychunkid,
                Chunk {
                    version: newversion,
                    blocks,
                },
            );
        } else if length != 0xFFFF_FFFF {
            let keep_blocks = (length as u64).div_ceil(BLOCK_SIZE as u64) as u16;
            let chunk = chunks.get_mut(&chunkid).expect("chunk checked above");
            chunk.blocks.retain(|blocknum, _| *blocknum < keep_blocks);
        }
        Ok(())
    }

    fn get_chunk_info(
        &self,
        chunkid: u64,
        _version: u32,
        kind: ChunkInfoKind,
    ) -> ChunkResult<ChunkInfo> {
        let chunks = self.chunks.lock();
        let chunk = chunks.get(&chunkid).ok_or(ChunkError(status::NO_CHUNK))?;
        Ok(match kind {
            ChunkInfoKind::Blocks => {
                let blocks = chunk.blocks.keys().max().map_or(0, |max| max + 1);
                ChunkInfo::Blocks(blocks)
            }
            ChunkInfoKind::Checksum => {
                let mut hasher = crc32fast::Hasher::new();
                for (blocknum, block) in &chunk.blocks {
                    hasher.update(&blocknum.to_be_bytes());
                    hasher.update(block);
                }
                ChunkInfo::Checksum(hasher.finalize())
            }
            ChunkInfoKind::ChecksumTab => {
                let mut tab = Vec::with_capacity(4096);
                for blocknum in 0..1024u16 {
                    let crc = chunk
                        .blocks
                        .get(&blocknum)
                        .map_or(0, |block| crc32fast::hash(block));
                    tab.extend_from_slice(&crc.to_be_bytes());
                }
                ChunkInfo::ChecksumTab(tab)
            }
        })
    }

    fn move_chunks(&self, _src: &str, _dst: &str) -> ChunkResult<()> {
        Ok(())
    }

    fn chunk_status(&self, chunkid: u64) -> Vec<u8> {
        let chunks = self.chunks.lock();
        let mut out = Vec::with_capacity(13);
        out.extend_from_slice(&chunkid.to_be_bytes());
        match chunks.get(&chunkid) {
            Some(chunk) => {
                out.extend_from_slice(&chunk.version.to_be_bytes());
                out.push(1);
            }
            None => {
                out.extend_from_slice(&0u32.to_be_bytes());
                out.push(0);
            }
        }
        out
    }

    fn space(&self) -> SpaceStats {
        let chunks = self.chunks.lock();
        let used: u64 = chunks.values().map(Chunk::used).sum();
        SpaceStats {
            used,
            total: DEV_TOTAL_SPACE,
            chunks: chunks.len() as u32,
            ..SpaceStats::default()
        }
    }

    fn space_changed(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    fn error_counter(&self) -> u32 {
        0
    }

    fn damaged_chunks(&self) -> Vec<u64> {
        Vec::new()
    }

    fn lost_chunks(&self, _limit: u32) -> Vec<u64> {
        Vec::new()
    }

    fn new_chunks(&self, _limit: u32) -> Vec<(u64, u32)> {
        Vec::new()
    }

    fn changed_chunks(&self, _limit: u32) -> Vec<(u64, u32)> {
        Vec::new()
    }

    fn nonexistent_chunks(&self, _limit: u32) -> Vec<u64> {
        Vec::new()
    }

    fn chunks_begin(&self) {
        let list = self
            .chunks
            .lock()
            .iter()
            .map(|(chunkid, chunk)| (*chunkid, chunk.version))
            .collect();
        *self.cursor.lock() = Some(list);
    }

    fn chunks_next(&self, limit: u32) -> Vec<(u64, u32)> {
        let mut cursor = self.cursor.lock();
        let Some(list) = cursor.as_mut() else {
            return Vec::new();
        };
        let take = list.len().min(limit as usize);
        list.drain(..take).collect()
    }

    fn chunks_end(&self) {
        *self.cursor.lock() = None;
    }

    fn reg_first(&self, _chunkid: u64) {}

    fn rebalance(&self) -> RebalanceState {
        RebalanceState::default()
    }

    fn sending_chunks(&self) -> u8 {
        0
    }

    fn meta_id(&self) -> u64 {
        self.meta_id.load(Ordering::Relaxed)
    }

    fn set_meta_id(&self, meta_id: u64) {
        self.meta_id.store(meta_id, Ordering::Relaxed);
    }
}

/// Development replicator: materializes the target chunk locally instead of
/// pulling data from peers.
pub struct MemReplicator {
    store: std::sync::Arc<MemChunkStore>,
}

impl MemReplicator {
    pub fn new(store: std::sync::Arc<MemChunkStore>) -> Self {
        Self { store }
    }
}

impl Replicator for MemReplicator {
    fn replicate(
        &self,
        _mode: ReplicationMode,
        chunkid: u64,
        version: u32,
        _sources: &[ReplicaSource],
    ) -> ChunkResult<()> {
        let mut chunks = self.store.chunks.lock();
        chunks.entry(chunkid).or_default().version = version;
        Ok(())
    }
}
