//! In-memory store and wiring helpers shared by the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use chunkd_engine::{Engine, EngineConfig};
use chunkd_proto::{status, BLOCK_SIZE};

use crate::conncache::ConnCache;
use crate::keepalive::KeepaliveSender;
use crate::net::DataStats;
use crate::replicator::{ReplicaSource, ReplicationMode, Replicator};
use crate::serve::ServeCtx;
use crate::store::{
    BlockData, ChunkError, ChunkInfo, ChunkInfoKind, ChunkResult, ChunkStore, RebalanceState,
    SpaceStats,
};
use crate::{JobArgs, Runner};

#[derive(Default)]
struct MemChunk {
    version: u32,
    blocks: HashMap<u16, Vec<u8>>,
}

/// Volatile chunk store driving the pipelines and the master connection in
/// tests.
#[derive(Default)]
pub(crate) struct MemStore {
    chunks: Mutex<BTreeMap<u64, MemChunk>>,
    cursor: Mutex<Option<Vec<(u64, u32)>>>,
    meta_id: AtomicU64,
    space_changed: AtomicBool,
    errors: AtomicU32,
    damaged: Mutex<Vec<u64>>,
    lost: Mutex<Vec<u64>>,
}

impl MemStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_chunk(&self, chunkid: u64, version: u32) {
        self.chunks.lock().insert(
            chunkid,
            MemChunk {
                version,
                blocks: HashMap::new(),
            },
        );
    }

    pub(crate) fn has_chunk(&self, chunkid: u64) -> bool {
        self.chunks.lock().contains_key(&chunkid)
    }

    pub(crate) fn put_block(&self, chunkid: u64, blocknum: u16, data: &[u8]) {
        let mut chunks = self.chunks.lock();
        let chunk = chunks.entry(chunkid).or_default();
        let mut block = vec![0u8; BLOCK_SIZE as usize];
        block[..data.len()].copy_from_slice(data);
        chunk.blocks.insert(blocknum, block);
    }

    pub(crate) fn block(&self, chunkid: u64, blocknum: u16) -> Option<Vec<u8>> {
        self.chunks
            .lock()
            .get(&chunkid)
            .and_then(|c| c.blocks.get(&blocknum).cloned())
    }
}

impl ChunkStore for MemStore {
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
        if data.len() != size as usize {
            return Err(ChunkError(status::WRONG_SIZE));
        }
        if crc32fast::hash(data) != crc {
            return Err(ChunkError(status::CRC_ERROR));
        }
        let mut chunks = self.chunks.lock();
        let chunk = chunks.get_mut(&chunkid).ok_or(ChunkError(status::NO_CHUNK))?;
        let block = chunk
            .blocks
            .entry(blocknum)
            .or_insert_with(|| vec![0u8; BLOCK_SIZE as usize]);
        let from = offset as usize;
        block[from..from + data.len()].copy_from_slice(data);
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
        if newversion == 0 {
            return match length {
                0 | 10 => chunks
                    .remove(&chunkid)
                    .map(|_| ())
                    .ok_or(ChunkError(status::NO_CHUNK)),
                1 | 11 => {
                    chunks.insert(
                        chunkid,
                        MemChunk {
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
        chunk.version = newversion;
        if copychunkid > 0 {
            let blocks = chunk.blocks.clone();
            chunks.insert(
                copychunkid,
                MemChunk {
                    version: newversion,
                    blocks,
                },
            );
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
            ChunkInfoKind::Blocks => ChunkInfo::Blocks(chunk.blocks.len() as u16),
            ChunkInfoKind::Checksum => ChunkInfo::Checksum(chunkid as u32 ^ 0xC0FF_EE00),
            ChunkInfoKind::ChecksumTab => ChunkInfo::ChecksumTab(vec![0u8; 4096]),
        })
    }

    fn move_chunks(&self, _src: &str, _dst: &str) -> ChunkResult<()> {
        Ok(())
    }

    fn chunk_status(&self, chunkid: u64) -> Vec<u8> {
        chunkid.to_be_bytes().to_vec()
    }

    fn space(&self) -> SpaceStats {
        let chunks = self.chunks.lock();
        SpaceStats {
            used: chunks.len() as u64 * BLOCK_SIZE as u64,
            total: 1 << 30,
            chunks: chunks.len() as u32,
            ..SpaceStats::default()
        }
    }

    fn space_changed(&self) -> bool {
        self.space_changed.swap(false, Ordering::Relaxed)
    }

    fn error_counter(&self) -> u32 {
        self.errors.swap(0, Ordering::Relaxed)
    }

    fn damaged_chunks(&self) -> Vec<u64> {
        std::mem::take(&mut *self.damaged.lock())
    }

    fn lost_chunks(&self, limit: u32) -> Vec<u64> {
        let mut lost = self.lost.lock();
        let take = lost.len().min(limit as usize);
        lost.drain(..take).collect()
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
            .map(|(id, chunk)| (*id, chunk.version))
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

pub(crate) struct NullReplicator;

impl Replicator for NullReplicator {
    fn replicate(
        &self,
        _mode: ReplicationMode,
        _chunkid: u64,
        _version: u32,
        _sources: &[ReplicaSource],
    ) -> ChunkResult<()> {
        Ok(())
    }
}

pub(crate) fn test_ctx(store: Arc<MemStore>) -> Arc<ServeCtx> {
    let (keepalive, _) = KeepaliveSender::start();
    let (conncache, _) = ConnCache::start();
    Arc::new(ServeCtx {
        store,
        keepalive,
        conncache,
        stats: Arc::new(DataStats::default()),
    })
}

pub(crate) fn test_engine(store: Arc<MemStore>) -> Arc<Engine<JobArgs>> {
    let runner = Arc::new(Runner {
        ctx: test_ctx(store),
        replicator: Arc::new(NullReplicator),
    });
    Arc::new(Engine::start(EngineConfig::with_workers_max(8), runner))
}
