//! Blocking interface to the replication / erasure-coding worker.

use std::net::Ipv4Addr;

use crate::store::ChunkResult;

/// One replication source peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaSource {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub chunkid: u64,
}

/// Kind of replication requested by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Plain copy from a single source.
    Simple,
    /// Build one EC part out of a whole-chunk source.
    Split { part_no: u8, parts: u8 },
    /// Rebuild a part from surviving parts.
    Recover { parts: u8 },
    /// Join parts back into a whole chunk.
    Join { parts: u8 },
}

pub trait Replicator: Send + Sync + 'static {
    /// Replicates `chunkid`/`version` locally from `sources`. Blocking;
    /// runs on the low-priority pool.
    fn replicate(
        &self,
        mode: ReplicationMode,
        chunkid: u64,
        version: u32,
        sources: &[ReplicaSource],
    ) -> ChunkResult<()>;
}
