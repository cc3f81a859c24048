//! Chunkserver core: the job engine wiring, client-facing read/write
//! pipelines, the master connection, the keepalive NOP sender and the
//! downstream connection cache.
//!
//! The on-disk store and the replication worker are external collaborators,
//! consumed through the blocking [`ChunkStore`] and [`Replicator`] traits.

mod busychunks;
pub mod config;
mod conncache;
mod csid;
mod csserv;
mod keepalive;
mod master;
mod net;
mod replicator;
mod serve;
mod store;
#[cfg(test)]
pub(crate) mod testutil;

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use chunkd_engine::{Engine, JobRunner, OpKind};
use chunkd_proto::status;

pub use config::Config;
pub use conncache::CachedConn;
pub use master::MasterConfig;
pub use net::{BoxReader, DataStats, SharedWriter};
pub use replicator::{ReplicaSource, ReplicationMode, Replicator};
pub use store::{
    BlockData, ChunkError, ChunkInfo, ChunkInfoKind, ChunkResult, ChunkStore, RebalanceState,
    SpaceStats,
};

use conncache::ConnCache;
use keepalive::KeepaliveSender;
use serve::{blocking_chunk, ServeCtx};

/// Payload scheduled alongside an [`OpKind`] on the job pools.
pub enum JobArgs {
    None,
    ChunkOp {
        chunkid: u64,
        version: u32,
        newversion: u32,
        copychunkid: u64,
        copyversion: u32,
        length: u32,
    },
    /// A client read or write request, owning the connection's socket
    /// halves for the duration of the pipeline. The halves travel back
    /// through `resume` together with the pipeline's status.
    Serv {
        reader: BoxReader,
        writer: SharedWriter,
        payload: Bytes,
        resume: oneshot::Sender<(u8, BoxReader, SharedWriter)>,
    },
    Replicate {
        mode: ReplicationMode,
        chunkid: u64,
        version: u32,
        sources: Vec<ReplicaSource>,
    },
    GetInfo {
        chunkid: u64,
        version: u32,
        kind: ChunkInfoKind,
        out: Arc<Mutex<Option<ChunkInfo>>>,
    },
    ChunkMove {
        src: String,
        dst: String,
    },
}

/// Executes jobs against the store, the replicator and client sockets.
pub(crate) struct Runner {
    ctx: Arc<ServeCtx>,
    replicator: Arc<dyn Replicator>,
}

impl JobRunner<JobArgs> for Runner {
    fn run(&self, op: OpKind, args: JobArgs) -> Pin<Box<dyn Future<Output = u8> + Send>> {
        let ctx = self.ctx.clone();
        let replicator = self.replicator.clone();
        Box::pin(async move {
            match (op, args) {
                (
                    OpKind::ChunkOp,
                    JobArgs::ChunkOp {
                        chunkid,
                        version,
                        newversion,
                        copychunkid,
                        copyversion,
                        length,
                    },
                ) => {
                    let store = ctx.store.clone();
                    let res = blocking_chunk(move || {
                        store.chunkop(chunkid, version, newversion, copychunkid, copyversion, length)
                    })
                    .await;
                    store::status_of(&res)
                }
                (
                    OpKind::ServRead,
                    JobArgs::Serv {
                        mut reader,
                        writer,
                        payload,
                        resume,
                    },
                ) => {
                    let ret = serve::read::serve_read(&ctx, &mut reader, &writer, payload).await;
                    let _ = resume.send((ret, reader, writer));
                    ret
                }
                (
                    OpKind::ServWrite,
                    JobArgs::Serv {
                        mut reader,
                        writer,
                        payload,
                        resume,
                    },
                ) => {
                    let ret = serve::write::serve_write(&ctx, &mut reader, &writer, payload).await;
                    let _ = resume.send((ret, reader, writer));
                    ret
                }
                (
                    OpKind::ReplicateSimple
                    | OpKind::ReplicateSplit
                    | OpKind::ReplicateRecover
                    | OpKind::ReplicateJoin,
                    JobArgs::Replicate {
                        mode,
                        chunkid,
                        version,
                        sources,
                    },
                ) => {
                    let res = blocking_chunk(move || {
                        replicator.replicate(mode, chunkid, version, &sources)
                    })
                    .await;
                    store::status_of(&res)
                }
                (
                    OpKind::GetInfo,
                    JobArgs::GetInfo {
                        chunkid,
                        version,
                        kind,
                        out,
                    },
                ) => {
                    let store = ctx.store.clone();
                    let res =
                        blocking_chunk(move || store.get_chunk_info(chunkid, version, kind)).await;
                    match res {
                        Ok(info) => {
                            *out.lock() = Some(info);
                            status::OK
                        }
                        Err(err) => err.0,
                    }
                }
                (OpKind::ChunkMove, JobArgs::ChunkMove { src, dst }) => {
                    let store = ctx.store.clone();
                    let res = blocking_chunk(move || store.move_chunks(&src, &dst)).await;
                    store::status_of(&res)
                }
                _ => status::EINVAL,
            }
        })
    }
}

/// A running chunkserver: engine, client acceptor, master connection and
/// background tasks.
pub struct Chunkserver {
    engine: Arc<Engine<JobArgs>>,
    master: master::MasterHandle,
    listener_task: JoinHandle<()>,
    keepalive_task: JoinHandle<()>,
    conncache_task: JoinHandle<()>,
    stats: Arc<DataStats>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Chunkserver {
    /// Binds the client listener and starts every component. `shutdown` is
    /// cancelled by the caller for a graceful stop, and cancelled by the
    /// server itself on fatal conditions (master metadata mismatch).
    pub async fn start(
        config: Config,
        store: Arc<dyn ChunkStore>,
        replicator: Arc<dyn Replicator>,
        shutdown: CancellationToken,
    ) -> std::io::Result<Self> {
        let listener =
            TcpListener::bind((config.listen_host.as_str(), config.listen_port)).await?;
        let local_addr = listener.local_addr()?;

        let (keepalive, keepalive_task) = KeepaliveSender::start();
        let (conncache, conncache_task) = ConnCache::start();
        let stats = Arc::new(DataStats::default());
        let ctx = Arc::new(ServeCtx {
            store: store.clone(),
            keepalive,
            conncache,
            stats: stats.clone(),
        });
        let runner = Arc::new(Runner {
            ctx: ctx.clone(),
            replicator,
        });
        let engine: Arc<Engine<JobArgs>> = Arc::new(Engine::start(config.engine_config(), runner));

        let listen_ip = match local_addr {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        let master_cfg = MasterConfig {
            host: config.master_host.clone(),
            port: config.master_port,
            bind_host: config.bind_host.clone(),
            timeout: config.master_timeout,
            reconnection_delay: config.master_reconnection_delay,
            chunks_per_register_packet: config.chunks_per_register_packet,
            auth_code: config.auth_code.clone(),
            label_mask: config.label_mask(),
            listen_ip,
            listen_port: config.listen_port,
            data_path: config.data_path.clone(),
        };
        let master = master::spawn_master(master_cfg, store, engine.clone(), shutdown.clone());
        let listener_task =
            csserv::spawn_listener(listener, ctx, engine.clone(), shutdown.clone());

        info!("chunkserver listening on {local_addr}");
        Ok(Self {
            engine,
            master,
            listener_task,
            keepalive_task,
            conncache_task,
            stats,
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &DataStats {
        &self.stats
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Waits for the shutdown token, then tears everything down in order:
    /// the master connection unregisters and drains, the acceptor stops,
    /// the pools join their workers.
    pub async fn wait(self) {
        self.shutdown.cancelled().await;
        self.master.join().await;
        self.listener_task.abort();
        self.engine.shutdown().await;
        self.keepalive_task.abort();
        self.conncache_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_engine, MemStore};
    use chunkd_engine::SubmitMode;

    async fn submit_and_wait(
        engine: &Engine<JobArgs>,
        high_priority: bool,
        op: OpKind,
        args: JobArgs,
    ) -> u8 {
        let (done_tx, done_rx) = oneshot::channel();
        let pool = if high_priority {
            engine.hp()
        } else {
            engine.lp()
        };
        let submitted = pool.submit(
            op,
            0,
            args,
            Some(Box::new(move |status| {
                let _ = done_tx.send(status);
            })),
            status::NOT_DONE,
            SubmitMode::AlwaysDo,
        );
        assert!(submitted.is_ok());
        done_rx.await.unwrap()
    }

    #[tokio::test]
    async fn runner_dispatches_low_priority_ops() {
        let store = Arc::new(MemStore::new());
        store.add_chunk(3, 1);
        let engine = test_engine(store.clone());

        let moved = submit_and_wait(
            &engine,
            false,
            OpKind::ChunkMove,
            JobArgs::ChunkMove {
                src: "/data/0".into(),
                dst: "/data/1".into(),
            },
        )
        .await;
        assert_eq!(moved, status::OK);

        let replicated = submit_and_wait(
            &engine,
            false,
            OpKind::ReplicateSimple,
            JobArgs::Replicate {
                mode: ReplicationMode::Simple,
                chunkid: 3,
                version: 1,
                sources: Vec::new(),
            },
        )
        .await;
        assert_eq!(replicated, status::OK);

        let out = Arc::new(Mutex::new(None));
        let info = submit_and_wait(
            &engine,
            false,
            OpKind::GetInfo,
            JobArgs::GetInfo {
                chunkid: 3,
                version: 1,
                kind: ChunkInfoKind::Blocks,
                out: out.clone(),
            },
        )
        .await;
        assert_eq!(info, status::OK);
        assert_eq!(*out.lock(), Some(ChunkInfo::Blocks(0)));
    }

    #[tokio::test]
    async fn chunkop_against_missing_chunk_reports_no_chunk() {
        let store = Arc::new(MemStore::new());
        let engine = test_engine(store);
        let deleted = submit_and_wait(
            &engine,
            true,
            OpKind::ChunkOp,
            JobArgs::ChunkOp {
                chunkid: 404,
                version: 1,
                newversion: 0,
                copychunkid: 0,
                copyversion: 0,
                length: 0,
            },
        )
        .await;
        assert_eq!(deleted, status::NO_CHUNK);
    }
}
