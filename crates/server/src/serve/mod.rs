//! Client-facing read and write pipelines. Each runs to completion as a
//! single high-priority job owning the connection's socket halves.

pub(crate) mod read;
pub(crate) mod write;

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use chunkd_proto::msg;

use crate::conncache::ConnCache;
use crate::keepalive::{KeepaliveSender, NopHandle};
use crate::net::{DataStats, SharedWriter, SERV_TIMEOUT};
use crate::store::{ChunkError, ChunkResult, ChunkStore};

/// Everything a pipeline needs from the server.
pub(crate) struct ServeCtx {
    pub store: Arc<dyn ChunkStore>,
    pub keepalive: KeepaliveSender,
    pub conncache: ConnCache,
    pub stats: Arc<DataStats>,
}

/// Runs a blocking store call off the runtime.
pub(crate) async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> T + Send + 'static,
) -> Option<T> {
    tokio::task::spawn_blocking(f).await.ok()
}

pub(crate) async fn blocking_chunk<T: Send + 'static>(
    f: impl FnOnce() -> ChunkResult<T> + Send + 'static,
) -> ChunkResult<T> {
    blocking(f)
        .await
        .unwrap_or(Err(ChunkError(chunkd_proto::status::IO)))
}

/// Keeps the socket alive (when the protocol version asks for it) across a
/// blocking call: register, run, deregister. The caller checks the handle's
/// error flag afterwards.
pub(crate) async fn guarded<T>(
    keepalive: &KeepaliveSender,
    nop: Option<&NopHandle>,
    fut: impl Future<Output = T>,
) -> T {
    if let Some(nop) = nop {
        keepalive.register(nop);
    }
    let out = fut.await;
    if let Some(nop) = nop {
        keepalive.deregister(nop);
    }
    out
}

pub(crate) async fn close_chunk(ctx: &ServeCtx, chunkid: u64) {
    let store = ctx.store.clone();
    let _ = blocking(move || store.close(chunkid)).await;
}

/// Sends `CSTOCL_READ_STATUS(chunkid, status)`. Returns 1 when the
/// connection is still usable.
pub(crate) async fn send_read_status(
    ctx: &ServeCtx,
    writer: &SharedWriter,
    chunkid: u64,
    status: u8,
) -> u8 {
    let mut body = Vec::with_capacity(9);
    body.extend_from_slice(&chunkid.to_be_bytes());
    body.push(status);
    match writer
        .send_frame(msg::CSTOCL_READ_STATUS, &body, SERV_TIMEOUT)
        .await
    {
        Ok(()) => {
            ctx.stats.add_out(8 + 9);
            1
        }
        Err(err) => {
            info!("send(read status) failed: {err}");
            0
        }
    }
}

/// Sends `CSTOCL_WRITE_STATUS(chunkid, writeid, status)`. Returns 1 when
/// the connection is still usable.
pub(crate) async fn send_write_status(
    ctx: &ServeCtx,
    writer: &SharedWriter,
    chunkid: u64,
    writeid: u32,
    status: u8,
) -> u8 {
    let mut body = Vec::with_capacity(13);
    body.extend_from_slice(&chunkid.to_be_bytes());
    body.extend_from_slice(&writeid.to_be_bytes());
    body.push(status);
    match writer
        .send_frame(msg::CSTOCL_WRITE_STATUS, &body, SERV_TIMEOUT)
        .await
    {
        Ok(()) => {
            ctx.stats.add_out(8 + 13);
            1
        }
        Err(err) => {
            info!("send(write status) failed: {err}");
            0
        }
    }
}
