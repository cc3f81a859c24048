//! The read pipeline: one `CLTOCS_READ` request served block by block.

use bytes::{Buf, BufMut, Bytes};
use tracing::{info, warn};

use chunkd_proto::{msg, status, BLOCK_BITS, BLOCK_MASK, BLOCK_SIZE, CHUNK_SIZE};

use crate::net::{try_read_now, BoxReader, SharedWriter, SERV_TIMEOUT};
use crate::serve::{blocking_chunk, close_chunk, guarded, send_read_status, ServeCtx};

/// Serves a parsed `CLTOCS_READ` payload. Returns 1 when the client
/// connection can be reused for further commands, 0 when it must close.
pub(crate) async fn serve_read(
    ctx: &ServeCtx,
    reader: &mut BoxReader,
    writer: &SharedWriter,
    payload: Bytes,
) -> u8 {
    let mut data = payload.as_ref();
    if data.len() != 20 && data.len() != 21 {
        warn!("READ - wrong size ({}/20|21)", data.len());
        return 0;
    }
    let protover = if data.len() == 21 { data.get_u8() } else { 0 };
    let chunkid = data.get_u64();
    let version = data.get_u32();
    let mut offset = data.get_u32();
    let mut size = data.get_u32();

    if size == 0 {
        // no bytes to read - just acknowledge
        return send_read_status(ctx, writer, chunkid, status::OK).await;
    }
    if size > CHUNK_SIZE {
        return send_read_status(ctx, writer, chunkid, status::WRONG_SIZE).await;
    }
    if offset >= CHUNK_SIZE || offset as u64 + size as u64 > CHUNK_SIZE as u64 {
        return send_read_status(ctx, writer, chunkid, status::WRONG_OFFSET).await;
    }

    let nop = (protover != 0).then(|| ctx.keepalive.handle(writer.clone()));

    let open_res = {
        let store = ctx.store.clone();
        guarded(
            &ctx.keepalive,
            nop.as_ref(),
            blocking_chunk(move || store.open(chunkid, version)),
        )
        .await
    };
    if nop.as_ref().is_some_and(|n| n.error()) {
        if open_res.is_ok() {
            close_chunk(ctx, chunkid).await;
        }
        return 0;
    }
    if let Err(err) = open_res {
        return send_read_status(ctx, writer, chunkid, err.0).await;
    }

    {
        let store = ctx.store.clone();
        guarded(
            &ctx.keepalive,
            nop.as_ref(),
            crate::serve::blocking(move || store.precache(chunkid, offset, size)),
        )
        .await;
    }
    if nop.as_ref().is_some_and(|n| n.error()) {
        close_chunk(ctx, chunkid).await;
        return 0;
    }

    let mut hdr = [0u8; 8];
    let mut rcvd = 0usize;
    while size > 0 {
        let blocknum = (offset >> BLOCK_BITS) as u16;
        let blockoffset = (offset & BLOCK_MASK) as u16;
        let blocksize = if (offset + size - 1) >> BLOCK_BITS == blocknum as u32 {
            size
        } else {
            BLOCK_SIZE - blockoffset as u32
        };

        let read_res = {
            let store = ctx.store.clone();
            guarded(
                &ctx.keepalive,
                nop.as_ref(),
                blocking_chunk(move || {
                    store.read_block(chunkid, version, blocknum, blockoffset, blocksize)
                }),
            )
            .await
        };
        if nop.as_ref().is_some_and(|n| n.error()) {
            close_chunk(ctx, chunkid).await;
            return 0;
        }
        let block = match read_res {
            Ok(block) => block,
            Err(err) => {
                close_chunk(ctx, chunkid).await;
                let ret = send_read_status(ctx, writer, chunkid, err.0).await;
                ctx.stats
                    .read_ops
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return ret;
            }
        };

        let mut body = Vec::with_capacity(20 + block.data.len());
        body.put_u64(chunkid);
        body.put_u16(blocknum);
        body.put_u16(blockoffset);
        body.put_u32(blocksize);
        body.put_u32(block.crc);
        body.extend_from_slice(&block.data);
        if let Err(err) = writer
            .send_frame(msg::CSTOCL_READ_DATA, &body, SERV_TIMEOUT)
            .await
        {
            info!("send(read data) failed: {err}");
            close_chunk(ctx, chunkid).await;
            return 0;
        }
        ctx.stats.add_out(8 + body.len() as u64);

        offset += blocksize;
        size -= blocksize;

        // between blocks the client may have sent a NOP; anything else
        // (including a half-closed socket) is treated as an abort
        match try_read_now(reader, &mut hdr[rcvd..]).await {
            Ok(None) => {}
            Ok(Some(0)) | Err(_) => {
                close_chunk(ctx, chunkid).await;
                return 0;
            }
            Ok(Some(n)) => {
                rcvd += n;
                if rcvd == 8 {
                    let mut parse = &hdr[..];
                    let cmd = parse.get_u32();
                    let leng = parse.get_u32();
                    if cmd == msg::ANTOAN_NOP && leng == 0 {
                        rcvd = 0;
                        ctx.stats.add_in(8);
                    } else {
                        close_chunk(ctx, chunkid).await;
                        return 0;
                    }
                }
            }
        }
    }

    close_chunk(ctx, chunkid).await;
    let ret = send_read_status(ctx, writer, chunkid, status::OK).await;
    ctx.stats
        .read_ops
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    ret
}
