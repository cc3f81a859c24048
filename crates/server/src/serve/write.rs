//! The write pipeline: chain-forwarding state machine plus the last-in-chain
//! loop.
//!
//! A middle-of-chain request juggles four event sources at once: frames from
//! the upstream peer, acknowledgements from the downstream peer, completions
//! from a dedicated blocking disk-writer, and the keepalive error flags. All
//! pending writes live on one queue walked by three cursors: the queue front
//! (awaiting both acknowledgements), the disk cursor and the network cursor.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use chunkd_proto::{msg, status, DATA_MAX_PACKET_SIZE, SMALL_PACKET_SIZE};

use crate::conncache::CachedConn;
use crate::keepalive::NopHandle;
use crate::net::{read_exact_timeout, BoxReader, SharedWriter, SERV_TIMEOUT};
use crate::serve::{blocking_chunk, close_chunk, send_write_status, ServeCtx};
use crate::store::ChunkStore;

const CONNECT_RETRIES: u32 = 10;

fn connect_timeout(attempt: u32) -> Duration {
    let ms = if attempt % 2 == 1 {
        300u64 << (attempt / 2)
    } else {
        200u64 << (attempt / 2)
    };
    Duration::from_millis(ms)
}

async fn connect_downstream(ip: Ipv4Addr, port: u16, timeout: Duration) -> Option<CachedConn> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect((ip, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!("connect to {ip}:{port} failed: {err}");
            return None;
        }
        Err(_) => {
            warn!("connect to {ip}:{port} timed out");
            return None;
        }
    };
    if let Err(err) = stream.set_nodelay(true) {
        info!("can't set TCP_NODELAY: {err}");
    }
    let (rd, wr) = stream.into_split();
    Some(CachedConn {
        reader: Box::new(rd),
        writer: SharedWriter::new(wr),
    })
}

/// Serves a parsed `CLTOCS_WRITE` initiation. Returns nonzero when the
/// client connection can be reused (2 additionally means the downstream
/// socket was drained cleanly).
pub(crate) async fn serve_write(
    ctx: &ServeCtx,
    reader: &mut BoxReader,
    writer: &SharedWriter,
    payload: Bytes,
) -> u8 {
    let mut data = payload.as_ref();
    let protover = if data.len() % 2 == 1 {
        if data.len() < 13 || (data.len() - 13) % 6 != 0 {
            warn!("WRITE - wrong size ({}/13+N*6)", data.len());
            return 0;
        }
        data.get_u8()
    } else {
        if data.len() < 12 || (data.len() - 12) % 6 != 0 {
            warn!("WRITE - wrong size ({}/12+N*6)", data.len());
            return 0;
        }
        0
    };
    let chunkid = data.get_u64();
    let version = data.get_u32();
    let nop = (protover != 0).then(|| ctx.keepalive.handle(writer.clone()));

    let mut downstream = None;
    if !data.is_empty() {
        let mut hop = data;
        let fwd_ip = Ipv4Addr::from(hop.get_u32());
        let fwd_port = hop.get_u16();
        let tail = hop; // chain with the first hop stripped

        if let Some(nop) = &nop {
            ctx.keepalive.register(nop);
        }
        let mut connected = None;
        for attempt in 0..CONNECT_RETRIES {
            let mut candidate = if attempt == 0 {
                ctx.conncache.get(fwd_ip, fwd_port).await
            } else {
                None
            };
            if candidate.is_none() {
                candidate = connect_downstream(fwd_ip, fwd_port, connect_timeout(attempt)).await;
            }
            let Some(conn) = candidate else { continue };

            let mut init = Vec::with_capacity(payload.len() - 6);
            if protover != 0 {
                init.push(protover);
            }
            init.extend_from_slice(&chunkid.to_be_bytes());
            init.extend_from_slice(&version.to_be_bytes());
            init.extend_from_slice(tail);
            match conn
                .writer
                .send_frame(msg::CLTOCS_WRITE, &init, SERV_TIMEOUT)
                .await
            {
                Ok(()) => {
                    ctx.stats.add_out(8 + init.len() as u64);
                    connected = Some(conn);
                    break;
                }
                Err(err) => info!("send(write init) failed: {err}"),
            }
        }
        let Some(conn) = connected else {
            if let Some(nop) = &nop {
                ctx.keepalive.deregister(nop);
            }
            return send_write_status(ctx, writer, chunkid, 0, status::CANT_CONNECT).await;
        };
        downstream = Some((fwd_ip, fwd_port, conn));
    }

    let fwd_nop = match (&downstream, protover != 0) {
        (Some((_, _, conn)), true) => {
            let handle = ctx.keepalive.handle(conn.writer.clone());
            ctx.keepalive.register(&handle);
            Some(handle)
        }
        _ => None,
    };

    let open_res = {
        let store = ctx.store.clone();
        blocking_chunk(move || store.open(chunkid, version)).await
    };
    if let Err(err) = open_res {
        if let Some(nop) = &nop {
            ctx.keepalive.deregister(nop);
        }
        if let Some(fwd_nop) = &fwd_nop {
            ctx.keepalive.deregister(fwd_nop);
        }
        // the downstream socket (if any) closes on drop
        return send_write_status(ctx, writer, chunkid, 0, err.0).await;
    }

    let ret = match downstream {
        Some((fwd_ip, fwd_port, mut conn)) => {
            let ret = write_middle(
                ctx,
                reader,
                writer,
                nop.as_ref(),
                &mut conn,
                fwd_nop.as_ref(),
                chunkid,
                version,
            )
            .await;
            if let Some(fwd_nop) = &fwd_nop {
                ctx.keepalive.deregister(fwd_nop);
            }
            if ret >= 2 && protover != 0 {
                ctx.conncache.insert(fwd_ip, fwd_port, conn).await;
            }
            ret
        }
        None => write_last(ctx, reader, writer, nop.as_ref(), chunkid, version).await,
    };

    close_chunk(ctx, chunkid).await;
    if let Some(nop) = &nop {
        ctx.keepalive.deregister(nop);
    }
    ctx.stats
        .write_ops
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    ret
}

struct WriteJob {
    chunkid: u64,
    writeid: u32,
    blocknum: u16,
    offset: u16,
    size: u32,
    crc: u32,
    data: Bytes,
    hdd_status: u8,
    net_status: u8,
    hdd_ack: bool,
    net_ack: bool,
}

/// Pending writes plus the two trailing cursors. The queue front is the
/// oldest not-fully-acknowledged write; `hdd_pos`/`net_pos` index the oldest
/// write still awaiting its disk / downstream acknowledgement.
#[derive(Default)]
struct WriteChain {
    jobs: VecDeque<WriteJob>,
    hdd_pos: usize,
    net_pos: usize,
    term: bool,
}

type ChainShared = Arc<(Mutex<WriteChain>, Condvar)>;

fn disk_writer_loop(
    chain: ChainShared,
    store: Arc<dyn ChunkStore>,
    chunkid: u64,
    version: u32,
    pipe: mpsc::UnboundedSender<()>,
) {
    let (lock, cond) = &*chain;
    loop {
        let (blocknum, offset, size, crc, data) = {
            let mut guard = lock.lock().unwrap();
            loop {
                if guard.term {
                    return;
                }
                if guard.hdd_pos < guard.jobs.len() {
                    break;
                }
                guard = cond.wait(guard).unwrap();
            }
            let job = &guard.jobs[guard.hdd_pos];
            (job.blocknum, job.offset, job.size, job.crc, job.data.clone())
        };
        let result = store.write_block(chunkid, version, blocknum, offset, size, crc, &data);
        let status = match result {
            Ok(()) => status::OK,
            Err(err) => err.0,
        };
        {
            let mut guard = lock.lock().unwrap();
            let pos = guard.hdd_pos;
            if let Some(job) = guard.jobs.get_mut(pos) {
                job.hdd_status = status;
                job.hdd_ack = true;
            }
            guard.hdd_pos += 1;
        }
        let _ = pipe.send(());
        if status != status::OK {
            return;
        }
    }
}

enum Drained {
    Idle,
    Acked { chunkid: u64, writeid: u32 },
    Failed(u8),
}

fn pop_acked(lock: &Mutex<WriteChain>) -> Drained {
    let mut guard = lock.lock().unwrap();
    let Some(job) = guard.jobs.front() else {
        return Drained::Idle;
    };
    let failed = if job.hdd_ack && job.hdd_status != status::OK {
        Some(job.hdd_status)
    } else if job.net_ack && job.net_status != status::OK {
        Some(job.net_status)
    } else if !(job.hdd_ack && job.net_ack) {
        return Drained::Idle;
    } else {
        None
    };
    let job = guard.jobs.pop_front().unwrap();
    guard.hdd_pos = guard.hdd_pos.saturating_sub(1);
    guard.net_pos = guard.net_pos.saturating_sub(1);
    match failed {
        Some(status) => Drained::Failed(status),
        None => Drained::Acked {
            chunkid: job.chunkid,
            writeid: job.writeid,
        },
    }
}

enum Event {
    Up(usize),
    UpGone,
    Fwd(usize),
    FwdGone,
    DiskDone,
}

#[allow(clippy::too_many_arguments)]
async fn write_middle(
    ctx: &ServeCtx,
    up_reader: &mut BoxReader,
    up_writer: &SharedWriter,
    up_nop: Option<&NopHandle>,
    fwd: &mut CachedConn,
    fwd_nop: Option<&NopHandle>,
    gchunkid: u64,
    gversion: u32,
) -> u8 {
    let chain: ChainShared = Arc::new((Mutex::new(WriteChain::default()), Condvar::new()));
    let (pipe_tx, mut pipe_rx) = mpsc::unbounded_channel();
    // hold one sender locally so the pipe never reads as closed when the
    // disk writer exits early on a write error
    let _pipe_main = pipe_tx.clone();
    let disk = {
        let chain = chain.clone();
        let store = ctx.store.clone();
        tokio::task::spawn_blocking(move || {
            disk_writer_loop(chain, store, gchunkid, gversion, pipe_tx)
        })
    };

    let mut gotlast = 0u8;
    let mut up_hdr = [0u8; 8];
    let mut up_have = 0usize;
    let mut fwd_hdr = [0u8; 8];
    let mut fwd_have = 0usize;

    'main: loop {
        let event = tokio::select! {
            read = up_reader.read(&mut up_hdr[up_have..]) => match read {
                Ok(0) => Event::UpGone,
                Ok(n) => Event::Up(n),
                Err(err) => {
                    info!("write_middle: receive from upstream failed: {err}");
                    Event::UpGone
                }
            },
            read = fwd.reader.read(&mut fwd_hdr[fwd_have..]) => match read {
                Ok(0) => Event::FwdGone,
                Ok(n) => Event::Fwd(n),
                Err(err) => {
                    info!("write_middle: receive from downstream failed: {err}");
                    Event::FwdGone
                }
            },
            _ = pipe_rx.recv() => Event::DiskDone,
        };

        match event {
            Event::UpGone => break 'main,
            Event::FwdGone => {
                if let Some(nop) = up_nop {
                    ctx.keepalive.deregister(nop);
                }
                send_write_status(ctx, up_writer, gchunkid, 0, status::DISCONNECTED).await;
                break 'main;
            }
            Event::Up(n) => {
                up_have += n;
                if up_have < 8 {
                    continue;
                }
                up_have = 0;
                ctx.stats.add_in(8);
                let mut hdr = &up_hdr[..];
                let cmd = hdr.get_u32();
                let leng = hdr.get_u32();
                if let Some(nop) = fwd_nop {
                    ctx.keepalive.deregister(nop);
                }
                let mut small = [0u8; SMALL_PACKET_SIZE as usize];
                let mut job_payload = BytesMut::new();
                if cmd == msg::CLTOCS_WRITE_DATA {
                    if leng == 0 {
                        break 'main;
                    }
                    if leng > DATA_MAX_PACKET_SIZE {
                        warn!("packet too long ({leng}/{DATA_MAX_PACKET_SIZE}) ; command:{cmd}");
                        break 'main;
                    }
                    // forward the frame downstream while collecting the
                    // payload for the local disk write
                    if fwd
                        .writer
                        .write_all_timeout(&up_hdr, SERV_TIMEOUT)
                        .await
                        .is_err()
                    {
                        info!("write_middle: forward(write data) timed out");
                        break 'main;
                    }
                    job_payload.reserve(leng as usize);
                    let mut remaining = leng as usize;
                    let mut chunk = [0u8; 16384];
                    while remaining > 0 {
                        let want = remaining.min(chunk.len());
                        let got = match tokio::time::timeout(
                            SERV_TIMEOUT,
                            up_reader.read(&mut chunk[..want]),
                        )
                        .await
                        {
                            Ok(Ok(0)) | Err(_) => {
                                info!("write_middle: receive(write data) timed out");
                                break 'main;
                            }
                            Ok(Ok(n)) => n,
                            Ok(Err(err)) => {
                                info!("write_middle: receive(write data) failed: {err}");
                                break 'main;
                            }
                        };
                        if fwd
                            .writer
                            .write_all_timeout(&chunk[..got], SERV_TIMEOUT)
                            .await
                            .is_err()
                        {
                            info!("write_middle: forward(write data) timed out");
                            break 'main;
                        }
                        job_payload.extend_from_slice(&chunk[..got]);
                        remaining -= got;
                    }
                    ctx.stats.add_in(leng as u64);
                    ctx.stats.add_out(8 + leng as u64);
                } else if leng > 0 {
                    if leng > SMALL_PACKET_SIZE {
                        warn!("packet too long ({leng}/{SMALL_PACKET_SIZE}) ; command:{cmd}");
                        break 'main;
                    }
                    if read_exact_timeout(up_reader, &mut small[..leng as usize], SERV_TIMEOUT)
                        .await
                        .is_err()
                    {
                        info!("write_middle: receive({}) timed out", msg::type_name(cmd));
                        break 'main;
                    }
                    let mut frame = Vec::with_capacity(8 + leng as usize);
                    frame.extend_from_slice(&up_hdr);
                    frame.extend_from_slice(&small[..leng as usize]);
                    if fwd
                        .writer
                        .write_all_timeout(&frame, SERV_TIMEOUT)
                        .await
                        .is_err()
                    {
                        info!("write_middle: forward({}) timed out", msg::type_name(cmd));
                        break 'main;
                    }
                    ctx.stats.add_in(leng as u64);
                    ctx.stats.add_out(8 + leng as u64);
                } else {
                    if fwd
                        .writer
                        .write_all_timeout(&up_hdr, SERV_TIMEOUT)
                        .await
                        .is_err()
                    {
                        info!("write_middle: send({}) timed out", msg::type_name(cmd));
                        break 'main;
                    }
                    ctx.stats.add_out(8);
                }
                if let Some(nop) = fwd_nop {
                    ctx.keepalive.register(nop);
                }

                if cmd == msg::CLTOCS_WRITE_FINISH {
                    if leng < 12 {
                        warn!("WRITE_FINISH - wrong size ({leng}/12)");
                        break 'main;
                    }
                    let mut parse = &small[..12];
                    let fin_chunkid = parse.get_u64();
                    let fin_version = parse.get_u32();
                    if fin_chunkid != gchunkid || fin_version != gversion {
                        if let Some(nop) = up_nop {
                            ctx.keepalive.deregister(nop);
                        }
                        send_write_status(ctx, up_writer, gchunkid, 0, status::WRONG_CHUNK_ID)
                            .await;
                        break 'main;
                    }
                    gotlast = if chain.0.lock().unwrap().jobs.is_empty() {
                        2
                    } else {
                        1
                    };
                    break 'main;
                } else if cmd == msg::CLTOCS_WRITE_DATA {
                    if leng < 24 {
                        warn!("WRITE_DATA - wrong size ({leng}/24+size)");
                        break 'main;
                    }
                    let payload = job_payload.freeze();
                    let mut parse = payload.as_ref();
                    let job_chunkid = parse.get_u64();
                    let writeid = parse.get_u32();
                    let blocknum = parse.get_u16();
                    let offset = parse.get_u16();
                    let size = parse.get_u32();
                    let crc = parse.get_u32();
                    if leng != 24 + size {
                        warn!("WRITE_DATA - wrong size ({leng}/24+{size})");
                        break 'main;
                    }
                    if job_chunkid != gchunkid {
                        if let Some(nop) = up_nop {
                            ctx.keepalive.deregister(nop);
                        }
                        send_write_status(ctx, up_writer, gchunkid, 0, status::WRONG_CHUNK_ID)
                            .await;
                        break 'main;
                    }
                    let job = WriteJob {
                        chunkid: job_chunkid,
                        writeid,
                        blocknum,
                        offset,
                        size,
                        crc,
                        data: payload.slice(24..),
                        hdd_status: status::PENDING,
                        net_status: status::PENDING,
                        hdd_ack: false,
                        net_ack: false,
                    };
                    let mut guard = chain.0.lock().unwrap();
                    guard.jobs.push_back(job);
                    chain.1.notify_one();
                } else if cmd != msg::ANTOAN_NOP {
                    warn!("received unrecognized packet !!!");
                    break 'main;
                }
            }
            Event::Fwd(n) => {
                fwd_have += n;
                if fwd_have < 8 {
                    continue;
                }
                fwd_have = 0;
                let mut hdr = &fwd_hdr[..];
                let cmd = hdr.get_u32();
                let leng = hdr.get_u32();
                if leng > DATA_MAX_PACKET_SIZE {
                    warn!("packet too long ({leng}/{DATA_MAX_PACKET_SIZE}) ; command:{cmd}");
                    break 'main;
                }
                let mut payload = vec![0u8; leng as usize];
                if leng > 0 {
                    if read_exact_timeout(&mut fwd.reader, &mut payload, SERV_TIMEOUT)
                        .await
                        .is_err()
                    {
                        info!("write_middle: receive({}) timed out", msg::type_name(cmd));
                        break 'main;
                    }
                }
                if cmd == msg::CSTOCL_WRITE_STATUS {
                    if leng != 13 {
                        warn!("WRITE_STATUS - wrong size ({leng}/13)");
                        break 'main;
                    }
                    let mut parse = payload.as_slice();
                    let ack_chunkid = parse.get_u64();
                    let writeid = parse.get_u32();
                    let ack_status = parse.get_u8();
                    let mut guard = chain.0.lock().unwrap();
                    if writeid == 0 {
                        // pre-data status from further down the chain;
                        // surfaces through the normal completion path
                        guard.jobs.push_front(WriteJob {
                            chunkid: ack_chunkid,
                            writeid: 0,
                            blocknum: 0,
                            offset: 0,
                            size: 0,
                            crc: 0,
                            data: Bytes::new(),
                            hdd_status: status::OK,
                            net_status: ack_status,
                            hdd_ack: true,
                            net_ack: true,
                        });
                        guard.hdd_pos += 1;
                        guard.net_pos += 1;
                    } else {
                        let pos = guard.net_pos;
                        let Some(job) = guard.jobs.get_mut(pos) else {
                            break 'main;
                        };
                        if job.chunkid != ack_chunkid || job.writeid != writeid {
                            break 'main;
                        }
                        job.net_status = ack_status;
                        job.net_ack = true;
                        guard.net_pos += 1;
                    }
                }
            }
            Event::DiskDone => {}
        }

        // acknowledge every fully-confirmed write, oldest first
        let mut fail_status = status::OK;
        loop {
            match pop_acked(&chain.0) {
                Drained::Idle => break,
                Drained::Failed(status) => {
                    fail_status = status;
                    break;
                }
                Drained::Acked { chunkid, writeid } => {
                    if let Some(nop) = up_nop {
                        ctx.keepalive.deregister(nop);
                    }
                    let sent = send_write_status(ctx, up_writer, chunkid, writeid, status::OK).await;
                    if let Some(nop) = up_nop {
                        ctx.keepalive.register(nop);
                    }
                    if sent == 0 {
                        fail_status = status::DISCONNECTED;
                        break;
                    }
                }
            }
        }
        if up_nop.is_some_and(|n| n.error()) || fwd_nop.is_some_and(|n| n.error()) {
            fail_status = status::DISCONNECTED;
        }
        if fail_status != status::OK {
            break 'main;
        }
    }

    {
        let mut guard = chain.0.lock().unwrap();
        guard.term = true;
        chain.1.notify_all();
    }
    let _ = disk.await;
    gotlast
}

async fn write_last(
    ctx: &ServeCtx,
    reader: &mut BoxReader,
    writer: &SharedWriter,
    up_nop: Option<&NopHandle>,
    gchunkid: u64,
    gversion: u32,
) -> u8 {
    if send_write_status(ctx, writer, gchunkid, 0, status::OK).await == 0 {
        return 0;
    }
    if let Some(nop) = up_nop {
        ctx.keepalive.register(nop);
    }

    let mut hdr = [0u8; 8];
    let mut last_writeid = 0u32;
    let mut terminal = false;
    let mut final_status = status::OK;
    loop {
        if read_exact_timeout(reader, &mut hdr, SERV_TIMEOUT).await.is_err() {
            info!("write_last: receive(header) timed out");
            break;
        }
        let mut parse = &hdr[..];
        let cmd = parse.get_u32();
        let leng = parse.get_u32();
        if leng > DATA_MAX_PACKET_SIZE {
            warn!("packet too long ({leng}/{DATA_MAX_PACKET_SIZE}) ; command:{cmd}");
            break;
        }
        let mut payload = vec![0u8; leng as usize];
        if leng > 0 {
            if read_exact_timeout(reader, &mut payload, SERV_TIMEOUT)
                .await
                .is_err()
            {
                info!("write_last: receive({}) timed out", msg::type_name(cmd));
                break;
            }
        }
        ctx.stats.add_in(8 + leng as u64);

        if cmd == msg::CLTOCS_WRITE_FINISH {
            if leng < 12 {
                warn!("WRITE_FINISH - wrong size ({leng}/12)");
                break;
            }
            let mut parse = payload.as_slice();
            let fin_chunkid = parse.get_u64();
            let fin_version = parse.get_u32();
            terminal = true;
            final_status = if fin_chunkid != gchunkid || fin_version != gversion {
                status::WRONG_CHUNK_ID
            } else {
                status::OK
            };
            break;
        }
        if cmd == msg::CLTOCS_WRITE_DATA {
            if leng < 24 {
                warn!("WRITE_DATA - wrong size ({leng}/24+size)");
                break;
            }
            let mut parse = payload.as_slice();
            let data_chunkid = parse.get_u64();
            let writeid = parse.get_u32();
            let blocknum = parse.get_u16();
            let offset = parse.get_u16();
            let size = parse.get_u32();
            let crc = parse.get_u32();
            last_writeid = writeid;
            if leng != 24 + size {
                warn!("WRITE_DATA - wrong size ({leng}/24+{size})");
                break;
            }
            if data_chunkid != gchunkid {
                terminal = true;
                final_status = status::WRONG_CHUNK_ID;
                break;
            }
            let write_res = {
                let store = ctx.store.clone();
                let data = Bytes::copy_from_slice(&payload[24..]);
                blocking_chunk(move || {
                    store.write_block(gchunkid, gversion, blocknum, offset, size, crc, &data)
                })
                .await
            };
            if let Err(err) = write_res {
                terminal = true;
                final_status = err.0;
                break;
            }
            if let Some(nop) = up_nop {
                ctx.keepalive.deregister(nop);
            }
            let sent = send_write_status(ctx, writer, data_chunkid, writeid, status::OK).await;
            if let Some(nop) = up_nop {
                ctx.keepalive.register(nop);
            }
            if sent == 0 {
                break;
            }
        }
        // NOPs and anything else fall through to the next header
    }

    if !terminal {
        return 0;
    }
    if final_status == status::OK {
        1
    } else {
        if let Some(nop) = up_nop {
            ctx.keepalive.deregister(nop);
        }
        send_write_status(ctx, writer, gchunkid, last_writeid, final_status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serve::ServeCtx;
    use crate::testutil::{test_ctx, MemStore};
    use bytes::BufMut;
    use futures::{SinkExt, StreamExt};
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    use chunkd_proto::{Frame, FrameCodec};

    fn write_init(chunkid: u64, version: u32, chain: &[(Ipv4Addr, u16)]) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u8(1); // proto with keepalive
        body.put_u64(chunkid);
        body.put_u32(version);
        for (ip, port) in chain {
            body.put_u32(u32::from(*ip));
            body.put_u16(*port);
        }
        body.freeze()
    }

    fn write_data(chunkid: u64, writeid: u32, blocknum: u16, offset: u16, data: &[u8]) -> Frame {
        let mut body = BytesMut::new();
        body.put_u64(chunkid);
        body.put_u32(writeid);
        body.put_u16(blocknum);
        body.put_u16(offset);
        body.put_u32(data.len() as u32);
        body.put_u32(crc32fast::hash(data));
        body.extend_from_slice(data);
        Frame::new(msg::CLTOCS_WRITE_DATA, body.freeze())
    }

    fn write_finish(chunkid: u64, version: u32) -> Frame {
        let mut body = BytesMut::new();
        body.put_u64(chunkid);
        body.put_u32(version);
        Frame::new(msg::CLTOCS_WRITE_FINISH, body.freeze())
    }

    fn parse_status(frame: &Frame) -> (u64, u32, u8) {
        assert_eq!(frame.ftype, msg::CSTOCL_WRITE_STATUS);
        let mut data = frame.data.as_ref();
        (data.get_u64(), data.get_u32(), data.get_u8())
    }

    /// Spawns the pipeline on the far end of a duplex pair; the returned
    /// framed handle plays the client.
    fn start_pipeline(
        ctx: Arc<ServeCtx>,
        payload: Bytes,
    ) -> (
        Framed<tokio::io::DuplexStream, FrameCodec>,
        tokio::task::JoinHandle<u8>,
    ) {
        let (client, server) = tokio::io::duplex(1 << 20);
        let (srv_rd, srv_wr) = tokio::io::split(server);
        let pipeline = tokio::spawn(async move {
            let mut reader: BoxReader = Box::new(srv_rd);
            let writer = SharedWriter::new(srv_wr);
            serve_write(&ctx, &mut reader, &writer, payload).await
        });
        (Framed::new(client, FrameCodec::data()), pipeline)
    }

    async fn recv_frame<S: AsyncRead + AsyncWrite + Unpin>(
        framed: &mut Framed<S, FrameCodec>,
    ) -> Frame {
        loop {
            let frame = framed.next().await.unwrap().unwrap();
            if !frame.is_nop() {
                return frame;
            }
        }
    }

    /// A downstream peer that behaves like a last-in-chain chunkserver:
    /// immediate writeid-0 acknowledgement, one OK per data frame, dies
    /// after `fail_after` acknowledgements when set.
    async fn downstream_peer(listener: TcpListener, fail_after: Option<u32>) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::data());
        let init = recv_frame(&mut framed).await;
        assert_eq!(init.ftype, msg::CLTOCS_WRITE);
        let mut data = init.data.as_ref();
        let _proto = data.get_u8();
        let chunkid = data.get_u64();
        let mut acked = 0u32;

        let mut body = BytesMut::new();
        body.put_u64(chunkid);
        body.put_u32(0);
        body.put_u8(status::OK);
        framed
            .send(Frame::new(msg::CSTOCL_WRITE_STATUS, body.freeze()))
            .await
            .unwrap();

        while let Some(Ok(frame)) = framed.next().await {
            match frame.ftype {
                msg::CLTOCS_WRITE_DATA => {
                    if fail_after == Some(acked) {
                        // swallow this frame and die mid-chain
                        return;
                    }
                    let mut data = frame.data.as_ref();
                    let chunkid = data.get_u64();
                    let writeid = data.get_u32();
                    let mut body = BytesMut::new();
                    body.put_u64(chunkid);
                    body.put_u32(writeid);
                    body.put_u8(status::OK);
                    framed
                        .send(Frame::new(msg::CSTOCL_WRITE_STATUS, body.freeze()))
                        .await
                        .unwrap();
                    acked += 1;
                }
                msg::CLTOCS_WRITE_FINISH => {}
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn chain_write_happy_path_recycles_downstream() {
        let store = Arc::new(MemStore::new());
        store.add_chunk(11, 1);
        let ctx = test_ctx(store.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(downstream_peer(listener, None));

        let peer_ip = match peer_addr.ip() {
            std::net::IpAddr::V4(ip) => ip,
            _ => unreachable!(),
        };
        let payload = write_init(11, 1, &[(peer_ip, peer_addr.port())]);
        let (mut client, pipeline) = start_pipeline(ctx.clone(), payload);

        // chain-established acknowledgement propagated from downstream
        assert_eq!(parse_status(&recv_frame(&mut client).await), (11, 0, status::OK));

        for writeid in 1..=3u32 {
            let data = vec![writeid as u8; 64];
            client
                .send(write_data(11, writeid, 0, (writeid as u16 - 1) * 64, &data))
                .await
                .unwrap();
            assert_eq!(
                parse_status(&recv_frame(&mut client).await),
                (11, writeid, status::OK)
            );
        }
        client.send(write_finish(11, 1)).await.unwrap();

        let ret = pipeline.await.unwrap();
        assert_eq!(ret, 2);
        // downstream socket went back to the cache for the next chain write
        assert!(ctx
            .conncache
            .get(peer_ip, peer_addr.port())
            .await
            .is_some());
        // all three writes landed locally
        let block = store.block(11, 0).unwrap();
        assert_eq!(&block[0..64], &[1u8; 64][..]);
        assert_eq!(&block[64..128], &[2u8; 64][..]);
        assert_eq!(&block[128..192], &[3u8; 64][..]);
        peer.abort();
    }

    #[tokio::test]
    async fn chain_write_downstream_failure_reports_disconnect() {
        let store = Arc::new(MemStore::new());
        store.add_chunk(12, 1);
        let ctx = test_ctx(store);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = listener.local_addr().unwrap();
        let peer_ip = match peer_addr.ip() {
            std::net::IpAddr::V4(ip) => ip,
            _ => unreachable!(),
        };
        let peer = tokio::spawn(downstream_peer(listener, Some(2)));

        let payload = write_init(12, 1, &[(peer_ip, peer_addr.port())]);
        let (mut client, pipeline) = start_pipeline(ctx.clone(), payload);

        assert_eq!(parse_status(&recv_frame(&mut client).await), (12, 0, status::OK));
        for writeid in 1..=3u32 {
            let data = vec![writeid as u8; 32];
            client
                .send(write_data(12, writeid, 0, 0, &data))
                .await
                .unwrap();
        }
        // acknowledged writes drain in order, then the dead downstream
        // surfaces as a terminal writeid-0 disconnect
        assert_eq!(
            parse_status(&recv_frame(&mut client).await),
            (12, 1, status::OK)
        );
        assert_eq!(
            parse_status(&recv_frame(&mut client).await),
            (12, 2, status::OK)
        );
        assert_eq!(
            parse_status(&recv_frame(&mut client).await),
            (12, 0, status::DISCONNECTED)
        );
        let ret = pipeline.await.unwrap();
        assert_eq!(ret, 0);
        assert!(ctx.conncache.get(peer_ip, peer_addr.port()).await.is_none());
        peer.abort();
    }

    #[tokio::test]
    async fn last_in_chain_acknowledges_and_finishes() {
        let store = Arc::new(MemStore::new());
        store.add_chunk(13, 7);
        let ctx = test_ctx(store.clone());

        let payload = write_init(13, 7, &[]);
        let (mut client, pipeline) = start_pipeline(ctx, payload);

        assert_eq!(parse_status(&recv_frame(&mut client).await), (13, 0, status::OK));
        let data = [0x5A; 512];
        client.send(write_data(13, 1, 2, 0, &data)).await.unwrap();
        assert_eq!(parse_status(&recv_frame(&mut client).await), (13, 1, status::OK));
        client.send(write_finish(13, 7)).await.unwrap();

        assert_eq!(pipeline.await.unwrap(), 1);
        assert_eq!(&store.block(13, 2).unwrap()[..512], &data[..]);
    }

    #[tokio::test]
    async fn last_in_chain_rejects_wrong_chunkid() {
        let store = Arc::new(MemStore::new());
        store.add_chunk(14, 1);
        let ctx = test_ctx(store);

        let payload = write_init(14, 1, &[]);
        let (mut client, pipeline) = start_pipeline(ctx, payload);
        assert_eq!(parse_status(&recv_frame(&mut client).await), (14, 0, status::OK));

        client
            .send(write_data(999, 1, 0, 0, &[1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(
            parse_status(&recv_frame(&mut client).await),
            (14, 1, status::WRONG_CHUNK_ID)
        );
        assert_eq!(pipeline.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cant_connect_is_reported_upstream() {
        let store = Arc::new(MemStore::new());
        store.add_chunk(15, 1);
        let ctx = test_ctx(store);

        // a port nobody listens on; every attempt fails fast
        let payload = write_init(15, 1, &[(Ipv4Addr::new(127, 0, 0, 1), 1)]);
        let (mut client, pipeline) = start_pipeline(ctx, payload);
        assert_eq!(
            parse_status(&recv_frame(&mut client).await),
            (15, 0, status::CANT_CONNECT)
        );
        assert_eq!(pipeline.await.unwrap(), 1);
    }

    #[test]
    fn connect_backoff_doubles_every_other_attempt() {
        let ms: Vec<u64> = (0..6).map(|i| connect_timeout(i).as_millis() as u64).collect();
        assert_eq!(ms, vec![200, 300, 400, 600, 800, 1200]);
    }
}
