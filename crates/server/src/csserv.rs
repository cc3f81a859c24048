//! Client-facing acceptor. Each connection is a small session loop: idle
//! NOP exchange, one command at a time; read/write commands move the socket
//! halves into a high-priority job and the session resumes once the pipeline
//! hands them back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use chunkd_engine::{Engine, OpKind, SubmitMode};
use chunkd_proto::{msg, status, DATA_MAX_PACKET_SIZE, NOP_FRAME};

use crate::net::{read_exact_timeout, BoxReader, SharedWriter, SERV_TIMEOUT};
use crate::serve::{send_read_status, send_write_status, ServeCtx};
use crate::JobArgs;

/// Client connections idle out after this long; NOPs go out at a third of it.
const CSSERV_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn spawn_listener(
    listener: TcpListener,
    ctx: Arc<ServeCtx>,
    engine: Arc<Engine<JobArgs>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.cancelled() => break,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {peer}");
                    let ctx = ctx.clone();
                    let engine = engine.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(client_session(stream, ctx, engine, shutdown));
                }
                Err(err) => {
                    warn!("accept error: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    })
}

async fn client_session(
    stream: tokio::net::TcpStream,
    ctx: Arc<ServeCtx>,
    engine: Arc<Engine<JobArgs>>,
    shutdown: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let (rd, wr) = stream.into_split();
    let mut reader: BoxReader = Box::new(rd);
    let mut writer = SharedWriter::new(wr);

    let mut hdr = [0u8; 8];
    let mut have = 0usize;
    let mut last_read = Instant::now();
    let mut last_write = Instant::now();
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    'conn: loop {
        // collect one 8-byte header, exchanging idle NOPs meanwhile
        while have < 8 {
            tokio::select! {
                read = reader.read(&mut hdr[have..]) => match read {
                    Ok(0) | Err(_) => break 'conn,
                    Ok(n) => {
                        have += n;
                        last_read = Instant::now();
                    }
                },
                _ = tick.tick() => {
                    if last_read.elapsed() > CSSERV_TIMEOUT {
                        debug!("client connection timed out");
                        break 'conn;
                    }
                    if last_write.elapsed() > CSSERV_TIMEOUT / 3 {
                        if writer.write_all_timeout(&NOP_FRAME, SERV_TIMEOUT).await.is_err() {
                            break 'conn;
                        }
                        last_write = Instant::now();
                    }
                },
                _ = shutdown.cancelled() => break 'conn,
            }
        }
        have = 0;

        let mut parse = &hdr[..];
        let cmd = parse.get_u32();
        let leng = parse.get_u32();
        if leng > DATA_MAX_PACKET_SIZE {
            warn!("packet too long ({leng}/{DATA_MAX_PACKET_SIZE}) ; command:{cmd}");
            break 'conn;
        }
        let mut payload = vec![0u8; leng as usize];
        if leng > 0 && read_exact_timeout(&mut reader, &mut payload, SERV_TIMEOUT).await.is_err() {
            break 'conn;
        }
        last_read = Instant::now();
        ctx.stats.add_in(8 + leng as u64);
        let payload = Bytes::from(payload);

        match cmd {
            msg::ANTOAN_NOP => {}
            msg::CLTOCS_READ | msg::CLTOCS_WRITE => {
                let op = if cmd == msg::CLTOCS_READ {
                    OpKind::ServRead
                } else {
                    OpKind::ServWrite
                };
                let (resume_tx, resume_rx) = oneshot::channel();
                let args = JobArgs::Serv {
                    reader,
                    writer,
                    payload: payload.clone(),
                    resume: resume_tx,
                };
                match engine
                    .hp()
                    .submit(op, 0, args, None, 0, SubmitMode::LimitedReturn)
                {
                    Err(JobArgs::Serv {
                        reader: rd,
                        writer: wr,
                        ..
                    }) => {
                        // queue full: the sockets come straight back unused
                        reader = rd;
                        writer = wr;
                        if !answer_not_done(&ctx, &writer, cmd, &payload).await {
                            break 'conn;
                        }
                        last_write = Instant::now();
                    }
                    Err(_) => return,
                    Ok(jobid) => {
                        let mut resume_rx = resume_rx;
                        let resumed = tokio::select! {
                            resumed = &mut resume_rx => resumed,
                            _ = shutdown.cancelled() => {
                                // cooperative cancel: a queued job returns
                                // without running, a started one finishes
                                engine.disable(jobid);
                                match resume_rx.await {
                                    Ok((_, rd, wr)) => {
                                        drop((rd, wr));
                                        return;
                                    }
                                    Err(_) => return,
                                }
                            }
                        };
                        let Ok((job_status, rd, wr)) = resumed else {
                            // pipeline died with the sockets
                            return;
                        };
                        reader = rd;
                        writer = wr;
                        if job_status == 0 {
                            break 'conn;
                        }
                        last_read = Instant::now();
                        last_write = Instant::now();
                    }
                }
            }
            other => {
                warn!("got unknown message from client (type:{other})");
                break 'conn;
            }
        }
    }
}

/// Overload answer sent inline when admission control sheds the job, shaped
/// like the pipeline's own status reply.
async fn answer_not_done(ctx: &ServeCtx, writer: &SharedWriter, cmd: u32, payload: &Bytes) -> bool {
    let mut data = payload.as_ref();
    if cmd == msg::CLTOCS_READ {
        if data.len() != 20 && data.len() != 21 {
            warn!("READ - wrong size ({}/20|21)", data.len());
            return false;
        }
        if data.len() == 21 {
            data.advance(1);
        }
        let chunkid = data.get_u64();
        send_read_status(ctx, writer, chunkid, status::NOT_DONE).await != 0
    } else {
        let odd = data.len() % 2 == 1;
        let min = if odd { 13 } else { 12 };
        if data.len() < min || (data.len() - min) % 6 != 0 {
            warn!("WRITE - wrong size ({})", data.len());
            return false;
        }
        if odd {
            data.advance(1);
        }
        let chunkid = data.get_u64();
        send_write_status(ctx, writer, chunkid, 0, status::NOT_DONE).await != 0
    }
}
