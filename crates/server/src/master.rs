//! The master connection: one long-lived framed-protocol client driving
//! registration, periodic load/space/damage reports and dispatch of
//! master-originated chunk operations onto the job engine.
//!
//! Replies to master commands are preallocated with a status placeholder and
//! stamped with the connection counter; a reply completing after a reconnect
//! is silently dropped.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chunkd_engine::{Callback, Engine, HlStatus, JobId, OpKind, SubmitMode};
use chunkd_proto::{msg, status, version_int, Frame, FrameCodec, SERVER_VERSION};

use crate::busychunks::BusyChunks;
use crate::csid::IdentityFile;
use crate::replicator::{ReplicaSource, ReplicationMode};
use crate::serve::blocking;
use crate::store::{ChunkInfo, ChunkInfoKind, ChunkStore};
use crate::JobArgs;

const MIN_MASTER_VERSION: u32 = version_int(2, 0, 0);
const VERSION_LABELS: u32 = version_int(2, 1, 0);
const VERSION_LOAD: u32 = version_int(1, 6, 28);
const VERSION_LOAD_CLASSES: u32 = version_int(3, 0, 7);
const VERSION_LSREBALANCE: u32 = version_int(3, 0, 62);
const VERSION_UNREGISTER: u32 = version_int(3, 0, 75);
const VERSION_SENDING_CHUNKS: u32 = version_int(4, 32, 0);
const VERSION_HSREBALANCE: u32 = version_int(4, 37, 0);

// per-frame report batch bounds; the master caps its inbound packet size
const LOST_CHUNK_LIMIT: u32 = 25000;
const NEW_CHUNK_LIMIT: u32 = 25000;
const CHANGED_CHUNK_LIMIT: u32 = 25000;
const NONEXISTENT_CHUNK_LIMIT: u32 = 25000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
/// Grace period for the unregister drain on shutdown.
const FORCE_DISCONNECTION_TO: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,
    pub bind_host: Option<String>,
    /// Read-idle timeout in seconds; 0 accepts the master's choice.
    pub timeout: u32,
    pub reconnection_delay: u32,
    pub chunks_per_register_packet: u32,
    pub auth_code: Option<String>,
    pub label_mask: u32,
    pub listen_ip: Ipv4Addr,
    pub listen_port: u16,
    pub data_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Free,
    Data,
    Kill,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegisterState {
    Unregistered,
    Waiting,
    InProgress,
    Registered,
}

pub(crate) enum MasterEvent {
    Reply {
        conncnt: u32,
        busy_chunkid: Option<u64>,
        frame: Frame,
    },
}

/// A reply frame built at command time, completed with the job's status.
struct PendingReply {
    ftype: u32,
    body: Vec<u8>,
    status_at: usize,
}

impl PendingReply {
    fn new(ftype: u32, body: Vec<u8>) -> Self {
        let status_at = body.len();
        let mut body = body;
        body.push(status::PENDING);
        Self {
            ftype,
            body,
            status_at,
        }
    }

    fn into_frame(mut self, status: u8) -> Frame {
        self.body[self.status_at] = status;
        Frame::new(self.ftype, self.body)
    }
}

pub struct MasterHandle {
    task: JoinHandle<()>,
}

impl MasterHandle {
    pub async fn join(self) {
        let _ = self.task.await;
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

pub fn spawn_master(
    cfg: MasterConfig,
    store: Arc<dyn ChunkStore>,
    engine: Arc<Engine<JobArgs>>,
    shutdown: CancellationToken,
) -> MasterHandle {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let hl_rx = engine.hlstatus();
    let identity = IdentityFile::load(&cfg.data_path);
    let task = MasterTask {
        cfg,
        store,
        engine,
        identity,
        busy: BusyChunks::new(),
        event_tx,
        event_rx,
        hl_rx,
        shutdown,
        conncnt: 0,
        addr: None,
        addr_valid: false,
        mode: Mode::Free,
        register_state: RegisterState::Unregistered,
        master_version: 0,
        timeout: Duration::from_secs(10),
        rnd_blob: None,
        idle_jobids: Vec::new(),
        out: Vec::new(),
        fatal: false,
        wantexit_at: None,
    };
    MasterHandle {
        task: tokio::spawn(task.run()),
    }
}

pub(crate) enum SessionEnd {
    Kill,
    Closed,
}

pub(crate) struct MasterTask {
    cfg: MasterConfig,
    store: Arc<dyn ChunkStore>,
    engine: Arc<Engine<JobArgs>>,
    identity: IdentityFile,
    busy: BusyChunks,
    event_tx: mpsc::UnboundedSender<MasterEvent>,
    event_rx: mpsc::UnboundedReceiver<MasterEvent>,
    hl_rx: watch::Receiver<HlStatus>,
    shutdown: CancellationToken,
    conncnt: u32,
    addr: Option<(Ipv4Addr, u16)>,
    addr_valid: bool,

    mode: Mode,
    register_state: RegisterState,
    master_version: u32,
    timeout: Duration,
    rnd_blob: Option<[u8; 32]>,
    idle_jobids: Vec<JobId>,
    out: Vec<Frame>,
    fatal: bool,
    wantexit_at: Option<Instant>,
}

impl MasterTask {
    async fn run(mut self) {
        use rand::Rng;
        let delay = Duration::from_secs(self.cfg.reconnection_delay.max(1) as u64);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=1000));
        let mut first = true;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let wait = if first { jitter } else { delay };
            first = false;
            let sleep = tokio::time::sleep(wait);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    _ = self.shutdown.cancelled() => return,
                    event = self.event_rx.recv() => {
                        if let Some(event) = event {
                            self.handle_event(event);
                        }
                    }
                }
            }
            let Some(stream) = self.connect().await else {
                continue;
            };
            self.run_session(stream).await;
            if self.fatal {
                self.shutdown.cancel();
                return;
            }
        }
    }

    async fn connect(&mut self) -> Option<TcpStream> {
        if !self.addr_valid {
            let host = self.cfg.host.clone();
            let port = self.cfg.port;
            let resolved = lookup_host((host.as_str(), port)).await.ok().and_then(|addrs| {
                addrs
                    .filter_map(|addr| match addr {
                        std::net::SocketAddr::V4(v4) => Some(*v4.ip()),
                        _ => None,
                    })
                    .next()
            });
            let Some(ip) = resolved else {
                warn!(
                    "master connection module: can't resolve master host/port ({}:{})",
                    self.cfg.host, self.cfg.port
                );
                return None;
            };
            if ip.octets()[0] == 127 {
                warn!("master connection module: localhost ({ip}) can't be used for connecting with master");
                return None;
            }
            self.addr = Some((ip, port));
        }
        self.addr_valid = false;
        let (ip, port) = self.addr?;

        let socket = match TcpSocket::new_v4() {
            Ok(socket) => socket,
            Err(err) => {
                warn!("master connection module: create socket error: {err}");
                return None;
            }
        };
        if let Some(bind_host) = &self.cfg.bind_host {
            let bind_ip: Ipv4Addr = match bind_host.parse() {
                Ok(ip) => ip,
                Err(_) => {
                    warn!("master connection module: can't resolve bind host ({bind_host})");
                    return None;
                }
            };
            if let Err(err) = socket.bind((bind_ip, 0).into()) {
                warn!("master connection module: can't bind socket to given ip: {err}");
                return None;
            }
        }
        match tokio::time::timeout(CONNECT_TIMEOUT, socket.connect((ip, port).into())).await {
            Ok(Ok(stream)) => {
                info!("connected to Master");
                let _ = stream.set_nodelay(true);
                Some(stream)
            }
            Ok(Err(err)) => {
                warn!("master connection module: connect failed: {err}");
                self.addr_valid = false;
                None
            }
            Err(_) => {
                warn!("connection timed out");
                self.addr_valid = false;
                None
            }
        }
    }

    /// Runs one connected session until the connection dies or shutdown
    /// drains it. Generic over the stream so tests can drive it in memory.
    pub(crate) async fn run_session<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        stream: S,
    ) -> SessionEnd {
        let mut framed = Framed::new(stream, FrameCodec::master());
        self.conncnt += 1;
        self.mode = Mode::Data;
        self.register_state = RegisterState::Unregistered;
        self.master_version = 0;
        self.rnd_blob = None;
        self.timeout = Duration::from_secs(if self.cfg.timeout > 0 {
            self.cfg.timeout as u64
        } else {
            10
        });
        let mut last_read = Instant::now();
        let mut last_write = Instant::now();

        self.send_register().await;

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let end = 'session: loop {
            // flush queued frames
            if !self.out.is_empty() && self.mode != Mode::Kill {
                for frame in self.out.drain(..) {
                    if let Err(err) = framed.feed(frame).await {
                        warn!("write to Master error: {err}");
                        self.mode = Mode::Kill;
                        break;
                    }
                }
                if self.mode != Mode::Kill {
                    if let Err(err) = framed.flush().await {
                        warn!("write to Master error: {err}");
                        self.mode = Mode::Kill;
                    } else {
                        last_write = Instant::now();
                    }
                }
            }
            match self.mode {
                Mode::Kill => break 'session SessionEnd::Kill,
                Mode::Close if self.out.is_empty() => break 'session SessionEnd::Closed,
                _ => {}
            }

            tokio::select! {
                frame = framed.next() => {
                    match frame {
                        Some(Ok(frame)) => {
                            last_read = Instant::now();
                            self.handle_frame(frame).await;
                        }
                        Some(Err(err)) => {
                            warn!("read from Master error: {err}");
                            self.mode = Mode::Kill;
                        }
                        None => {
                            warn!("connection was reset by Master");
                            self.mode = Mode::Kill;
                        }
                    }
                }
                event = self.event_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event);
                    }
                }
                changed = self.hl_rx.changed() => {
                    if changed.is_ok() {
                        self.report_load().await;
                    }
                }
                _ = tick.tick() => {
                    self.report_load().await;
                    self.check_space().await;
                    self.check_reports().await;
                    if self.mode == Mode::Data && last_read.elapsed() > self.timeout {
                        warn!("masterconn: connection timed out");
                        self.mode = Mode::Kill;
                    }
                    if self.out.is_empty() && last_write.elapsed() >= Duration::from_secs(1) {
                        self.out.push(Frame::empty(msg::ANTOAN_NOP));
                    }
                    if let Some(at) = self.wantexit_at {
                        if at.elapsed() > FORCE_DISCONNECTION_TO {
                            warn!("masterconn: unregistering timed out");
                            self.mode = Mode::Kill;
                        }
                    }
                }
                _ = self.shutdown.cancelled(), if self.wantexit_at.is_none() => {
                    self.wantexit_at = Some(Instant::now());
                    if self.register_state == RegisterState::Registered
                        && self.master_version >= VERSION_UNREGISTER
                    {
                        info!("sending unregister command ...");
                        self.out.push(Frame::new(msg::CSTOMA_REGISTER, vec![msg::REGISTER_BYE]));
                        self.mode = Mode::Close;
                    } else {
                        info!("killing master connection");
                        self.mode = Mode::Kill;
                    }
                }
            }
        };

        info!("closing connection with master");
        for jobid in self.idle_jobids.drain(..) {
            self.engine.disable(jobid);
        }
        if self.register_state == RegisterState::InProgress {
            let store = self.store.clone();
            let _ = blocking(move || store.chunks_end()).await;
        }
        if self.register_state == RegisterState::Unregistered
            && matches!(end, SessionEnd::Kill)
        {
            // always re-resolve the master address after a failed register
            self.addr_valid = false;
        }
        self.out.clear();
        self.mode = Mode::Free;
        end
    }

    fn handle_event(&mut self, event: MasterEvent) {
        match event {
            MasterEvent::Reply {
                conncnt,
                busy_chunkid,
                frame,
            } => {
                if let Some(chunkid) = busy_chunkid {
                    self.busy.end(chunkid);
                }
                if conncnt == self.conncnt && self.mode == Mode::Data {
                    self.out.push(frame);
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        let data = frame.data;
        match frame.ftype {
            msg::ANTOAN_NOP | msg::ANTOAN_UNKNOWN_COMMAND | msg::ANTOAN_BAD_COMMAND_SIZE => {}
            msg::ANTOAN_FORCE_TIMEOUT => self.force_timeout(&data),
            msg::MATOCS_MASTER_ACK => {
                self.addr_valid = true;
                self.master_ack(&data).await;
            }
            msg::MATOCS_REGISTER_FIRST => self.register_first(&data).await,
            msg::MATOCS_CHUNK_STATUS => self.chunk_status(&data).await,
            msg::MATOCS_CREATE => self.cmd_create(&data),
            msg::MATOCS_DELETE => self.cmd_delete(&data),
            msg::MATOCS_SET_VERSION => self.cmd_set_version(&data),
            msg::MATOCS_DUPLICATE => self.cmd_duplicate(&data),
            msg::MATOCS_TRUNCATE => self.cmd_truncate(&data),
            msg::MATOCS_DUPTRUNC => self.cmd_duptrunc(&data),
            msg::MATOCS_LOCALSPLIT => self.cmd_localsplit(&data),
            msg::MATOCS_CHUNKOP => self.cmd_chunkop(&data),
            msg::MATOCS_REPLICATE => self.cmd_replicate(&data),
            msg::MATOCS_REPLICATE_SPLIT => self.cmd_replicate_split(&data),
            msg::MATOCS_REPLICATE_RECOVER => self.cmd_replicate_recover(&data),
            msg::MATOCS_REPLICATE_JOIN => self.cmd_replicate_join(&data),
            msg::ANTOCS_GET_CHUNK_BLOCKS => self.idle_chunk_info(&data, ChunkInfoKind::Blocks),
            msg::ANTOCS_GET_CHUNK_CHECKSUM => self.idle_chunk_info(&data, ChunkInfoKind::Checksum),
            msg::ANTOCS_GET_CHUNK_CHECKSUM_TAB => {
                self.idle_chunk_info(&data, ChunkInfoKind::ChecksumTab)
            }
            other => {
                warn!("got unknown message (type:{other})");
                self.mode = Mode::Kill;
            }
        }
    }

    fn fatal(&mut self, message: &str) {
        error!("{message}");
        // no further register attempts make sense; the process must stop
        self.register_state = RegisterState::Registered;
        self.mode = Mode::Kill;
        self.fatal = true;
    }

    async fn send_register(&mut self) {
        let store = self.store.clone();
        let space = blocking(move || store.space()).await.unwrap_or_default();
        let digest = match (&self.rnd_blob, &self.cfg.auth_code) {
            (Some(blob), Some(code)) => {
                let mut input = Vec::with_capacity(32 + code.len());
                input.extend_from_slice(&blob[..16]);
                input.extend_from_slice(code.as_bytes());
                input.extend_from_slice(&blob[16..]);
                Some(md5::compute(input).0)
            }
            _ => None,
        };
        let mut body = Vec::with_capacity(1 + 16 + 4 + 4 + 2 + 2 + 2 + 8 + 8 + 4 + 8 + 8 + 4);
        body.put_u8(msg::REGISTER_BASE);
        if let Some(digest) = digest {
            body.extend_from_slice(&digest);
        }
        body.put_u32(SERVER_VERSION);
        body.put_u32(u32::from(self.cfg.listen_ip));
        body.put_u16(self.cfg.listen_port);
        body.put_u16(self.cfg.timeout as u16);
        body.put_u16(self.identity.csid());
        body.put_u64(space.used);
        body.put_u64(space.total);
        body.put_u32(space.chunks);
        body.put_u64(space.td_used);
        body.put_u64(space.td_total);
        body.put_u32(space.td_chunks);
        self.out.push(Frame::new(msg::CSTOMA_REGISTER, body));
    }

    fn send_labels(&mut self) {
        let mut body = Vec::with_capacity(4);
        body.put_u32(self.cfg.label_mask);
        self.out.push(Frame::new(msg::CSTOMA_LABELS, body));
    }

    async fn send_next_chunks(&mut self) {
        let store = self.store.clone();
        let limit = self.cfg.chunks_per_register_packet;
        let batch = blocking(move || store.chunks_next(limit)).await.unwrap_or_default();
        if batch.is_empty() {
            let store = self.store.clone();
            let _ = blocking(move || store.chunks_end()).await;
            self.out
                .push(Frame::new(msg::CSTOMA_REGISTER, vec![msg::REGISTER_DONE]));
            self.register_state = RegisterState::Registered;
        } else {
            let mut body = Vec::with_capacity(1 + batch.len() * 12);
            body.put_u8(msg::REGISTER_CHUNKS);
            for (chunkid, version) in batch {
                body.put_u64(chunkid);
                body.put_u32(version);
            }
            self.out.push(Frame::new(msg::CSTOMA_REGISTER, body));
        }
    }

    async fn master_ack(&mut self, data: &[u8]) {
        let length = data.len();
        if ![1, 5, 7, 9, 15, 17, 33].contains(&length) {
            warn!("MASTER_ACK - wrong size ({length}/1|5|7|9|15|17|33)");
            self.mode = Mode::Kill;
            return;
        }
        let mut data = data;
        let atype = data.get_u8();
        if atype == 0 {
            let mut csid = 0u16;
            let mut meta_id = 0u64;
            if length >= 5 {
                self.master_version = data.get_u32();
            }
            if length >= 9 {
                let master_timeout = data.get_u16();
                if self.cfg.timeout == 0 && master_timeout > 0 {
                    self.timeout = Duration::from_secs(master_timeout as u64);
                }
                csid = data.get_u16();
            }
            if length >= 17 {
                meta_id = data.get_u64();
                if meta_id > 0 && self.identity.meta_id() > 0 && meta_id != self.identity.meta_id()
                {
                    self.fatal(&format!(
                        "MASTER_ACK - wrong meta data id (file {}:{:016X} ; received from master:{:016X}). Can't connect to master",
                        crate::csid::IDENTITY_FILE,
                        self.identity.meta_id(),
                        meta_id
                    ));
                    return;
                }
                let hdd_meta_id = self.store.meta_id();
                if meta_id > 0
                    && self.identity.meta_id() == 0
                    && hdd_meta_id > 0
                    && meta_id != hdd_meta_id
                {
                    self.fatal(&format!(
                        "MASTER_ACK - wrong meta data id (stored:{hdd_meta_id:016X} ; received from master:{meta_id:016X}). Can't connect to master",
                    ));
                    return;
                }
            }
            if (csid > 0 || meta_id > 0) && self.identity.update(csid, meta_id) {
                let store = self.store.clone();
                let new_meta_id = self.identity.meta_id();
                let _ = blocking(move || store.set_meta_id(new_meta_id)).await;
            }
            if self.master_version < MIN_MASTER_VERSION {
                self.fatal("MASTER_ACK - unsupported master version");
                return;
            }
            if matches!(
                self.register_state,
                RegisterState::Unregistered | RegisterState::Waiting
            ) {
                let store = self.store.clone();
                let _ = blocking(move || store.chunks_begin()).await;
                self.register_state = RegisterState::InProgress;
                if self.master_version >= VERSION_LABELS {
                    self.send_labels();
                }
            }
            if self.register_state == RegisterState::InProgress {
                self.send_next_chunks().await;
            }
        } else if atype == 1 && length == 5 {
            self.addr_valid = false;
            self.mode = Mode::Close;
        } else if atype == 2 && (length == 7 || length == 15) {
            if self.register_state == RegisterState::InProgress {
                let store = self.store.clone();
                let _ = blocking(move || store.chunks_end()).await;
            }
            self.register_state = RegisterState::Waiting;
            self.master_version = data.get_u32();
            let master_timeout = data.get_u16();
            if self.cfg.timeout == 0 && master_timeout > 0 {
                self.timeout = Duration::from_secs(master_timeout as u64);
            }
            if length >= 15 {
                let meta_id = data.get_u64();
                if meta_id > 0 && self.identity.meta_id() > 0 && meta_id != self.identity.meta_id()
                {
                    warn!("MASTER_ACK - wrong meta data id. Can't connect to master");
                    self.register_state = RegisterState::Registered;
                    self.mode = Mode::Kill;
                }
            }
        } else if atype == 3 && length == 33 {
            if self.cfg.auth_code.is_none() {
                warn!("MASTER_ACK - master needs authorization, but password was not defined");
                self.register_state = RegisterState::Registered;
                self.mode = Mode::Kill;
                return;
            }
            let mut blob = [0u8; 32];
            blob.copy_from_slice(&data[..32]);
            self.rnd_blob = Some(blob);
            self.send_register().await;
        } else {
            warn!("MASTER_ACK - bad type/length: {atype}/{length}");
            self.mode = Mode::Kill;
        }
    }

    fn force_timeout(&mut self, data: &[u8]) {
        if data.len() != 2 {
            warn!("FORCE_TIMEOUT - wrong size ({}/2)", data.len());
            self.mode = Mode::Kill;
            return;
        }
        let mut data = data;
        let timeout = data.get_u16().max(10);
        self.timeout = Duration::from_secs(timeout as u64);
    }

    async fn register_first(&mut self, data: &[u8]) {
        if data.len() != 8 {
            warn!("REGISTER_FIRST - wrong size ({}/8)", data.len());
            self.mode = Mode::Kill;
            return;
        }
        let mut data = data;
        let chunkid = data.get_u64();
        if self.register_state != RegisterState::Registered {
            let store = self.store.clone();
            let _ = blocking(move || store.reg_first(chunkid)).await;
        }
    }

    async fn chunk_status(&mut self, data: &[u8]) {
        if data.len() != 8 {
            warn!("CHUNK_STATUS - wrong size ({}/8)", data.len());
            self.mode = Mode::Kill;
            return;
        }
        let mut data = data;
        let chunkid = data.get_u64();
        if self.busy.is_busy(chunkid) {
            // chunk is mid-operation; the master will ask again
            return;
        }
        let store = self.store.clone();
        let payload = blocking(move || store.chunk_status(chunkid))
            .await
            .unwrap_or_default();
        self.out.push(Frame::new(msg::CSTOMA_CHUNK_STATUS, payload));
    }

    async fn report_load(&mut self) {
        if self.mode != Mode::Data
            || self.master_version < VERSION_LOAD
            || self.register_state != RegisterState::Registered
        {
            return;
        }
        let load = self.engine.load();
        if self.master_version < VERSION_LOAD_CLASSES {
            let mut body = Vec::with_capacity(4);
            body.put_u32(load);
            self.out.push(Frame::new(msg::CSTOMA_CURRENT_LOAD, body));
            return;
        }
        let mut hlstatus = *self.hl_rx.borrow();
        let store = self.store.clone();
        let rebalance = blocking(move || store.rebalance()).await.unwrap_or_default();
        if rebalance.high_speed {
            // high speed rebalance reports as hsrebalance (works as overloaded)
            hlstatus = HlStatus::HsRebalance;
        }
        if hlstatus != HlStatus::Overloaded
            && hlstatus != HlStatus::HsRebalance
            && rebalance.low_speed
        {
            hlstatus = HlStatus::LsRebalance;
        }
        // older masters don't know the rebalance classes
        if self.master_version < VERSION_LSREBALANCE && hlstatus == HlStatus::LsRebalance {
            hlstatus = HlStatus::Overloaded;
        }
        if self.master_version < VERSION_HSREBALANCE && hlstatus == HlStatus::HsRebalance {
            hlstatus = HlStatus::Overloaded;
        }
        let sending = if self.master_version >= VERSION_SENDING_CHUNKS {
            let store = self.store.clone();
            Some(blocking(move || store.sending_chunks()).await.unwrap_or(0))
        } else {
            None
        };
        let mut body = Vec::with_capacity(6);
        body.put_u32(load);
        body.put_u8(hlstatus.as_u8());
        if let Some(sending) = sending {
            body.put_u8(sending);
        }
        self.out.push(Frame::new(msg::CSTOMA_CURRENT_LOAD, body));
    }

    async fn check_space(&mut self) {
        if self.mode != Mode::Data
            || !matches!(
                self.register_state,
                RegisterState::Registered | RegisterState::InProgress
            )
        {
            return;
        }
        let store = self.store.clone();
        let space = blocking(move || store.space_changed().then(|| store.space())).await;
        let Some(Some(space)) = space else { return };
        let mut body = Vec::with_capacity(36);
        body.put_u64(space.used);
        body.put_u64(space.total);
        body.put_u32(space.chunks);
        body.put_u64(space.td_used);
        body.put_u64(space.td_total);
        body.put_u32(space.td_chunks);
        self.out.push(Frame::new(msg::CSTOMA_SPACE, body));
    }

    async fn check_reports(&mut self) {
        if self.mode != Mode::Data || self.register_state != RegisterState::Registered {
            return;
        }
        let store = self.store.clone();
        let master_version = self.master_version;
        let reports = blocking(move || {
            let errors = store.error_counter();
            let damaged = store.damaged_chunks();
            let lost = store.lost_chunks(LOST_CHUNK_LIMIT);
            let new = store.new_chunks(NEW_CHUNK_LIMIT);
            let changed = store.changed_chunks(CHANGED_CHUNK_LIMIT);
            let nonexistent = if master_version >= VERSION_SENDING_CHUNKS {
                store.nonexistent_chunks(NONEXISTENT_CHUNK_LIMIT)
            } else {
                // the listing still has to be drained for old masters
                store.nonexistent_chunks(NONEXISTENT_CHUNK_LIMIT);
                Vec::new()
            };
            (errors, damaged, lost, new, changed, nonexistent)
        })
        .await;
        let Some((errors, damaged, lost, new, changed, nonexistent)) = reports else {
            return;
        };
        for _ in 0..errors {
            self.out.push(Frame::empty(msg::CSTOMA_ERROR_OCCURRED));
        }
        if !damaged.is_empty() {
            let mut body = Vec::with_capacity(damaged.len() * 8);
            for chunkid in damaged {
                body.put_u64(chunkid);
            }
            self.out.push(Frame::new(msg::CSTOMA_CHUNK_DAMAGED, body));
        }
        if !lost.is_empty() {
            let mut body = Vec::with_capacity(lost.len() * 8);
            for chunkid in lost {
                body.put_u64(chunkid);
            }
            self.out.push(Frame::new(msg::CSTOMA_CHUNK_LOST, body));
        }
        if !new.is_empty() {
            let mut body = Vec::with_capacity(new.len() * 12);
            for (chunkid, version) in new {
                body.put_u64(chunkid);
                body.put_u32(version);
            }
            self.out.push(Frame::new(msg::CSTOMA_CHUNK_NEW, body));
        }
        if !changed.is_empty() {
            // a version change is reported as lost + new
            let mut lost_body = Vec::with_capacity(changed.len() * 8);
            let mut new_body = Vec::with_capacity(changed.len() * 12);
            for (chunkid, version) in changed {
                lost_body.put_u64(chunkid);
                new_body.put_u64(chunkid);
                new_body.put_u32(version);
            }
            self.out.push(Frame::new(msg::CSTOMA_CHUNK_LOST, lost_body));
            self.out.push(Frame::new(msg::CSTOMA_CHUNK_NEW, new_body));
        }
        if !nonexistent.is_empty() {
            let mut body = Vec::with_capacity(nonexistent.len() * 8);
            for chunkid in nonexistent {
                body.put_u64(chunkid);
            }
            self.out
                .push(Frame::new(msg::CSTOMA_CHUNK_DOESNT_EXIST, body));
        }
    }

    /// Parks the reply, marks the chunk busy and hands the job to a pool.
    fn submit_command(
        &mut self,
        high_priority: bool,
        op: OpKind,
        chunkid: u64,
        args: JobArgs,
        reply: PendingReply,
    ) {
        self.busy.start(chunkid);
        let conncnt = self.conncnt;
        let event_tx = self.event_tx.clone();
        let callback: Callback = Box::new(move |status| {
            let _ = event_tx.send(MasterEvent::Reply {
                conncnt,
                busy_chunkid: Some(chunkid),
                frame: reply.into_frame(status),
            });
        });
        let pool = if high_priority {
            self.engine.hp()
        } else {
            self.engine.lp()
        };
        let _ = pool.submit(
            op,
            chunkid,
            args,
            Some(callback),
            status::NOT_DONE,
            SubmitMode::LimitedQueue,
        );
    }

    /// Answers a command synchronously with `NOT_DONE` (still registering).
    fn refuse_while_registering(&mut self, what: &str, reply: PendingReply) {
        warn!("{what} - got command while still registering");
        self.out.push(reply.into_frame(status::NOT_DONE));
    }

    fn cmd_create(&mut self, data: &[u8]) {
        if data.len() != 12 {
            warn!("CREATE - wrong size ({}/12)", data.len());
            self.mode = Mode::Kill;
            return;
        }
        let mut data = data;
        let chunkid = data.get_u64();
        let version = data.get_u32();
        let mut body = Vec::with_capacity(9);
        body.put_u64(chunkid);
        let reply = PendingReply::new(msg::CSTOMA_CREATE, body);
        let args = JobArgs::ChunkOp {
            chunkid,
            version,
            newversion: 0,
            copychunkid: 0,
            copyversion: 0,
            length: 1,
        };
        self.submit_command(true, OpKind::ChunkOp, chunkid, args, reply);
    }

    fn cmd_delete(&mut self, data: &[u8]) {
        if data.len() != 12 {
            warn!("DELETE - wrong size ({}/12)", data.len());
            self.mode = Mode::Kill;
            return;
        }
        let mut data = data;
        let chunkid = data.get_u64();
        let version = data.get_u32();
        let mut body = Vec::with_capacity(9);
        body.put_u64(chunkid);
        let reply = PendingReply::new(msg::CSTOMA_DELETE, body);
        if self.register_state != RegisterState::Registered {
            self.refuse_while_registering("DELETE", reply);
            return;
        }
        let args = JobArgs::ChunkOp {
            chunkid,
            version,
            newversion: 0,
            copychunkid: 0,
            copyversion: 0,
            length: 0,
        };
        self.submit_command(true, OpKind::ChunkOp, chunkid, args, reply);
    }

    fn cmd_set_version(&mut self, data: &[u8]) {
        if data.len() != 16 {
            warn!("SET_VERSION - wrong size ({}/16)", data.len());
            self.mode = Mode::Kill;
            return;
        }
        let mut data = data;
        let chunkid = data.get_u64();
        let newversion = data.get_u32();
        let version = data.get_u32();
        let mut body = Vec::with_capacity(9);
        body.put_u64(chunkid);
        let reply = PendingReply::new(msg::CSTOMA_SET_VERSION, body);
        if newversion == 0 {
            self.submit_command(false, OpKind::Inval, chunkid, JobArgs::None, reply);
            return;
        }
        let args = JobArgs::ChunkOp {
            chunkid,
            version,
            newversion,
            copychunkid: 0,
            copyversion: 0,
            length: 0xFFFF_FFFF,
        };
        self.submit_command(true, OpKind::ChunkOp, chunkid, args, reply);
    }

    fn cmd_duplicate(&mut self, data: &[u8]) {
        if data.len() != 24 {
            warn!("DUPLICATE - wrong size ({}/24)", data.len());
            self.mode = Mode::Kill;
            return;
        }
        let mut data = data;
        let copychunkid = data.get_u64();
        let copyversion = data.get_u32();
        let chunkid = data.get_u64();
        let version = data.get_u32();
        let mut body = Vec::with_capacity(9);
        body.put_u64(copychunkid);
        let reply = PendingReply::new(msg::CSTOMA_DUPLICATE, body);
        if version == 0 || copychunkid == 0 {
            self.submit_command(false, OpKind::Inval, chunkid, JobArgs::None, reply);
            return;
        }
        let args = JobArgs::ChunkOp {
            chunkid,
            version,
            newversion: version,
            copychunkid,
            copyversion,
            length: 0xFFFF_FFFF,
        };
        self.submit_command(true, OpKind::ChunkOp, chunkid, args, reply);
    }

    fn cmd_truncate(&mut self, data: &[u8]) {
        if data.len() != 20 {
            warn!("TRUNCATE - wrong size ({}/20)", data.len());
            self.mode = Mode::Kill;
            return;
        }
        let mut data = data;
        let chunkid = data.get_u64();
        let length = data.get_u32();
        let newversion = data.get_u32();
        let version = data.get_u32();
        let mut body = Vec::with_capacity(9);
        body.put_u64(chunkid);
        let reply = PendingReply::new(msg::CSTOMA_TRUNCATE, body);
        if newversion == 0 || length == 0xFFFF_FFFF {
            self.submit_command(false, OpKind::Inval, chunkid, JobArgs::None, reply);
            return;
        }
        let args = JobArgs::ChunkOp {
            chunkid,
            version,
            newversion,
            copychunkid: 0,
            copyversion: 0,
            length,
        };
        self.submit_command(true, OpKind::ChunkOp, chunkid, args, reply);
    }

    fn cmd_duptrunc(&mut self, data: &[u8]) {
        if data.len() != 28 {
            warn!("DUPTRUNC - wrong size ({}/28)", data.len());
            self.mode = Mode::Kill;
            return;
        }
        let mut data = data;
        let copychunkid = data.get_u64();
        let copyversion = data.get_u32();
        let chunkid = data.get_u64();
        let version = data.get_u32();
        let length = data.get_u32();
        let mut body = Vec::with_capacity(9);
        body.put_u64(copychunkid);
        let reply = PendingReply::new(msg::CSTOMA_DUPTRUNC, body);
        if version == 0 || copychunkid == 0 || length == 0xFFFF_FFFF {
            self.submit_command(false, OpKind::Inval, chunkid, JobArgs::None, reply);
            return;
        }
        let args = JobArgs::ChunkOp {
            chunkid,
            version,
            newversion: version,
            copychunkid,
            copyversion,
            length,
        };
        self.submit_command(true, OpKind::ChunkOp, chunkid, args, reply);
    }

    fn cmd_localsplit(&mut self, data: &[u8]) {
        if data.len() != 16 && data.len() != 17 {
            warn!("LOCALSPLIT - wrong size ({}/16|17)", data.len());
            self.mode = Mode::Kill;
            return;
        }
        let mut data = data;
        let chunkid = data.get_u64();
        let version = data.get_u32();
        let missing_mask = data.get_u32();
        let parts = if data.has_remaining() { data.get_u8() } else { 8 };
        if parts != 8 && parts != 4 {
            warn!("LOCALSPLIT - unsupported parts number ({parts}/4|8)");
            self.mode = Mode::Kill;
            return;
        }
        let mut body = Vec::with_capacity(13);
        body.put_u64(chunkid);
        body.put_u32(version);
        let reply = PendingReply::new(msg::CSTOMA_LOCALSPLIT, body);
        if self.register_state != RegisterState::Registered {
            self.refuse_while_registering("LOCALSPLIT", reply);
            return;
        }
        let args = JobArgs::ChunkOp {
            chunkid,
            version,
            newversion: version,
            copychunkid: 0,
            copyversion: parts as u32,
            length: 0x8000_0000 | missing_mask,
        };
        self.submit_command(true, OpKind::ChunkOp, chunkid, args, reply);
    }

    fn cmd_chunkop(&mut self, data: &[u8]) {
        if data.len() != 32 {
            warn!("CHUNKOP - wrong size ({}/32)", data.len());
            self.mode = Mode::Kill;
            return;
        }
        let mut data = data;
        let chunkid = data.get_u64();
        let version = data.get_u32();
        let newversion = data.get_u32();
        let copychunkid = data.get_u64();
        let copyversion = data.get_u32();
        let length = data.get_u32();
        let mut body = Vec::with_capacity(33);
        body.put_u64(chunkid);
        body.put_u32(version);
        body.put_u32(newversion);
        body.put_u64(copychunkid);
        body.put_u32(copyversion);
        body.put_u32(length);
        let reply = PendingReply::new(msg::CSTOMA_CHUNKOP, body);
        if self.register_state != RegisterState::Registered {
            self.refuse_while_registering("CHUNKOP", reply);
            return;
        }
        let args = JobArgs::ChunkOp {
            chunkid,
            version,
            newversion,
            copychunkid,
            copyversion,
            length,
        };
        self.submit_command(true, OpKind::ChunkOp, chunkid, args, reply);
    }

    fn cmd_replicate(&mut self, data: &[u8]) {
        if data.len() != 18 {
            warn!("REPLICATE - wrong size ({}/18)", data.len());
            self.mode = Mode::Kill;
            return;
        }
        let mut data = data;
        let chunkid = data.get_u64();
        let version = data.get_u32();
        let ip = Ipv4Addr::from(data.get_u32());
        let port = data.get_u16();
        let mut body = Vec::with_capacity(13);
        body.put_u64(chunkid);
        body.put_u32(version);
        let reply = PendingReply::new(msg::CSTOMA_REPLICATE, body);
        if self.register_state != RegisterState::Registered {
            self.refuse_while_registering("REPLICATE", reply);
            return;
        }
        let args = JobArgs::Replicate {
            mode: ReplicationMode::Simple,
            chunkid,
            version,
            sources: vec![ReplicaSource { ip, port, chunkid }],
        };
        self.submit_command(false, OpKind::ReplicateSimple, chunkid, args, reply);
    }

    fn cmd_replicate_split(&mut self, data: &[u8]) {
        if data.len() != 28 {
            warn!("REPLICATE_SPLIT - wrong size ({}/28)", data.len());
            self.mode = Mode::Kill;
            return;
        }
        let mut data = data;
        let chunkid = data.get_u64();
        let version = data.get_u32();
        let ip = Ipv4Addr::from(data.get_u32());
        let port = data.get_u16();
        let srcchunkid = data.get_u64();
        let part_no = data.get_u8();
        let parts = data.get_u8();
        let mut body = Vec::with_capacity(13);
        body.put_u64(chunkid);
        body.put_u32(version);
        let reply = PendingReply::new(msg::CSTOMA_REPLICATE_SPLIT, body);
        if self.register_state != RegisterState::Registered {
            self.refuse_while_registering("REPLICATE_SPLIT", reply);
            return;
        }
        let args = JobArgs::Replicate {
            mode: ReplicationMode::Split { part_no, parts },
            chunkid,
            version,
            sources: vec![ReplicaSource {
                ip,
                port,
                chunkid: srcchunkid,
            }],
        };
        self.submit_command(false, OpKind::ReplicateSplit, chunkid, args, reply);
    }

    fn cmd_replicate_recover(&mut self, data: &[u8]) {
        if data.len() < 29 {
            warn!("REPLICATE_RECOVER - wrong size ({}/29+n*14)", data.len());
            self.mode = Mode::Kill;
            return;
        }
        let length = data.len();
        let mut data = data;
        let chunkid = data.get_u64();
        let version = data.get_u32();
        let d1 = data.get_u32();
        let d2 = data.get_u32();
        let d3 = data.get_u32();
        let d4 = data.get_u32();
        let parts = data.get_u8();
        if length != 29 + parts as usize * 14 {
            warn!("REPLICATE_RECOVER - wrong size ({length}/29+n*14:n={parts})");
            self.mode = Mode::Kill;
            return;
        }
        if parts as usize > chunkd_proto::MAX_EC_PARTS {
            warn!(
                "REPLICATE_RECOVER - too many parts ({parts}/{})",
                chunkd_proto::MAX_EC_PARTS
            );
            self.mode = Mode::Kill;
            return;
        }
        let marker_ok = match parts {
            8 => {
                d1 == 0x88888888 && d2 == 0x44444444 && d3 == 0x22222222 && d4 == 0x11111111
            }
            4 => d1 == 0x8888 && d2 == 0x4444 && d3 == 0x2222 && d4 == 0x1111,
            _ => {
                warn!("REPLICATE_RECOVER - wrong parts number ({parts}/4|8)");
                self.mode = Mode::Kill;
                return;
            }
        };
        if !marker_ok {
            warn!("REPLICATE_RECOVER - wrong packet");
            self.mode = Mode::Kill;
            return;
        }
        let mut sources = Vec::with_capacity(parts as usize);
        for _ in 0..parts {
            let ip = Ipv4Addr::from(data.get_u32());
            let port = data.get_u16();
            let srcchunkid = data.get_u64();
            sources.push(ReplicaSource {
                ip,
                port,
                chunkid: srcchunkid,
            });
        }
        let mut body = Vec::with_capacity(13);
        body.put_u64(chunkid);
        body.put_u32(version);
        let reply = PendingReply::new(msg::CSTOMA_REPLICATE_RECOVER, body);
        if self.register_state != RegisterState::Registered {
            self.refuse_while_registering("REPLICATE_RECOVER", reply);
            return;
        }
        let args = JobArgs::Replicate {
            mode: ReplicationMode::Recover { parts },
            chunkid,
            version,
            sources,
        };
        self.submit_command(false, OpKind::ReplicateRecover, chunkid, args, reply);
    }

    fn cmd_replicate_join(&mut self, data: &[u8]) {
        if data.len() < 13 {
            warn!("REPLICATE_JOIN - wrong size ({}/13+n*14)", data.len());
            self.mode = Mode::Kill;
            return;
        }
        let length = data.len();
        let mut data = data;
        let chunkid = data.get_u64();
        let version = data.get_u32();
        let parts = data.get_u8();
        if length != 13 + parts as usize * 14 {
            warn!("REPLICATE_JOIN - wrong size ({length}/13+n*14:n={parts})");
            self.mode = Mode::Kill;
            return;
        }
        if parts as usize > chunkd_proto::MAX_EC_PARTS {
            warn!(
                "REPLICATE_JOIN - too many parts ({parts}/{})",
                chunkd_proto::MAX_EC_PARTS
            );
            self.mode = Mode::Kill;
            return;
        }
        let mut sources = Vec::with_capacity(parts as usize);
        for _ in 0..parts {
            let ip = Ipv4Addr::from(data.get_u32());
            let port = data.get_u16();
            let srcchunkid = data.get_u64();
            sources.push(ReplicaSource {
                ip,
                port,
                chunkid: srcchunkid,
            });
        }
        let mut body = Vec::with_capacity(13);
        body.put_u64(chunkid);
        body.put_u32(version);
        let reply = PendingReply::new(msg::CSTOMA_REPLICATE_JOIN, body);
        if self.register_state != RegisterState::Registered {
            self.refuse_while_registering("REPLICATE_JOIN", reply);
            return;
        }
        let args = JobArgs::Replicate {
            mode: ReplicationMode::Join { parts },
            chunkid,
            version,
            sources,
        };
        self.submit_command(false, OpKind::ReplicateJoin, chunkid, args, reply);
    }

    fn idle_chunk_info(&mut self, data: &[u8], kind: ChunkInfoKind) {
        if data.len() != 12 {
            warn!("GET_CHUNK_INFO - wrong size ({}/12)", data.len());
            self.mode = Mode::Kill;
            return;
        }
        let mut data = data;
        let chunkid = data.get_u64();
        let version = data.get_u32();
        let out = Arc::new(Mutex::new(None));
        let conncnt = self.conncnt;
        let event_tx = self.event_tx.clone();
        let slot = out.clone();
        let callback: Callback = Box::new(move |status| {
            let info = slot.lock().take();
            let frame = build_chunk_info_reply(kind, chunkid, version, status, info);
            let _ = event_tx.send(MasterEvent::Reply {
                conncnt,
                busy_chunkid: None,
                frame,
            });
        });
        let args = JobArgs::GetInfo {
            chunkid,
            version,
            kind,
            out,
        };
        let jobid = self.engine.lp().submit(
            OpKind::GetInfo,
            chunkid,
            args,
            Some(callback),
            status::NOT_DONE,
            SubmitMode::LimitedQueue,
        );
        if let Ok(jobid) = jobid {
            self.idle_jobids.push(jobid);
        }
    }
}

fn build_chunk_info_reply(
    kind: ChunkInfoKind,
    chunkid: u64,
    version: u32,
    status_byte: u8,
    info: Option<ChunkInfo>,
) -> Frame {
    let mut body = Vec::with_capacity(16);
    body.put_u64(chunkid);
    body.put_u32(version);
    match kind {
        ChunkInfoKind::Blocks => {
            // fixed layout: blocks then status, whatever the outcome
            let blocks = match info {
                Some(ChunkInfo::Blocks(blocks)) => blocks,
                _ => 0,
            };
            body.put_u16(blocks);
            body.put_u8(status_byte);
            Frame::new(msg::CSTOAN_CHUNK_BLOCKS, body)
        }
        ChunkInfoKind::Checksum => {
            match (status_byte, info) {
                (status::OK, Some(ChunkInfo::Checksum(crc))) => body.put_u32(crc),
                _ => body.put_u8(if status_byte == status::OK {
                    status::EINVAL
                } else {
                    status_byte
                }),
            }
            Frame::new(msg::CSTOAN_CHUNK_CHECKSUM, body)
        }
        ChunkInfoKind::ChecksumTab => {
            match (status_byte, info) {
                (status::OK, Some(ChunkInfo::ChecksumTab(tab))) => body.extend_from_slice(&tab),
                _ => body.put_u8(if status_byte == status::OK {
                    status::EINVAL
                } else {
                    status_byte
                }),
            }
            Frame::new(msg::CSTOAN_CHUNK_CHECKSUM_TAB, body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_engine, MemStore};
    use tokio::io::DuplexStream;

    fn test_task(
        store: Arc<MemStore>,
        auth_code: Option<String>,
    ) -> (MasterTask, CancellationToken, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = CancellationToken::new();
        let engine = test_engine(store.clone());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let hl_rx = engine.hlstatus();
        let identity = IdentityFile::load(dir.path());
        let cfg = MasterConfig {
            host: "master.test".into(),
            port: 9420,
            bind_host: None,
            timeout: 0,
            reconnection_delay: 5,
            chunks_per_register_packet: 100,
            auth_code,
            label_mask: 0,
            listen_ip: Ipv4Addr::new(192, 168, 1, 10),
            listen_port: 9422,
            data_path: dir.path().to_path_buf(),
        };
        let task = MasterTask {
            cfg,
            store,
            engine,
            identity,
            busy: BusyChunks::new(),
            event_tx,
            event_rx,
            hl_rx,
            shutdown: shutdown.clone(),
            conncnt: 0,
            addr: None,
            addr_valid: false,
            mode: Mode::Free,
            register_state: RegisterState::Unregistered,
            master_version: 0,
            timeout: Duration::from_secs(10),
            rnd_blob: None,
            idle_jobids: Vec::new(),
            out: Vec::new(),
            fatal: false,
            wantexit_at: None,
        };
        (task, shutdown, dir)
    }

    struct FakeMaster {
        framed: Framed<DuplexStream, FrameCodec>,
    }

    impl FakeMaster {
        fn new(stream: DuplexStream) -> Self {
            Self {
                framed: Framed::new(stream, FrameCodec::master()),
            }
        }

        async fn recv(&mut self) -> Frame {
            loop {
                let frame = self.framed.next().await.unwrap().unwrap();
                if !frame.is_nop() {
                    return frame;
                }
            }
        }

        async fn send(&mut self, frame: Frame) {
            self.framed.send(frame).await.unwrap();
        }

        fn ack_accept(master_version: u32, csid: u16, meta_id: u64) -> Frame {
            let mut body = Vec::new();
            body.put_u8(0);
            body.put_u32(master_version);
            body.put_u16(0); // timeout: let the chunkserver keep its own
            body.put_u16(csid);
            body.put_u64(meta_id);
            Frame::new(msg::MATOCS_MASTER_ACK, body)
        }
    }

    #[tokio::test]
    async fn registration_streams_chunks_in_batches() {
        let store = Arc::new(MemStore::new());
        // 250 chunks, batches of 100 -> 100 + 100 + 50 + done
        for i in 0..250u64 {
            store.add_chunk(i + 1, 1);
        }
        let (mut task, _shutdown, _dir) = test_task(store, None);

        let (local, remote) = tokio::io::duplex(1 << 20);
        let mut master = FakeMaster::new(remote);
        let session = tokio::spawn(async move {
            task.run_session(local).await;
            task
        });

        // register v60
        let reg = master.recv().await;
        assert_eq!(reg.ftype, msg::CSTOMA_REGISTER);
        assert_eq!(reg.data[0], msg::REGISTER_BASE);
        assert_eq!(reg.data.len(), 1 + 4 + 4 + 2 + 2 + 2 + 8 + 8 + 4 + 8 + 8 + 4);

        master
            .send(FakeMaster::ack_accept(version_int(4, 40, 0), 3, 0x1234))
            .await;

        // labels come first on modern masters
        let labels = master.recv().await;
        assert_eq!(labels.ftype, msg::CSTOMA_LABELS);

        let mut batch_sizes = Vec::new();
        loop {
            let frame = master.recv().await;
            assert_eq!(frame.ftype, msg::CSTOMA_REGISTER);
            match frame.data[0] {
                msg::REGISTER_CHUNKS => {
                    assert_eq!((frame.data.len() - 1) % 12, 0);
                    batch_sizes.push((frame.data.len() - 1) / 12);
                    master
                        .send(FakeMaster::ack_accept(version_int(4, 40, 0), 3, 0x1234))
                        .await;
                }
                msg::REGISTER_DONE => break,
                other => panic!("unexpected register subtype {other}"),
            }
        }
        assert_eq!(batch_sizes, vec![100, 100, 50]);

        drop(master);
        let task = session.await.unwrap();
        assert_eq!(task.register_state, RegisterState::Registered);
        assert_eq!(task.identity.csid(), 3);
        assert_eq!(task.identity.meta_id(), 0x1234);
        assert_eq!(task.store.meta_id(), 0x1234);
    }

    #[tokio::test]
    async fn meta_id_mismatch_is_fatal() {
        let store = Arc::new(MemStore::new());
        let (mut task, _shutdown, _dir) = test_task(store, None);
        // persisted identity from an earlier life of this chunkserver
        task.identity.update(1, 0xAAA);
        assert_eq!(task.identity.meta_id(), 0xAAA);

        let (local, remote) = tokio::io::duplex(1 << 16);
        let mut master = FakeMaster::new(remote);
        let session = tokio::spawn(async move {
            let end = task.run_session(local).await;
            (task, end)
        });

        let _register = master.recv().await;
        master
            .send(FakeMaster::ack_accept(version_int(4, 40, 0), 1, 0xBBB))
            .await;

        let (task, end) = session.await.unwrap();
        assert!(matches!(end, SessionEnd::Kill));
        assert!(task.fatal);
        // the connection never reached Registered through the normal path
        assert!(task.out.is_empty());
    }

    #[tokio::test]
    async fn first_contact_accepts_any_meta_id() {
        let store = Arc::new(MemStore::new());
        store.add_chunk(9, 2);
        let (mut task, _shutdown, _dir) = test_task(store.clone(), None);
        assert_eq!(task.identity.meta_id(), 0);

        let (local, remote) = tokio::io::duplex(1 << 16);
        let mut master = FakeMaster::new(remote);
        let session = tokio::spawn(async move {
            task.run_session(local).await;
            task
        });
        let _register = master.recv().await;
        master
            .send(FakeMaster::ack_accept(version_int(4, 40, 0), 5, 0xF00D))
            .await;
        let _labels = master.recv().await;
        let chunks = master.recv().await;
        assert_eq!(chunks.data[0], msg::REGISTER_CHUNKS);
        drop(master);
        let task = session.await.unwrap();
        assert!(!task.fatal);
        assert_eq!(task.identity.meta_id(), 0xF00D);
    }

    #[tokio::test]
    async fn auth_request_resends_register_with_digest() {
        let store = Arc::new(MemStore::new());
        let (mut task, _shutdown, _dir) = test_task(store, Some("secret".into()));

        let (local, remote) = tokio::io::duplex(1 << 16);
        let mut master = FakeMaster::new(remote);
        let session = tokio::spawn(async move {
            task.run_session(local).await;
            task
        });

        let plain = master.recv().await;
        assert_eq!(plain.data.len(), 1 + 4 + 4 + 2 + 2 + 2 + 8 + 8 + 4 + 8 + 8 + 4);

        let blob = [7u8; 32];
        let mut body = vec![3u8];
        body.extend_from_slice(&blob);
        master.send(Frame::new(msg::MATOCS_MASTER_ACK, body)).await;

        let authed = master.recv().await;
        assert_eq!(authed.ftype, msg::CSTOMA_REGISTER);
        assert_eq!(authed.data.len(), 1 + 16 + 4 + 4 + 2 + 2 + 2 + 8 + 8 + 4 + 8 + 8 + 4);
        let mut input = Vec::new();
        input.extend_from_slice(&blob[..16]);
        input.extend_from_slice(b"secret");
        input.extend_from_slice(&blob[16..]);
        assert_eq!(&authed.data[1..17], &md5::compute(input).0);

        drop(master);
        session.await.unwrap();
    }

    #[tokio::test]
    async fn master_command_runs_job_and_replies() {
        let store = Arc::new(MemStore::new());
        let (mut task, _shutdown, _dir) = test_task(store.clone(), None);

        let (local, remote) = tokio::io::duplex(1 << 20);
        let mut master = FakeMaster::new(remote);
        let session = tokio::spawn(async move {
            task.run_session(local).await;
            task
        });

        let _register = master.recv().await;
        master
            .send(FakeMaster::ack_accept(version_int(4, 40, 0), 1, 1))
            .await;
        let _labels = master.recv().await;
        let done = master.recv().await;
        assert_eq!(done.data[0], msg::REGISTER_DONE);

        // create chunk 42 v1
        let mut body = Vec::new();
        body.put_u64(42);
        body.put_u32(1);
        master.send(Frame::new(msg::MATOCS_CREATE, body)).await;

        let reply = master.recv().await;
        assert_eq!(reply.ftype, msg::CSTOMA_CREATE);
        assert_eq!(reply.data.len(), 9);
        let mut parse = reply.data.as_ref();
        assert_eq!(parse.get_u64(), 42);
        assert_eq!(parse.get_u8(), status::OK);
        assert!(store.has_chunk(42));

        drop(master);
        session.await.unwrap();
    }

    #[tokio::test]
    async fn idle_chunk_blocks_query_is_answered() {
        let store = Arc::new(MemStore::new());
        store.add_chunk(21, 1);
        store.put_block(21, 0, &[1; 8]);
        store.put_block(21, 1, &[2; 8]);
        let (mut task, _shutdown, _dir) = test_task(store, None);

        let (local, remote) = tokio::io::duplex(1 << 20);
        let mut master = FakeMaster::new(remote);
        let session = tokio::spawn(async move {
            task.run_session(local).await;
            task
        });

        let _register = master.recv().await;
        master
            .send(FakeMaster::ack_accept(version_int(4, 40, 0), 1, 1))
            .await;
        let _labels = master.recv().await;
        loop {
            let frame = master.recv().await;
            if frame.ftype == msg::CSTOMA_REGISTER && frame.data[0] == msg::REGISTER_DONE {
                break;
            }
            if frame.ftype == msg::CSTOMA_REGISTER && frame.data[0] == msg::REGISTER_CHUNKS {
                master
                    .send(FakeMaster::ack_accept(version_int(4, 40, 0), 1, 1))
                    .await;
            }
        }

        let mut body = Vec::new();
        body.put_u64(21);
        body.put_u32(1);
        master
            .send(Frame::new(msg::ANTOCS_GET_CHUNK_BLOCKS, body))
            .await;
        let reply = master.recv().await;
        assert_eq!(reply.ftype, msg::CSTOAN_CHUNK_BLOCKS);
        let mut parse = reply.data.as_ref();
        assert_eq!(parse.get_u64(), 21);
        assert_eq!(parse.get_u32(), 1);
        assert_eq!(parse.get_u16(), 2);
        assert_eq!(parse.get_u8(), status::OK);

        drop(master);
        session.await.unwrap();
    }

    #[tokio::test]
    async fn force_timeout_clamps_to_ten_seconds() {
        let store = Arc::new(MemStore::new());
        let (mut task, _shutdown, _dir) = test_task(store, None);
        task.mode = Mode::Data;
        task.force_timeout(&3u16.to_be_bytes());
        assert_eq!(task.timeout, Duration::from_secs(10));
        task.force_timeout(&120u16.to_be_bytes());
        assert_eq!(task.timeout, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn busy_chunk_suppresses_status_reply() {
        let store = Arc::new(MemStore::new());
        let (mut task, _shutdown, _dir) = test_task(store, None);
        task.mode = Mode::Data;
        task.busy.start(77);
        let mut body = Vec::new();
        body.put_u64(77);
        task.chunk_status(&body).await;
        assert!(task.out.is_empty());
        task.busy.end(77);
        task.chunk_status(&body).await;
        assert_eq!(task.out.len(), 1);
        assert_eq!(task.out[0].ftype, msg::CSTOMA_CHUNK_STATUS);
    }

    #[tokio::test]
    async fn stale_replies_are_dropped_after_reconnect() {
        let store = Arc::new(MemStore::new());
        let (mut task, _shutdown, _dir) = test_task(store, None);
        task.mode = Mode::Data;
        task.conncnt = 2;
        task.busy.start(5);
        task.handle_event(MasterEvent::Reply {
            conncnt: 1,
            busy_chunkid: Some(5),
            frame: Frame::empty(msg::CSTOMA_CREATE),
        });
        // the busy entry is released even though the frame is dropped
        assert!(!task.busy.is_busy(5));
        assert!(task.out.is_empty());
        task.handle_event(MasterEvent::Reply {
            conncnt: 2,
            busy_chunkid: None,
            frame: Frame::empty(msg::CSTOMA_CREATE),
        });
        assert_eq!(task.out.len(), 1);
    }
}
