//! Keepalive NOP sender.
//!
//! A pipeline registers a socket here before entering a blocking store call
//! and deregisters it afterwards. While registered, the sender emits an
//! 8-byte NOP frame once the socket has seen no send for a second, keeping
//! the peer's idle timeout from firing. A write failure raises the entry's
//! error flag, which the owner checks on deregistration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use chunkd_proto::NOP_FRAME;

use crate::net::{write_all_guarded, SharedWriter, SERV_TIMEOUT};

/// Idle time after which a NOP is sent on a registered socket.
const NOPS_INTERVAL: Duration = Duration::from_secs(1);

/// Per-socket keepalive registration handle. One handle per socket; it can
/// be registered and deregistered repeatedly around blocking sections.
#[derive(Clone)]
pub struct NopHandle {
    id: u64,
    writer: SharedWriter,
    error: Arc<AtomicBool>,
}

impl NopHandle {
    /// True when the keepalive sender hit a write error on this socket; the
    /// owning pipeline must abort.
    pub fn error(&self) -> bool {
        self.error.load(Ordering::Relaxed)
    }
}

struct Entry {
    id: u64,
    writer: SharedWriter,
    error: Arc<AtomicBool>,
    stamp: Instant,
}

#[derive(Default)]
struct Registry {
    // FIFO by stamp: entries are appended on registration and rotated to
    // the back after every NOP
    entries: Vec<Entry>,
}

/// Handle to the global keepalive sender task.
#[derive(Clone)]
pub struct KeepaliveSender {
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl KeepaliveSender {
    /// Starts the sender task and returns its handle.
    pub fn start() -> (Self, JoinHandle<()>) {
        let sender = Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        };
        let registry = sender.registry.clone();
        let task = tokio::spawn(sender_loop(registry));
        (sender, task)
    }

    /// Creates a keepalive handle for a socket. The socket is not yet
    /// registered.
    pub fn handle(&self, writer: SharedWriter) -> NopHandle {
        NopHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            writer,
            error: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Adds the socket to the sender's list. A no-op when already
    /// registered.
    pub fn register(&self, handle: &NopHandle) {
        let mut registry = self.registry.lock();
        if registry.entries.iter().any(|e| e.id == handle.id) {
            return;
        }
        registry.entries.push(Entry {
            id: handle.id,
            writer: handle.writer.clone(),
            error: handle.error.clone(),
            stamp: Instant::now(),
        });
    }

    /// Removes the socket from the sender's list; the caller regains
    /// exclusive use. A no-op when not registered.
    pub fn deregister(&self, handle: &NopHandle) {
        let mut registry = self.registry.lock();
        registry.entries.retain(|e| e.id != handle.id);
    }
}

async fn sender_loop(registry: Arc<Mutex<Registry>>) {
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        let due: Vec<(SharedWriter, Arc<AtomicBool>)> = {
            let mut registry = registry.lock();
            let now = Instant::now();
            let mut due = Vec::new();
            // entries are kept oldest-first; rotate each due entry to the
            // back with a fresh stamp
            while let Some(first) = registry.entries.first() {
                if first.stamp + NOPS_INTERVAL > now {
                    break;
                }
                let mut entry = registry.entries.remove(0);
                entry.stamp = now;
                if !entry.error.load(Ordering::Relaxed) {
                    due.push((entry.writer.clone(), entry.error.clone()));
                }
                registry.entries.push(entry);
            }
            due
        };
        for (writer, error) in due {
            // an owner holding the writer is sending its own frame, which
            // resets the peer's idle clock just as well
            let Some(guard) = writer.try_lock_owned() else {
                continue;
            };
            if let Err(err) = write_all_guarded(guard, &NOP_FRAME, SERV_TIMEOUT).await {
                debug!("keepalive nop send failed: {err}");
                error.store(true, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::read_exact_timeout;

    #[tokio::test(start_paused = true)]
    async fn sends_nops_on_idle_registered_sockets() {
        let (sender, _task) = KeepaliveSender::start();
        let (client, mut peer) = tokio::io::duplex(256);
        let (_rd, wr) = tokio::io::split(client);
        let handle = sender.handle(SharedWriter::new(wr));
        sender.register(&handle);

        tokio::time::advance(Duration::from_millis(1200)).await;
        let mut buf = [0u8; 8];
        read_exact_timeout(&mut peer, &mut buf, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(buf, NOP_FRAME);
        assert!(!handle.error());
        sender.deregister(&handle);
    }

    #[tokio::test(start_paused = true)]
    async fn flags_error_when_peer_is_gone() {
        let (sender, _task) = KeepaliveSender::start();
        let (client, peer) = tokio::io::duplex(16);
        let (_rd, wr) = tokio::io::split(client);
        drop(peer);
        let handle = sender.handle(SharedWriter::new(wr));
        sender.register(&handle);
        tokio::time::advance(Duration::from_millis(1200)).await;
        for _ in 0..20 {
            if handle.error() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(handle.error());
        sender.deregister(&handle);
    }

    #[tokio::test(start_paused = true)]
    async fn deregistered_sockets_stay_silent() {
        let (sender, _task) = KeepaliveSender::start();
        let (client, mut peer) = tokio::io::duplex(256);
        let (_rd, wr) = tokio::io::split(client);
        let handle = sender.handle(SharedWriter::new(wr));
        sender.register(&handle);
        sender.deregister(&handle);
        tokio::time::advance(Duration::from_secs(3)).await;
        let mut buf = [0u8; 1];
        assert_eq!(
            crate::net::try_read_now(&mut peer, &mut buf).await.unwrap(),
            None
        );
    }
}
