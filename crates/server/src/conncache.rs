//! Cache of idle downstream-peer connections.
//!
//! A write chain that finished cleanly parks its downstream socket here; the
//! next write to the same peer reuses it instead of dialing. A sweeper task
//! exchanges NOP frames with every cached socket twice a second and drops
//! any that error or talk garbage.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use chunkd_proto::NOP_FRAME;

use crate::net::{try_read_now, BoxReader, SharedWriter};

const CAPACITY: usize = 250;
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);
const SWEEP_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// An idle connection: the split read half plus the shared write half, ready
/// to re-enter a pipeline without reuniting.
pub struct CachedConn {
    pub reader: BoxReader,
    pub writer: SharedWriter,
}

struct Slot {
    ip: Ipv4Addr,
    port: u16,
    conn: CachedConn,
}

/// LRU pool of idle downstream sockets, capacity-bounded.
#[derive(Clone)]
pub struct ConnCache {
    // async mutex: the sweeper holds it across NOP probes
    slots: Arc<Mutex<Vec<Slot>>>,
}

impl ConnCache {
    pub fn start() -> (Self, JoinHandle<()>) {
        let cache = Self {
            slots: Arc::new(Mutex::new(Vec::new())),
        };
        let slots = cache.slots.clone();
        let task = tokio::spawn(sweeper_loop(slots));
        (cache, task)
    }

    /// Parks an idle connection, evicting the least recently used one when
    /// full. Several connections to the same peer may coexist.
    pub async fn insert(&self, ip: Ipv4Addr, port: u16, conn: CachedConn) {
        let mut slots = self.slots.lock().await;
        if slots.len() >= CAPACITY {
            slots.remove(0);
        }
        slots.push(Slot { ip, port, conn });
    }

    /// Takes the first idle connection to `(ip, port)`, if any.
    pub async fn get(&self, ip: Ipv4Addr, port: u16) -> Option<CachedConn> {
        let mut slots = self.slots.lock().await;
        let pos = slots.iter().position(|s| s.ip == ip && s.port == port)?;
        Some(slots.remove(pos).conn)
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }
}

async fn sweeper_loop(slots: Arc<Mutex<Vec<Slot>>>) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        let mut slots = slots.lock().await;
        let mut index = 0;
        while index < slots.len() {
            if probe(&mut slots[index].conn).await {
                index += 1;
            } else {
                let dead = slots.remove(index);
                debug!(
                    "conncache: dropping stale connection to {}:{}",
                    dead.ip, dead.port
                );
            }
        }
    }
}

/// One keepalive exchange: anything pending must be a full all-zero NOP,
/// then a NOP goes out. Returns false when the socket should be dropped.
async fn probe(conn: &mut CachedConn) -> bool {
    let mut buf = [0u8; 8];
    match try_read_now(&mut conn.reader, &mut buf).await {
        Ok(None) => {}
        Ok(Some(8)) if buf == NOP_FRAME => {}
        Ok(Some(_)) => return false,
        Err(_) => return false,
    }
    conn.writer
        .write_all_timeout(&NOP_FRAME, SWEEP_SEND_TIMEOUT)
        .await
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::read_exact_timeout;
    use tokio::io::AsyncWriteExt;

    fn pair() -> (CachedConn, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(256);
        let (rd, wr) = tokio::io::split(local);
        (
            CachedConn {
                reader: Box::new(rd),
                writer: SharedWriter::new(wr),
            },
            remote,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn get_returns_the_parked_connection() {
        let (cache, _task) = ConnCache::start();
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        let (conn, mut remote) = pair();
        cache.insert(ip, 9422, conn).await;
        assert!(cache.get(ip, 9421).await.is_none());
        let conn = cache.get(ip, 9422).await.unwrap();
        conn.writer
            .write_all_timeout(b"hi", Duration::from_secs(1))
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        read_exact_timeout(&mut remote, &mut buf, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&buf, b"hi");
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_exchanges_nops_and_drops_garbage() {
        let (cache, _task) = ConnCache::start();
        let ip = Ipv4Addr::new(10, 0, 0, 2);

        let (good, mut good_remote) = pair();
        cache.insert(ip, 1, good).await;
        let (bad, mut bad_remote) = pair();
        cache.insert(ip, 2, bad).await;
        bad_remote.write_all(b"garbage!").await.unwrap();

        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;

        // the healthy socket got a NOP, the garbage-speaking one is gone
        let mut buf = [0u8; 8];
        read_exact_timeout(&mut good_remote, &mut buf, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(buf, NOP_FRAME);
        assert_eq!(cache.len().await, 1);
        assert!(cache.get(ip, 2).await.is_none());
        assert!(cache.get(ip, 1).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_least_recently_used() {
        let (cache, _task) = ConnCache::start();
        let ip = Ipv4Addr::new(10, 0, 0, 3);
        let mut remotes = Vec::new();
        for port in 0..=CAPACITY as u16 {
            let (conn, remote) = pair();
            cache.insert(ip, port, conn).await;
            remotes.push(remote);
        }
        assert_eq!(cache.len().await, CAPACITY);
        // the oldest entry (port 0) was evicted
        assert!(cache.get(ip, 0).await.is_none());
        assert!(cache.get(ip, CAPACITY as u16).await.is_some());
    }
}
