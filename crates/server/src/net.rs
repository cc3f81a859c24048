//! Socket plumbing shared by the pipelines, the keepalive sender and the
//! connection cache.
//!
//! Write halves are wrapped in [`SharedWriter`] so the keepalive sender can
//! emit NOP frames while the owning pipeline is blocked in a store call.
//! Every write goes through the same async mutex and writes whole frames,
//! so NOPs can never interleave with frame bytes.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-I/O timeout on the data path.
pub const SERV_TIMEOUT: Duration = Duration::from_secs(5);

/// Hard cap multiplier: an operation making progress may run this many times
/// the per-I/O timeout in total.
const HARD_CAP: u32 = 30;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Bytes moved over the data path, drained by introspection.
#[derive(Debug, Default)]
pub struct DataStats {
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub read_ops: AtomicU64,
    pub write_ops: AtomicU64,
}

impl DataStats {
    pub fn add_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }
}

/// A write half shareable between a pipeline and the keepalive sender.
#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl SharedWriter {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Writes the whole buffer, timing out when no single write makes
    /// progress within `per_io` or the total exceeds the hard cap.
    pub async fn write_all_timeout(&self, buf: &[u8], per_io: Duration) -> io::Result<()> {
        let guard = self.inner.clone().lock_owned().await;
        write_all_guarded(guard, buf, per_io).await
    }

    /// Builds and sends a `type | length | payload` frame.
    pub async fn send_frame(&self, ftype: u32, payload: &[u8], per_io: Duration) -> io::Result<()> {
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.put_u32(ftype);
        frame.put_u32(payload.len() as u32);
        frame.extend_from_slice(payload);
        self.write_all_timeout(&frame, per_io).await
    }

    /// Grabs the writer only if nobody holds it right now. Used by the
    /// keepalive sender: an owner actively writing resets the idle clock
    /// anyway, so contention means no NOP is needed.
    pub(crate) fn try_lock_owned(&self) -> Option<OwnedMutexGuard<Box<dyn AsyncWrite + Send + Unpin>>> {
        self.inner.clone().try_lock_owned().ok()
    }
}

pub(crate) async fn write_all_guarded(
    mut guard: OwnedMutexGuard<Box<dyn AsyncWrite + Send + Unpin>>,
    mut buf: &[u8],
    per_io: Duration,
) -> io::Result<()> {
    let started = Instant::now();
    let hard_cap = per_io * HARD_CAP;
    while !buf.is_empty() {
        if started.elapsed() > hard_cap {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out"));
        }
        let n = tokio::time::timeout(per_io, guard.write(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "send timed out"))??;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "peer closed"));
        }
        buf = &buf[n..];
    }
    Ok(())
}

/// Reads exactly `buf.len()` bytes, timing out when no single read makes
/// progress within `per_io` or the total exceeds the hard cap.
pub async fn read_exact_timeout(
    reader: &mut (impl AsyncRead + Unpin + ?Sized),
    buf: &mut [u8],
    per_io: Duration,
) -> io::Result<()> {
    use tokio::io::AsyncReadExt;
    let started = Instant::now();
    let hard_cap = per_io * HARD_CAP;
    let mut filled = 0usize;
    while filled < buf.len() {
        if started.elapsed() > hard_cap {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "receive timed out"));
        }
        let n = tokio::time::timeout(per_io, reader.read(&mut buf[filled..]))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "receive timed out"))??;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed",
            ));
        }
        filled += n;
    }
    Ok(())
}

/// Polls the reader exactly once without waiting. `Ok(None)` means no bytes
/// are available right now; `Ok(Some(0))` means the peer closed.
pub async fn try_read_now(
    reader: &mut (impl AsyncRead + Unpin + ?Sized),
    buf: &mut [u8],
) -> io::Result<Option<usize>> {
    std::future::poll_fn(|cx| {
        let mut read_buf = ReadBuf::new(buf);
        match Pin::new(&mut *reader).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(Some(read_buf.filled().len()))),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Ready(Ok(None)),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn shared_writer_sends_whole_frames() {
        let (client, mut server) = tokio::io::duplex(256);
        let (_, wr) = tokio::io::split(client);
        let writer = SharedWriter::new(wr);
        writer
            .send_frame(0x1234, &[9, 9], SERV_TIMEOUT)
            .await
            .unwrap();
        let mut buf = [0u8; 10];
        read_exact_timeout(&mut server, &mut buf, SERV_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(&buf, &[0, 0, 0x12, 0x34, 0, 0, 0, 2, 9, 9]);
    }

    #[tokio::test]
    async fn try_read_now_reports_empty_and_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        let (mut rd, _wr) = tokio::io::split(client);
        let mut buf = [0u8; 8];
        assert_eq!(try_read_now(&mut rd, &mut buf).await.unwrap(), None);
        server.write_all(&[1, 2, 3]).await.unwrap();
        assert_eq!(try_read_now(&mut rd, &mut buf).await.unwrap(), Some(3));
        drop(server);
        assert_eq!(try_read_now(&mut rd, &mut buf).await.unwrap(), Some(0));
    }
}
