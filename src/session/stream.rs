//! Logical tunnel streams
//!
//! A [`TunnelStream`] is one bidirectional reliable byte channel inside a
//! session: plain `AsyncRead`/`AsyncWrite` plus a stream id and the peer
//! endpoint. Per-operation deadlines are applied at call sites with
//! `tokio::time::timeout`. There is one concrete mux-backed implementation
//! and an in-memory pipe used as a test double.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_smux::MuxStream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::adapter::SessionAdapter;

/// Capability set of a logical stream, polymorphic over the mux backend
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {
    /// 32-bit stream id, unique within the owning session
    fn sid(&self) -> u32;

    /// The tunnel peer this stream runs through
    fn remote_addr(&self) -> SocketAddr;
}

/// A boxed stream, as handed out by sessions
pub type DynStream = Box<dyn TunnelStream>;

/// Counts live streams in a session so `mux.max_streams` can be enforced
/// at open time.
#[derive(Debug, Default)]
pub struct StreamCount(AtomicUsize);

impl StreamCount {
    /// Current live stream count
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    fn incr(self: &Arc<Self>) -> StreamGuard {
        self.0.fetch_add(1, Ordering::Relaxed);
        StreamGuard(Arc::clone(self))
    }
}

/// Drops the count when a stream goes away
struct StreamGuard(Arc<StreamCount>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0 .0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The mux-backed stream implementation
pub struct MuxTunnelStream {
    inner: MuxStream<SessionAdapter>,
    sid: u32,
    remote: SocketAddr,
    _guard: StreamGuard,
}

impl MuxTunnelStream {
    pub(crate) fn new(
        inner: MuxStream<SessionAdapter>,
        sid: u32,
        remote: SocketAddr,
        count: &Arc<StreamCount>,
    ) -> Self {
        Self {
            inner,
            sid,
            remote,
            _guard: count.incr(),
        }
    }
}

impl AsyncRead for MuxTunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxTunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl TunnelStream for MuxTunnelStream {
    fn sid(&self) -> u32 {
        self.sid
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

/// In-memory stream pair: the test double for [`TunnelStream`]
pub struct PipeStream {
    inner: tokio::io::DuplexStream,
    sid: u32,
    remote: SocketAddr,
}

/// Create a connected pair of pipe streams sharing a stream id, as a
/// client/server pair would see one logical stream.
#[must_use]
pub fn pipe_pair(sid: u32) -> (PipeStream, PipeStream) {
    let remote: SocketAddr = ([127, 0, 0, 1], 0).into();
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        PipeStream {
            inner: a,
            sid,
            remote,
        },
        PipeStream {
            inner: b,
            sid,
            remote,
        },
    )
}

impl AsyncRead for PipeStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl TunnelStream for PipeStream {
    fn sid(&self) -> u32 {
        self.sid
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pipe_pair_carries_bytes() {
        let (mut a, mut b) = pipe_pair(9);
        assert_eq!(a.sid(), 9);
        assert_eq!(b.sid(), 9);

        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_boxed_stream_usable_as_trait_object() {
        let (a, mut b) = pipe_pair(1);
        let mut boxed: DynStream = Box::new(a);
        boxed.write_all(b"x").await.unwrap();
        boxed.shutdown().await.unwrap();

        let mut out = Vec::new();
        b.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"x");
    }

    #[test]
    fn test_stream_count_guard() {
        let count = Arc::new(StreamCount::default());
        let g1 = count.incr();
        let g2 = count.incr();
        assert_eq!(count.get(), 2);
        drop(g1);
        assert_eq!(count.get(), 1);
        drop(g2);
        assert_eq!(count.get(), 0);
    }
}
