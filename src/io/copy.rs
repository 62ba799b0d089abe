//! Bidirectional copy between two async streams
//!
//! Drives both directions of a byte bridge in a single future. A clean EOF
//! on one side half-closes that direction and lets the other continue; the
//! first real error tears the whole bridge down.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::buffer::{tcp_pool, PooledBuf};

/// Bytes moved by a completed bridge
#[derive(Debug, Clone, Copy)]
pub struct CopyResult {
    /// Bytes transferred from the local side to the remote side
    pub local_to_remote: u64,
    /// Bytes transferred from the remote side to the local side
    pub remote_to_local: u64,
}

impl CopyResult {
    /// Total bytes transferred in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.local_to_remote + self.remote_to_local
    }
}

/// One direction of the bridge
struct TransferState {
    buf: PooledBuf,
    read_done: bool,
    write_done: bool,
    pos: usize,
    cap: usize,
    bytes: u64,
}

impl TransferState {
    fn new() -> Self {
        Self {
            buf: tcp_pool().get(),
            read_done: false,
            write_done: false,
            pos: 0,
            cap: 0,
            bytes: 0,
        }
    }

    fn poll_transfer<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            if self.pos < self.cap {
                let n = match writer.as_mut().poll_write(cx, &self.buf[self.pos..self.cap]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write zero bytes",
                        )));
                    }
                    Poll::Ready(Ok(n)) => n,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                };
                self.pos += n;
                self.bytes += n as u64;
                if self.pos == self.cap {
                    self.pos = 0;
                    self.cap = 0;
                }
            } else if self.read_done {
                if !self.write_done {
                    match writer.as_mut().poll_flush(cx) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    match writer.as_mut().poll_shutdown(cx) {
                        Poll::Ready(Ok(())) => self.write_done = true,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                return Poll::Ready(Ok(()));
            } else {
                let mut read_buf = ReadBuf::new(&mut self.buf);
                match reader.as_mut().poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.cap = n;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
    }
}

struct BridgeStreams<'a, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    a: &'a mut A,
    b: &'a mut B,
    a_to_b: TransferState,
    b_to_a: TransferState,
    a_to_b_done: bool,
    b_to_a_done: bool,
}

impl<A, B> std::future::Future for BridgeStreams<'_, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    type Output = io::Result<CopyResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if !this.a_to_b_done {
            match this
                .a_to_b
                .poll_transfer(cx, Pin::new(&mut this.a), Pin::new(&mut this.b))
            {
                Poll::Ready(Ok(())) => this.a_to_b_done = true,
                // First error wins: tear the whole bridge down.
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {}
            }
        }

        if !this.b_to_a_done {
            match this
                .b_to_a
                .poll_transfer(cx, Pin::new(&mut this.b), Pin::new(&mut this.a))
            {
                Poll::Ready(Ok(())) => this.b_to_a_done = true,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {}
            }
        }

        if this.a_to_b_done && this.b_to_a_done {
            Poll::Ready(Ok(CopyResult {
                local_to_remote: this.a_to_b.bytes,
                remote_to_local: this.b_to_a.bytes,
            }))
        } else {
            Poll::Pending
        }
    }
}

/// Copy bytes both ways between `a` and `b` until both directions reach EOF
/// or either direction fails.
///
/// A clean EOF from one side shuts down the opposite writer and lets the
/// other direction drain. The first error (including a zero-length write)
/// aborts both directions and is returned; the caller closes both streams
/// by dropping them.
pub async fn bridge_streams<A, B>(a: &mut A, b: &mut B) -> io::Result<CopyResult>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    BridgeStreams {
        a,
        b,
        a_to_b: TransferState::new(),
        b_to_a: TransferState::new(),
        a_to_b_done: false,
        b_to_a_done: false,
    }
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bridge_moves_bytes_both_ways() {
        // app_a <-> side_a  bridged to  side_b <-> app_b
        let (mut app_a, mut side_a) = duplex(256);
        let (mut side_b, mut app_b) = duplex(256);

        let bridge = tokio::spawn(async move { bridge_streams(&mut side_a, &mut side_b).await });

        app_a.write_all(b"from a").await.unwrap();
        app_a.shutdown().await.unwrap();
        app_b.write_all(b"from b").await.unwrap();
        app_b.shutdown().await.unwrap();

        let mut got_b = Vec::new();
        app_b.read_to_end(&mut got_b).await.unwrap();
        assert_eq!(got_b, b"from a");

        let mut got_a = Vec::new();
        app_a.read_to_end(&mut got_a).await.unwrap();
        assert_eq!(got_a, b"from b");

        let result = bridge.await.unwrap().unwrap();
        assert_eq!(result.local_to_remote, 6);
        assert_eq!(result.remote_to_local, 6);
        assert_eq!(result.total(), 12);
    }

    #[tokio::test]
    async fn test_large_transfer_preserves_order() {
        let (mut app_a, mut side_a) = duplex(1024);
        let (mut side_b, mut app_b) = duplex(1024);

        let bridge = tokio::spawn(async move { bridge_streams(&mut side_a, &mut side_b).await });

        let payload: Vec<u8> = (0..=255u8).cycle().take(128 * 1024).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            app_a.write_all(&payload).await.unwrap();
            app_a.shutdown().await.unwrap();
            app_a
        });

        let mut got = Vec::new();
        app_b.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, expected);

        drop(app_b);
        let _ = writer.await.unwrap();
        let result = bridge.await.unwrap().unwrap();
        assert_eq!(result.local_to_remote, 128 * 1024);
    }

    #[tokio::test]
    async fn test_error_tears_down_bridge() {
        let (app_a, mut side_a) = duplex(64);
        let (mut side_b, mut app_b) = duplex(64);

        let bridge = tokio::spawn(async move { bridge_streams(&mut side_a, &mut side_b).await });

        // Dropping app_a makes writes toward the a side fail, so the
        // b-to-a direction hits a broken pipe and the first error wins.
        drop(app_a);
        app_b.write_all(b"x").await.unwrap();
        app_b.shutdown().await.unwrap();

        assert!(bridge.await.unwrap().is_err());
    }
}
