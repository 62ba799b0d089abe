//! Byte-stream adapter between the mux and the KCP engine
//!
//! The mux wants an ordered byte stream; the engine speaks `Bytes` chunks
//! over channels. The adapter implements `AsyncRead`/`AsyncWrite` on top
//! of those channels, chunking writes to the configured frame size.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use super::engine::ENGINE_QUEUE;

/// The ordered byte stream a session's mux runs over
pub struct SessionAdapter {
    read_rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
    write_tx: PollSender<Bytes>,
    max_frame: usize,
}

impl SessionAdapter {
    /// Create the adapter plus the engine-facing channel ends:
    /// `(adapter, read_tx, write_rx)`
    pub(crate) fn new(max_frame: usize) -> (Self, mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        let (read_tx, read_rx) = mpsc::channel(ENGINE_QUEUE);
        let (write_tx, write_rx) = mpsc::channel(ENGINE_QUEUE);
        (
            Self {
                read_rx,
                pending: Bytes::new(),
                write_tx: PollSender::new(write_tx),
                max_frame: max_frame.max(1),
            },
            read_tx,
            write_rx,
        )
    }
}

impl AsyncRead for SessionAdapter {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            match self.read_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.pending = chunk,
                // Engine gone: EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for SessionAdapter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.write_tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = buf.len().min(self.max_frame);
                if self
                    .write_tx
                    .send_item(Bytes::copy_from_slice(&buf[..n]))
                    .is_err()
                {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.write_tx.close();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_read_reassembles_chunks() {
        let (mut adapter, read_tx, _write_rx) = SessionAdapter::new(1024);
        read_tx.send(Bytes::from_static(b"hello ")).await.unwrap();
        read_tx.send(Bytes::from_static(b"world")).await.unwrap();
        drop(read_tx);

        let mut out = Vec::new();
        adapter.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_write_chunks_to_frame_size() {
        let (mut adapter, _read_tx, mut write_rx) = SessionAdapter::new(4);
        adapter.write_all(b"abcdefghij").await.unwrap();

        let mut frames = Vec::new();
        for _ in 0..3 {
            frames.push(write_rx.recv().await.unwrap());
        }
        assert_eq!(frames[0].as_ref(), b"abcd");
        assert_eq!(frames[1].as_ref(), b"efgh");
        assert_eq!(frames[2].as_ref(), b"ij");
    }

    #[tokio::test]
    async fn test_short_read_keeps_remainder() {
        let (mut adapter, read_tx, _write_rx) = SessionAdapter::new(1024);
        read_tx.send(Bytes::from_static(b"abcdef")).await.unwrap();

        let mut small = [0u8; 4];
        adapter.read_exact(&mut small).await.unwrap();
        assert_eq!(&small, b"abcd");
        let mut rest = [0u8; 2];
        adapter.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"ef");
    }

    #[tokio::test]
    async fn test_write_after_engine_exit_fails() {
        let (mut adapter, _read_tx, write_rx) = SessionAdapter::new(1024);
        drop(write_rx);
        assert!(adapter.write_all(b"x").await.is_err());
    }
}
