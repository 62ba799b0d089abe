//! Lock-free byte buffer pools
//!
//! A `BytePool` hands out fixed-size `Vec<u8>` buffers through a
//! `crossbeam-queue` `ArrayQueue`; a dropped `PooledBuf` returns its buffer
//! to the pool or frees it when the pool is full. Checkout happens on the
//! task that will use the buffer and return happens on that same task.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use crossbeam_queue::ArrayQueue;

/// TCP copy buffer size
pub const TCP_BUFFER_SIZE: usize = 32 * 1024;
/// UDP datagram buffer size; covers any practical MTU up to the 64 KiB cap
pub const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// Buffers retained per pool
const POOL_CAPACITY: usize = 512;

/// A pool of fixed-size byte buffers
pub struct BytePool {
    queue: ArrayQueue<Vec<u8>>,
    buf_size: usize,
    allocations: AtomicU64,
    reuses: AtomicU64,
}

impl BytePool {
    /// Create a pool handing out `buf_size`-byte buffers
    #[must_use]
    pub fn new(capacity: usize, buf_size: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            buf_size,
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
        }
    }

    /// Check out a buffer, reusing a pooled one when available
    #[must_use]
    pub fn get(&'static self) -> PooledBuf {
        let buf = match self.queue.pop() {
            Some(buf) => {
                self.reuses.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.buf_size]
            }
        };
        PooledBuf {
            buf: Some(buf),
            pool: self,
        }
    }

    /// Size of the buffers this pool hands out
    #[must_use]
    pub const fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Number of fresh allocations so far
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of pooled reuses so far
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    fn put(&self, buf: Vec<u8>) {
        // Full pool: let the buffer drop.
        let _ = self.queue.push(buf);
    }
}

/// A checked-out buffer; returns itself to the pool on drop
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    pool: &'static BytePool,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

/// The shared TCP copy buffer pool
pub fn tcp_pool() -> &'static BytePool {
    static POOL: OnceLock<BytePool> = OnceLock::new();
    POOL.get_or_init(|| BytePool::new(POOL_CAPACITY, TCP_BUFFER_SIZE))
}

/// The shared UDP datagram buffer pool
pub fn udp_pool() -> &'static BytePool {
    static POOL: OnceLock<BytePool> = OnceLock::new();
    POOL.get_or_init(|| BytePool::new(POOL_CAPACITY, UDP_BUFFER_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool() -> &'static BytePool {
        static POOL: OnceLock<BytePool> = OnceLock::new();
        POOL.get_or_init(|| BytePool::new(4, 1024))
    }

    #[test]
    fn test_checkout_and_return() {
        let pool = test_pool();
        let before = pool.allocations();
        {
            let mut buf = pool.get();
            assert_eq!(buf.len(), 1024);
            buf[0] = 0xAA;
        }
        // The returned buffer is reused.
        let _buf = pool.get();
        assert!(pool.allocations() >= before);
        assert!(pool.reuses() >= 1);
    }

    #[test]
    fn test_global_pool_sizes() {
        assert_eq!(tcp_pool().buf_size(), TCP_BUFFER_SIZE);
        assert_eq!(udp_pool().buf_size(), UDP_BUFFER_SIZE);
        assert!(TCP_BUFFER_SIZE >= 32 * 1024);
        assert!(UDP_BUFFER_SIZE >= 1500);
    }

    #[test]
    fn test_overfull_pool_drops() {
        let pool = test_pool();
        let bufs: Vec<_> = (0..8).map(|_| pool.get()).collect();
        drop(bufs); // only 4 fit back; the rest are freed
        let held: Vec<_> = (0..8).map(|_| pool.get()).collect();
        assert_eq!(held.len(), 8);
    }
}
