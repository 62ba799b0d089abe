//! I/O utilities
//!
//! Bidirectional copy for stream bridges and lock-free buffer pools for the
//! TCP copy and UDP datagram paths. The pools are the only process-wide
//! state in the crate: lazily initialized on first use, never torn down,
//! holding no external handles.

mod buffer;
mod copy;

pub use buffer::{tcp_pool, udp_pool, BytePool, PooledBuf, TCP_BUFFER_SIZE, UDP_BUFFER_SIZE};
pub use copy::{bridge_streams, CopyResult};
