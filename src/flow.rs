//! UDP flow-to-stream mapping
//!
//! Each UDP flow, one (client source, target) pair, is served by one
//! logical stream. The key is a 64-bit hash of the two endpoint strings;
//! collisions are treated as identity (negligible at expected scale).
//!
//! The map's mutex is held only across map mutation. Stream creation runs
//! without the lock, with a double-check on insert: if another task won
//! the race, its flow is used and the freshly opened stream is dropped.
//! Idle expiry is driven by the return-path handler's 8-second read
//! deadline rather than a separate sweeper.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::PhantomError;
use crate::session::DynStream;

/// A flow is closed after this long without a datagram in either direction
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(8);

/// FNV-1a over the concatenated source and target endpoint strings
#[must_use]
pub fn flow_key(caddr: &str, taddr: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in caddr.bytes().chain(taddr.bytes()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// One live UDP flow: the write half of its serving stream
pub struct UdpFlow {
    key: u64,
    sid: u32,
    writer: tokio::sync::Mutex<WriteHalf<DynStream>>,
    cancel: CancellationToken,
}

impl UdpFlow {
    /// Stream id of the serving stream
    #[must_use]
    pub const fn sid(&self) -> u32 {
        self.sid
    }

    /// Flow key
    #[must_use]
    pub const fn key(&self) -> u64 {
        self.key
    }

    /// Forward one datagram into the stream. Writes block under mux flow
    /// control; an overloaded target stalls the local reader, no drops.
    pub async fn forward(&self, datagram: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(datagram).await
    }

    /// Signal the return-path handler to exit
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Resolves when the flow is closed
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

/// What `get_or_create` produced
pub struct FlowEntry {
    /// The flow serving this (source, target) pair
    pub flow: Arc<UdpFlow>,
    /// Read half of the new stream; present iff the flow was just created,
    /// and owned by the return-path handler the caller must spawn
    pub reader: Option<ReadHalf<DynStream>>,
    /// The flow key, for `close`
    pub key: u64,
}

/// Client-side mapping from flow key to serving stream
pub struct UdpFlowMap {
    flows: Mutex<HashMap<u64, Arc<UdpFlow>>>,
}

impl UdpFlowMap {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
        }
    }

    /// Look up the flow for `(caddr, taddr)`, opening a stream via `open`
    /// when absent. Two-phase: the lock is never held across `open`.
    pub async fn get_or_create<F, Fut>(
        &self,
        caddr: &str,
        taddr: &str,
        open: F,
    ) -> Result<FlowEntry, PhantomError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DynStream, PhantomError>>,
    {
        let key = flow_key(caddr, taddr);

        if let Some(flow) = self.flows.lock().get(&key) {
            return Ok(FlowEntry {
                flow: Arc::clone(flow),
                reader: None,
                key,
            });
        }

        // Slow path: open the stream without the lock.
        let stream = open().await?;
        let sid = stream.sid();
        let (reader, writer) = tokio::io::split(stream);
        let flow = Arc::new(UdpFlow {
            key,
            sid,
            writer: tokio::sync::Mutex::new(writer),
            cancel: CancellationToken::new(),
        });

        let mut flows = self.flows.lock();
        if let Some(existing) = flows.get(&key) {
            // Another packet for the same flow won the race; reuse its
            // stream and let ours drop.
            debug!("duplicate flow creation for key {:#018x}, reusing", key);
            return Ok(FlowEntry {
                flow: Arc::clone(existing),
                reader: None,
                key,
            });
        }
        flows.insert(key, Arc::clone(&flow));
        drop(flows);

        Ok(FlowEntry {
            flow,
            reader: Some(reader),
            key,
        })
    }

    /// Remove the flow if present and close it
    pub fn close(&self, key: u64) {
        let removed = self.flows.lock().remove(&key);
        if let Some(flow) = removed {
            flow.close();
            debug!("UDP flow closed: key={:#018x} sid={}", key, flow.sid());
        }
    }

    /// Number of live flows
    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.lock().len()
    }

    /// Whether no flows are live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flows.lock().is_empty()
    }

    /// Close every flow (shutdown path)
    pub fn close_all(&self) {
        let drained: Vec<_> = self.flows.lock().drain().collect();
        for (_, flow) in drained {
            flow.close();
        }
    }
}

impl Default for UdpFlowMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{pipe_pair, DynStream};
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_flow_key_is_stable_and_distinct() {
        let a = flow_key("127.0.0.1:5000", "10.0.0.1:53");
        let b = flow_key("127.0.0.1:5000", "10.0.0.1:53");
        let c = flow_key("127.0.0.1:5001", "10.0.0.1:53");
        let d = flow_key("127.0.0.1:5000", "10.0.0.1:54");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_ne!(c, d);
    }

    #[test]
    fn test_flow_key_concatenation_order_matters() {
        assert_ne!(flow_key("ab", "c"), flow_key("a", "bc"));
    }

    #[tokio::test]
    async fn test_same_key_reuses_stream() {
        let map = UdpFlowMap::new();

        let first = map
            .get_or_create("127.0.0.1:5000", "10.0.0.1:53", || async {
                let (a, _b) = pipe_pair(1);
                Ok(Box::new(a) as DynStream)
            })
            .await
            .unwrap();
        assert!(first.reader.is_some());
        assert_eq!(first.flow.sid(), 1);

        let second = map
            .get_or_create("127.0.0.1:5000", "10.0.0.1:53", || async {
                panic!("must not open a second stream for the same flow");
            })
            .await
            .unwrap();
        assert!(second.reader.is_none());
        assert_eq!(second.flow.sid(), 1);
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn test_forward_reaches_peer() {
        let map = UdpFlowMap::new();
        let (a, mut b) = pipe_pair(7);

        let entry = map
            .get_or_create("src", "dst", || async { Ok(Box::new(a) as DynStream) })
            .await
            .unwrap();

        entry.flow.forward(b"datagram").await.unwrap();
        let mut buf = [0u8; 8];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"datagram");
    }

    #[tokio::test]
    async fn test_close_removes_and_signals() {
        let map = UdpFlowMap::new();
        let entry = map
            .get_or_create("src", "dst", || async {
                let (a, _b) = pipe_pair(3);
                Ok(Box::new(a) as DynStream)
            })
            .await
            .unwrap();

        let flow = Arc::clone(&entry.flow);
        map.close(entry.key);
        assert!(map.is_empty());
        // The close signal reaches waiting handlers.
        flow.closed().await;
    }

    #[tokio::test]
    async fn test_close_absent_key_is_noop() {
        let map = UdpFlowMap::new();
        map.close(0xdead_beef);
        assert!(map.is_empty());
    }
}
