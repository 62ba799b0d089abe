//! Connection pool and round-robin iterator
//!
//! The client keeps N sessions wrapped in [`TimedConn`]s: a session plus
//! its last successful ping. Stream opens select strictly round-robin over
//! live entries; a ticker pings every entry, prunes the dead, and
//! re-establishes replacements best-effort, one attempt per slot per tick.
//!
//! The item list is guarded by a single mutex held only across list
//! mutation and index advance, never across I/O.

mod timed_conn;

pub use timed_conn::{ConnState, TimedConn, MAX_PING_FAILURES};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::protocol::{read_proto, write_proto, Proto, ProtoKind};
use crate::session::Session;

/// How long a ping waits for its pong
pub const PING_DEADLINE: Duration = Duration::from_secs(10);

/// Ordered set of live client sessions with round-robin selection
pub struct ConnPool {
    items: Mutex<Items>,
}

struct Items {
    list: Vec<Arc<TimedConn>>,
    next: usize,
}

impl ConnPool {
    /// Create an empty pool
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Items {
                list: Vec::new(),
                next: 0,
            }),
        }
    }

    /// Append a connection; insertion order is selection order
    pub fn insert(&self, conn: Arc<TimedConn>) {
        self.items.lock().list.push(conn);
    }

    /// Select the next live connection, strict round-robin. Dead entries
    /// are skipped in O(1) each and left for the ticker to prune.
    pub fn select(&self) -> Result<Arc<TimedConn>, SessionError> {
        let mut items = self.items.lock();
        let len = items.list.len();
        for _ in 0..len {
            let idx = items.next % len;
            items.next = items.next.wrapping_add(1);
            let conn = &items.list[idx];
            if !conn.is_dead() {
                return Ok(Arc::clone(conn));
            }
        }
        Err(SessionError::NoTunnel)
    }

    /// Remove dead entries, returning them so the caller can close and log
    pub fn prune_dead(&self) -> Vec<Arc<TimedConn>> {
        let mut items = self.items.lock();
        let mut removed = Vec::new();
        items.list.retain(|conn| {
            if conn.is_dead() {
                removed.push(Arc::clone(conn));
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            items.next = 0;
        }
        removed
    }

    /// Total entries, live or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().list.len()
    }

    /// Whether the pool has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().list.is_empty()
    }

    /// Copy of the current item list, for ticking outside the lock
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<TimedConn>> {
        self.items.lock().list.clone()
    }

    /// Close every session in the pool
    pub fn close_all(&self) {
        for conn in self.snapshot() {
            conn.session().close();
        }
    }
}

impl Default for ConnPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one ping/pong probe over an ephemeral stream.
///
/// The pong must arrive on the same stream within [`PING_DEADLINE`] or the
/// probe counts as a failure.
pub async fn ping_once(session: &Session) -> Result<(), SessionError> {
    let mut stream = session.open_stream()?;
    let sid = crate::session::TunnelStream::sid(&stream);

    let probe = async {
        write_proto(&mut stream, &Proto::ping())
            .await
            .map_err(|e| SessionError::stream(sid, e.to_string()))?;
        let reply = read_proto(&mut stream)
            .await
            .map_err(|e| SessionError::stream(sid, e.to_string()))?;
        if reply.kind == ProtoKind::Pong {
            Ok(())
        } else {
            Err(SessionError::stream(sid, "expected pong"))
        }
    };

    match timeout(PING_DEADLINE, probe).await {
        Ok(result) => result,
        Err(_elapsed) => Err(SessionError::stream(sid, "ping deadline elapsed")),
    }
}

/// Drive the pool's keepalive and repair cycle until cancelled.
///
/// Each tick pings every entry concurrently, prunes dead entries, and
/// re-establishes missing slots via `redial`: at most one attempt per
/// slot per tick, logged on failure, no retry storm.
pub async fn run_ticker<F, Fut>(
    pool: Arc<ConnPool>,
    target: usize,
    interval: Duration,
    cancel: CancellationToken,
    redial: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Arc<TimedConn>, SessionError>>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The immediate first tick would ping sessions dialed microseconds ago.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let conns = pool.snapshot();
        let mut probes = Vec::with_capacity(conns.len());
        for conn in conns {
            probes.push(tokio::spawn(async move {
                match ping_once(conn.session()).await {
                    Ok(()) => {
                        conn.record_pong();
                        debug!("ping ok: peer={}", conn.session().peer_addr());
                    }
                    Err(e) => {
                        let failures = conn.record_ping_failure();
                        warn!(
                            "ping failed ({}/{}): peer={} {}",
                            failures,
                            MAX_PING_FAILURES,
                            conn.session().peer_addr(),
                            e
                        );
                    }
                }
            }));
        }
        for probe in probes {
            let _ = probe.await;
        }

        for dead in pool.prune_dead() {
            dead.session().close();
            info!("session removed from pool: peer={}", dead.session().peer_addr());
        }

        let live = pool.len();
        for _ in live..target {
            if cancel.is_cancelled() {
                break;
            }
            match redial().await {
                Ok(conn) => {
                    info!("session re-established: peer={}", conn.session().peer_addr());
                    pool.insert(conn);
                }
                Err(e) => {
                    warn!("session repair failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Pool selection logic is covered with real sessions in the
    // integration tests; here the list mechanics are exercised through
    // the public surface with a pool left empty.
    #[test]
    fn test_empty_pool_has_no_tunnel() {
        let pool = ConnPool::new();
        assert!(pool.is_empty());
        assert!(matches!(pool.select(), Err(SessionError::NoTunnel)));
        assert!(pool.prune_dead().is_empty());
    }
}
