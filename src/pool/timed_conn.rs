//! A session paired with liveness metadata

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::session::Session;

/// Consecutive ping failures after which a connection is dead
pub const MAX_PING_FAILURES: u32 = 3;

/// Liveness state of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Pings are succeeding
    Live,
    /// One or two consecutive ping failures
    Degraded,
    /// Terminal; the entry is removed on the next tick
    Dead,
}

/// A session plus its last-successful-ping timestamp.
///
/// A `TimedConn` is removed from the pool iff its session is terminally
/// closed.
pub struct TimedConn {
    session: Arc<Session>,
    last_ping: Mutex<Instant>,
    failures: AtomicU32,
}

impl TimedConn {
    /// Wrap a freshly dialed session
    #[must_use]
    pub fn new(session: Arc<Session>) -> Arc<Self> {
        Arc::new(Self {
            session,
            last_ping: Mutex::new(Instant::now()),
            failures: AtomicU32::new(0),
        })
    }

    /// The wrapped session
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Stamp a successful ping
    pub fn record_pong(&self) {
        self.failures.store(0, Ordering::Relaxed);
        *self.last_ping.lock() = Instant::now();
    }

    /// Count a failed ping; at [`MAX_PING_FAILURES`] the session is closed
    /// and the connection becomes dead. Returns the new failure count.
    pub fn record_ping_failure(&self) -> u32 {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= MAX_PING_FAILURES {
            self.session.close();
        }
        failures
    }

    /// When the last pong arrived
    #[must_use]
    pub fn last_ping(&self) -> Instant {
        *self.last_ping.lock()
    }

    /// Current liveness state
    #[must_use]
    pub fn state(&self) -> ConnState {
        if self.is_dead() {
            ConnState::Dead
        } else if self.failures.load(Ordering::Relaxed) > 0 {
            ConnState::Degraded
        } else {
            ConnState::Live
        }
    }

    /// Terminal check: the session is closed or pings have run out
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.session.is_closed() || self.failures.load(Ordering::Relaxed) >= MAX_PING_FAILURES
    }
}
