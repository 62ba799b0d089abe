//! Client-side forwarders
//!
//! Each `forward[]` rule binds a local listener and shuttles bytes between
//! local peers and tunnel streams. Forwarder errors are per-stream: they
//! are logged and never aggregated across tasks.

mod tcp;
mod udp;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::Client;
use crate::config::{ForwardProto, ForwardRule};

/// One local listener bound to one forward rule
pub struct Forwarder {
    client: Arc<Client>,
    rule: ForwardRule,
}

impl Forwarder {
    /// Pair a rule with the client that serves it
    #[must_use]
    pub fn new(client: Arc<Client>, rule: ForwardRule) -> Self {
        Self { client, rule }
    }

    /// Bind the listener and run until cancelled. The spawned task owns
    /// the forwarder; listener failures are logged, not propagated.
    pub fn start(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        debug!(
            "starting {} forwarder: {} -> {}",
            self.rule.protocol, self.rule.listen, self.rule.target
        );
        tokio::spawn(async move {
            match self.rule.protocol {
                ForwardProto::Tcp => tcp::listen_tcp(self.client, self.rule, cancel).await,
                ForwardProto::Udp => udp::listen_udp(self.client, self.rule, cancel).await,
            }
        })
    }
}
