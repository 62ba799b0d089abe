//! SOCKS front-end hook
//!
//! The SOCKS listener itself lives outside this crate; this is the handler
//! shape it plugs into: the client handle for opening streams and the
//! cancellation token its accept loop must observe.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::client::Client;

/// Largest SOCKS reply: header + address type + domain + port
pub const REPLY_BUF_SIZE: usize = 4 + 1 + 255 + 2;

/// Per-listener handler state for a SOCKS front-end
pub struct Handler {
    client: Arc<Client>,
    cancel: CancellationToken,
}

impl Handler {
    /// Bind a handler to the running client
    #[must_use]
    pub fn new(client: Arc<Client>, cancel: CancellationToken) -> Self {
        Self { client, cancel }
    }

    /// The client used to open tunnel streams
    #[must_use]
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// The token the front-end's loops observe
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}
