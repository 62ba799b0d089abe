//! TCP forward path
//!
//! Accept loop on the local listener; each accepted connection gets a
//! stream from the pool, a `Tcp` preamble carrying the configured target,
//! and a bidirectional byte bridge.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::config::ForwardRule;
use crate::io::bridge_streams;
use crate::net::Addr;
use crate::protocol::{write_proto, Proto};
use crate::session::TunnelStream;

pub(super) async fn listen_tcp(client: Arc<Client>, rule: ForwardRule, cancel: CancellationToken) {
    let (listen, target) = match (rule.listen_addr(), rule.target_addr()) {
        (Ok(l), Ok(t)) => (l, t),
        (Err(e), _) | (_, Err(e)) => {
            error!("TCP forwarder misconfigured: {}", e);
            return;
        }
    };

    let listener = match TcpListener::bind(listen).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind TCP listener on {}: {}", listen, e);
            return;
        }
    };
    info!("TCP forwarder listening on {} -> {}", listen, target);

    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            () = cancel.cancelled() => break,
        };
        match accepted {
            Ok((local, peer)) => {
                let client = Arc::clone(&client);
                let target = target.clone();
                let conn_cancel = cancel.child_token();
                tokio::spawn(async move {
                    handle_conn(client, local, peer, target, conn_cancel).await;
                });
            }
            Err(e) => {
                warn!("TCP accept failed on {}: {}", listen, e);
            }
        }
    }
    debug!("TCP forwarder stopped: {}", listen);
}

async fn handle_conn(
    client: Arc<Client>,
    mut local: TcpStream,
    peer: SocketAddr,
    target: Addr,
    cancel: CancellationToken,
) {
    let mut stream = match client.open_stream() {
        Ok(s) => s,
        Err(e) => {
            warn!("no stream for {} -> {}: {}", peer, target, e);
            return;
        }
    };
    let sid = stream.sid();

    if let Err(e) = write_proto(&mut stream, &Proto::tcp(target.clone())).await {
        warn!("failed to send preamble on stream {}: {}", sid, e);
        return;
    }
    info!("accepted TCP connection {} for {} -> {}", sid, peer, target);

    tokio::select! {
        result = bridge_streams(&mut local, &mut stream) => match result {
            Ok(copied) => {
                info!(
                    "TCP stream {} closed: {} -> {}, {} up / {} down bytes",
                    sid, peer, target, copied.local_to_remote, copied.remote_to_local
                );
            }
            Err(e) => {
                debug!("TCP stream {} failed for {} -> {}: {}", sid, peer, target, e);
            }
        },
        () = cancel.cancelled() => {
            debug!("TCP stream {} cancelled", sid);
        }
    }
}
