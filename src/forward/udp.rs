//! UDP forward path
//!
//! One socket per rule. Each datagram resolves its flow through the
//! client's flow map; the first datagram of a flow spawns a return-path
//! handler that reads the stream under an 8-second deadline and writes
//! back to the original client address. Deadline expiry, peer close, or
//! cancellation ends the handler, which tears the flow down.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::config::ForwardRule;
use crate::flow::{UdpFlow, UDP_IDLE_TIMEOUT};
use crate::io::udp_pool;
use crate::net::Addr;
use crate::session::DynStream;

pub(super) async fn listen_udp(client: Arc<Client>, rule: ForwardRule, cancel: CancellationToken) {
    let (listen, target) = match (rule.listen_addr(), rule.target_addr()) {
        (Ok(l), Ok(t)) => (l, t),
        (Err(e), _) | (_, Err(e)) => {
            error!("UDP forwarder misconfigured: {}", e);
            return;
        }
    };

    let socket = match UdpSocket::bind(listen).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("failed to bind UDP socket on {}: {}", listen, e);
            return;
        }
    };
    info!("UDP forwarder listening on {} -> {}", listen, target);

    let mut buf = udp_pool().get();
    loop {
        let received = tokio::select! {
            r = socket.recv_from(&mut buf) => r,
            () = cancel.cancelled() => break,
        };
        let (n, caddr) = match received {
            Ok(ok) => ok,
            Err(e) => {
                warn!("UDP receive failed on {}: {}", listen, e);
                continue;
            }
        };
        if n == 0 {
            continue;
        }

        let entry = match client.udp(&caddr.to_string(), &target).await {
            Ok(entry) => entry,
            Err(e) => {
                error!(
                    "failed to establish UDP flow for {} -> {}: {}",
                    caddr, target, e
                );
                continue;
            }
        };

        if let Err(e) = entry.flow.forward(&buf[..n]).await {
            error!(
                "failed to forward {} bytes from {} -> {}: {}",
                n, caddr, target, e
            );
            client.close_udp(entry.key);
            continue;
        }

        if let Some(reader) = entry.reader {
            info!(
                "accepted UDP flow {} for {} -> {}",
                entry.flow.sid(),
                caddr,
                target
            );
            let client = Arc::clone(&client);
            let socket = Arc::clone(&socket);
            let flow = Arc::clone(&entry.flow);
            let target = target.clone();
            let key = entry.key;
            let flow_cancel = cancel.child_token();
            tokio::spawn(async move {
                return_path(&client, flow, reader, socket, caddr, &target, key, flow_cancel).await;
            });
        }
    }
    debug!("UDP forwarder stopped: {}", listen);
}

/// Shuttle datagrams stream→socket until the flow goes idle or closes
#[allow(clippy::too_many_arguments)]
async fn return_path(
    client: &Client,
    flow: Arc<UdpFlow>,
    mut reader: ReadHalf<DynStream>,
    socket: Arc<UdpSocket>,
    caddr: SocketAddr,
    target: &Addr,
    key: u64,
    cancel: CancellationToken,
) {
    let sid = flow.sid();
    let mut buf = udp_pool().get();

    loop {
        let read = tokio::select! {
            r = timeout(UDP_IDLE_TIMEOUT, reader.read(&mut buf)) => r,
            () = flow.closed() => break,
            () = cancel.cancelled() => break,
        };
        match read {
            Err(_elapsed) => {
                debug!("UDP flow {} idle for {:?}", sid, UDP_IDLE_TIMEOUT);
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                if let Err(e) = socket.send_to(&buf[..n], caddr).await {
                    warn!("UDP reply to {} failed: {}", caddr, e);
                    break;
                }
            }
            Ok(Err(e)) => {
                debug!("UDP flow {} failed for {} -> {}: {}", sid, caddr, target, e);
                break;
            }
        }
    }

    client.close_udp(key);
    debug!("UDP stream {} closed for {} -> {}", sid, caddr, target);
}
