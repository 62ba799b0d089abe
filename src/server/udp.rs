//! Server-side UDP bridge
//!
//! A connected UDP socket per stream; the stream carries datagrams as its
//! byte chunks. Two tasks copy one direction each; the first to finish
//! tears the bridge down.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::ServerError;
use crate::io::udp_pool;
use crate::net::Addr;
use crate::session::TunnelStream;

pub(super) async fn handle<S: TunnelStream + 'static>(
    stream: S,
    target: &Addr,
    cancel: CancellationToken,
) {
    let sid = stream.sid();
    info!(
        "accepted UDP stream {}: {} -> {}",
        sid,
        stream.remote_addr(),
        target
    );

    let socket = match dial_udp(target).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            error!("{}", ServerError::dial(target.to_string(), sid, e.to_string()));
            return;
        }
    };
    debug!("UDP connection established to {} for stream {}", target, sid);

    let (mut reader, mut writer) = tokio::io::split(stream);

    let outbound_socket = Arc::clone(&socket);
    let mut outbound = tokio::spawn(async move {
        let mut buf = udp_pool().get();
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if outbound_socket.send(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let inbound_socket = Arc::clone(&socket);
    let mut inbound = tokio::spawn(async move {
        let mut buf = udp_pool().get();
        loop {
            match inbound_socket.recv(&mut buf).await {
                Ok(n) => {
                    if writer.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    tokio::select! {
        _ = &mut outbound => {}
        _ = &mut inbound => {}
        () = cancel.cancelled() => {}
    }
    outbound.abort();
    inbound.abort();

    info!("UDP stream {} to {} closed", sid, target);
}

/// Dial the UDP target: resolve, bind the matching family, connect.
async fn dial_udp(target: &Addr) -> std::io::Result<UdpSocket> {
    let resolved: SocketAddr = match target.to_socket_addr() {
        Some(sa) => sa,
        None => tokio::net::lookup_host(target.to_string())
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
            })?,
    };
    let bind: SocketAddr = if resolved.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(resolved).await?;
    Ok(socket)
}
