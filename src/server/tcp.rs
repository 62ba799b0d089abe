//! Server-side TCP bridge
//!
//! Dial the target named in the preamble with a 10-second timeout, then
//! copy bytes both ways until either side finishes. Dial failures close
//! the stream; there is no in-band error payload.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::ServerError;
use crate::io::bridge_streams;
use crate::net::Addr;
use crate::session::TunnelStream;

/// Dial timeout for TCP targets
pub const TCP_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub(super) async fn handle<S: TunnelStream>(mut stream: S, target: &Addr, cancel: CancellationToken) {
    let sid = stream.sid();
    info!(
        "accepted TCP stream {}: {} -> {}",
        sid,
        stream.remote_addr(),
        target
    );

    let dial = timeout(TCP_DIAL_TIMEOUT, TcpStream::connect(target.to_string())).await;
    let mut conn = match dial {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            error!("{}", ServerError::dial(target.to_string(), sid, e.to_string()));
            return;
        }
        Err(_elapsed) => {
            error!(
                "{}",
                ServerError::dial(target.to_string(), sid, "dial timeout")
            );
            return;
        }
    };
    debug!("TCP connection established to {} for stream {}", target, sid);

    tokio::select! {
        result = bridge_streams(&mut stream, &mut conn) => match result {
            Ok(copied) => {
                info!(
                    "TCP stream {} to {} closed: {} in / {} out bytes",
                    sid, target, copied.local_to_remote, copied.remote_to_local
                );
            }
            Err(e) => {
                error!("TCP stream {} to {} failed: {}", sid, target, e);
            }
        },
        () = cancel.cancelled() => {
            debug!("TCP stream {} cancelled", sid);
        }
    }
    debug!("closed TCP connection {} for stream {}", target, sid);
}
