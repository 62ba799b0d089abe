//! Socket buffer sizing for the packet socket
//!
//! `SO_RCVBUF`/`SO_SNDBUF` come from `pcap.sockbuf`. The kernel may grant
//! less than requested (it doubles and caps against `net.core.*mem_max`);
//! the granted sizes are logged so undersized buffers are visible.

use socket2::Socket;
use tracing::{debug, warn};

use crate::error::TransportError;

/// Apply `pcap.sockbuf` to both directions of the socket and report what
/// the kernel actually granted.
pub fn apply_socket_buffers(socket: &Socket, sockbuf: usize) -> Result<(), TransportError> {
    socket
        .set_recv_buffer_size(sockbuf)
        .map_err(|e| TransportError::socket_option("SO_RCVBUF", e.to_string()))?;
    socket
        .set_send_buffer_size(sockbuf)
        .map_err(|e| TransportError::socket_option("SO_SNDBUF", e.to_string()))?;

    let rcv = socket
        .recv_buffer_size()
        .map_err(|e| TransportError::socket_option("SO_RCVBUF", e.to_string()))?;
    let snd = socket
        .send_buffer_size()
        .map_err(|e| TransportError::socket_option("SO_SNDBUF", e.to_string()))?;

    // Linux reports double the requested value when the request fits.
    if rcv < sockbuf {
        warn!(
            "SO_RCVBUF granted {} of {} requested bytes; check net.core.rmem_max",
            rcv, sockbuf
        );
    }
    if snd < sockbuf {
        warn!(
            "SO_SNDBUF granted {} of {} requested bytes; check net.core.wmem_max",
            snd, sockbuf
        );
    }
    debug!("packet socket buffers: rcv={} snd={}", rcv, snd);

    Ok(())
}
