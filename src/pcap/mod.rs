//! Packet-socket transport
//!
//! A [`PacketConn`] presents the three operations KCP requires of a
//! datagram socket (`read_from`, `write_to`, `close`) on top of a raw
//! socket, synthesizing the outer transport framing on egress and
//! filtering/stripping it on ingress. The [`PacketIo`] trait is the seam
//! between this module and the session layer; tests substitute an
//! in-memory implementation.

mod packet_conn;
mod sockopt;

pub use packet_conn::{PacketBind, PacketConn};
pub use sockopt::apply_socket_buffers;

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::TransportError;

/// The datagram contract the session layer consumes
#[async_trait]
pub trait PacketIo: Send + Sync + 'static {
    /// Receive one carried datagram, returning its length and the peer
    /// endpoint taken from the outer headers
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), TransportError>;

    /// Wrap one datagram in outer framing and transmit it to `remote`
    async fn write_to(&self, payload: &[u8], remote: SocketAddr) -> Result<usize, TransportError>;

    /// The local endpoint synthesized into outgoing frames
    fn local_addr(&self) -> SocketAddr;

    /// Close the transport; pending and future reads fail with `Closed`
    fn close(&self);
}
