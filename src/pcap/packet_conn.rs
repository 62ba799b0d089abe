//! Raw-socket packet transport
//!
//! Opens a raw socket for the carrier protocol, binds it to the configured
//! source address, and moves KCP datagrams through synthesized outer
//! frames. IPv4 sockets run with `IP_HDRINCL`, so egress frames carry a
//! full IP header and ingress frames arrive with one; IPv6 raw sockets
//! exchange bare transport segments and the kernel owns the IP header.
//!
//! The read loop is a single producer; writes may happen concurrently from
//! any task. No locks are held around either operation.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use rand::Rng;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::sockopt::apply_socket_buffers;
use super::PacketIo;
use crate::error::TransportError;
use crate::wire::{
    build_ipv4_frame, build_ipv6_segment, parse_ipv4_frame, parse_segment, Carrier, FrameSpec,
};

/// Ephemeral range for the synthesized local port
const PORT_RANGE: std::ops::Range<u16> = 32768..60999;

/// Parameters for opening a packet transport
#[derive(Debug, Clone)]
pub struct PacketBind {
    /// Outer carrier protocol
    pub carrier: Carrier,
    /// Source IP the outer headers advertise; also the raw-socket bind
    pub local_ip: IpAddr,
    /// Synthesized local port; `None` picks a random ephemeral port
    pub local_port: Option<u16>,
    /// Expected peer; ingress from other endpoints is dropped. `None`
    /// accepts any peer (server side).
    pub remote: Option<SocketAddr>,
    /// `SO_RCVBUF`/`SO_SNDBUF` in bytes
    pub sockbuf: usize,
}

/// A packet-oriented datagram transport over a raw socket
pub struct PacketConn {
    io: AsyncFd<Socket>,
    carrier: Carrier,
    local: SocketAddr,
    remote: Option<SocketAddr>,
    seq: AtomicU32,
    ident: AtomicU32,
    closed: CancellationToken,
}

impl PacketConn {
    /// Open the raw socket and prepare it for tunnel traffic
    pub fn bind(params: &PacketBind) -> Result<Self, TransportError> {
        let domain = match params.local_ip {
            IpAddr::V4(_) => Domain::IPV4,
            IpAddr::V6(_) => Domain::IPV6,
        };
        let protocol = match params.carrier {
            Carrier::Tcp => Protocol::TCP,
            Carrier::Udp => Protocol::UDP,
        };

        let socket = Socket::new(domain, Type::RAW, Some(protocol))
            .map_err(|e| TransportError::Open(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::socket_option("O_NONBLOCK", e.to_string()))?;
        if params.local_ip.is_ipv4() {
            socket
                .set_header_included_v4(true)
                .map_err(|e| TransportError::socket_option("IP_HDRINCL", e.to_string()))?;
        }
        apply_socket_buffers(&socket, params.sockbuf)?;

        let bind_addr = SocketAddr::new(params.local_ip, 0);
        socket.bind(&SockAddr::from(bind_addr)).map_err(|e| TransportError::Bind {
            addr: bind_addr,
            reason: e.to_string(),
        })?;

        let port = params
            .local_port
            .unwrap_or_else(|| rand::thread_rng().gen_range(PORT_RANGE));
        let local = SocketAddr::new(params.local_ip, port);

        let io = AsyncFd::new(socket).map_err(|e| TransportError::Open(e.to_string()))?;

        debug!(
            "packet socket open: {} carrier={} remote={:?}",
            local, params.carrier, params.remote
        );

        Ok(Self {
            io,
            carrier: params.carrier,
            local,
            remote: params.remote,
            seq: AtomicU32::new(rand::thread_rng().gen()),
            ident: AtomicU32::new(rand::thread_rng().gen()),
            closed: CancellationToken::new(),
        })
    }

    /// Whether the transport has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Filter one received frame; `None` means drop it silently
    fn filter_frame(&self, buf: &mut [u8], n: usize, peer_ip: IpAddr) -> Option<(usize, SocketAddr)> {
        let (src, dst_port, payload) = match self.local.ip() {
            IpAddr::V4(_) => {
                let parsed = parse_ipv4_frame(self.carrier, &buf[..n]).ok()?;
                (parsed.src, parsed.dst.port(), parsed.payload)
            }
            IpAddr::V6(_) => {
                let seg = parse_segment(self.carrier, &buf[..n]).ok()?;
                (
                    SocketAddr::new(peer_ip, seg.src_port),
                    seg.dst_port,
                    seg.payload,
                )
            }
        };

        if dst_port != self.local.port() {
            return None;
        }
        if let Some(expected) = self.remote {
            if src != expected {
                return None;
            }
        }

        let len = payload.len();
        buf.copy_within(payload, 0);
        Some((len, src))
    }
}

#[async_trait]
impl PacketIo for PacketConn {
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), TransportError> {
        loop {
            let mut guard = tokio::select! {
                guard = self.io.readable() => guard.map_err(TransportError::IoError)?,
                () = self.closed.cancelled() => return Err(TransportError::Closed),
            };

            let result = guard.try_io(|inner| {
                // socket2 reads into MaybeUninit; the cast is the documented
                // pattern for reusing an initialized buffer.
                let uninit = unsafe {
                    &mut *(std::ptr::from_mut::<[u8]>(buf) as *mut [MaybeUninit<u8>])
                };
                inner.get_ref().recv_from(uninit)
            });

            match result {
                Ok(Ok((n, peer))) => {
                    let peer_ip = peer
                        .as_socket()
                        .map_or_else(|| self.local.ip(), |sa| sa.ip());
                    if let Some((len, src)) = self.filter_frame(buf, n, peer_ip) {
                        trace!("packet in: {} bytes from {}", len, src);
                        return Ok((len, src));
                    }
                    // Not ours; keep reading.
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => {
                    self.close();
                    return Err(TransportError::IoError(e));
                }
                Err(_would_block) => {}
            }
        }
    }

    async fn write_to(&self, payload: &[u8], remote: SocketAddr) -> Result<usize, TransportError> {
        let spec = FrameSpec {
            carrier: self.carrier,
            src: self.local,
            dst: remote,
            seq: self.seq.fetch_add(payload.len() as u32, Ordering::Relaxed),
            ident: self.ident.fetch_add(1, Ordering::Relaxed) as u16,
            payload,
        };

        let mut frame = Vec::new();
        match remote.ip() {
            IpAddr::V4(_) => build_ipv4_frame(&spec, &mut frame),
            IpAddr::V6(_) => build_ipv6_segment(&spec, &mut frame),
        }
        .map_err(|e| TransportError::IoError(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            e.to_string(),
        )))?;

        // Raw sockets ignore the port; the forged headers carry it.
        let dst = SockAddr::from(SocketAddr::new(remote.ip(), 0));

        loop {
            let mut guard = tokio::select! {
                guard = self.io.writable() => guard.map_err(TransportError::IoError)?,
                () = self.closed.cancelled() => return Err(TransportError::Closed),
            };

            match guard.try_io(|inner| inner.get_ref().send_to(&frame, &dst)) {
                Ok(Ok(_)) => {
                    trace!("packet out: {} bytes to {}", payload.len(), remote);
                    return Ok(payload.len());
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => return Err(TransportError::IoError(e)),
                Err(_would_block) => {}
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

impl Drop for PacketConn {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_params_shape() {
        let params = PacketBind {
            carrier: Carrier::Tcp,
            local_ip: "192.0.2.1".parse().unwrap(),
            local_port: Some(40000),
            remote: Some("198.51.100.1:4500".parse().unwrap()),
            sockbuf: 4 * 1024 * 1024,
        };
        // Raw sockets need CAP_NET_RAW; only exercise parameter plumbing
        // here. Frame synthesis/parsing is covered offline in `wire`.
        assert_eq!(params.carrier, Carrier::Tcp);
        assert!(params.remote.is_some());
    }
}
