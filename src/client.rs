//! Tunnel client
//!
//! Owns the connection pool, the keepalive ticker, and the UDP flow map.
//! Forwarders borrow the client to open streams (round-robin with retry)
//! and to resolve UDP flows to their serving streams.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{PhantomError, SessionError, TransportError};
use crate::flow::{FlowEntry, UdpFlowMap};
use crate::net::Addr;
use crate::pcap::{PacketBind, PacketConn, PacketIo};
use crate::pool::{run_ticker, ConnPool, TimedConn};
use crate::protocol::{write_proto, Proto};
use crate::session::{DynStream, MuxTunnelStream, Session, SessionConfig, TunnelStream};

/// The client half of the tunnel
pub struct Client {
    cfg: Config,
    session_cfg: Arc<SessionConfig>,
    server_addr: SocketAddr,
    pool: Arc<ConnPool>,
    flows: UdpFlowMap,
    cancel: CancellationToken,
}

impl Client {
    /// Build a client from validated configuration
    pub fn new(cfg: Config, cancel: CancellationToken) -> Result<Arc<Self>, PhantomError> {
        let session_cfg = Arc::new(SessionConfig::from_config(&cfg)?);
        let server_addr = cfg.server.socket_addr()?;
        Ok(Arc::new(Self {
            cfg,
            session_cfg,
            server_addr,
            pool: Arc::new(ConnPool::new()),
            flows: UdpFlowMap::new(),
            cancel,
        }))
    }

    /// The root cancellation token the client runs under
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn source_ip(&self) -> Result<IpAddr, TransportError> {
        let bound = match self.server_addr.ip() {
            IpAddr::V4(_) => self.cfg.network.ipv4.addr,
            IpAddr::V6(_) => self.cfg.network.ipv6.addr,
        };
        bound.ok_or_else(|| {
            TransportError::Open("no source binding for the server address family".into())
        })
    }

    fn bind_transport(&self) -> Result<Arc<dyn PacketIo>, TransportError> {
        let params = PacketBind {
            carrier: self.cfg.pcap.carrier,
            local_ip: self.source_ip()?,
            local_port: None,
            remote: Some(self.server_addr),
            sockbuf: self.cfg.pcap.sockbuf,
        };
        Ok(Arc::new(PacketConn::bind(&params)?))
    }

    /// Dial one session on its own transport
    fn dial_conn(&self) -> Result<Arc<TimedConn>, SessionError> {
        let pconn = self
            .bind_transport()
            .map_err(|e| SessionError::dial(self.server_addr, e.to_string()))?;
        let session = Session::dial(pconn, self.server_addr, &self.session_cfg, &self.cancel)?;
        Ok(TimedConn::new(session))
    }

    /// Establish the initial sessions and start the keepalive ticker
    pub fn start(self: &Arc<Self>) -> Result<(), PhantomError> {
        let target = self.cfg.transport.conn;
        for i in 0..target {
            match self.dial_conn() {
                Ok(conn) => {
                    debug!("client connection {} established", i + 1);
                    self.pool.insert(conn);
                }
                Err(e) => {
                    warn!("failed to establish connection {}: {}", i + 1, e);
                    return Err(e.into());
                }
            }
        }

        let ticker_pool = Arc::clone(&self.pool);
        let ticker_cancel = self.cancel.clone();
        let interval = Duration::from_secs(self.cfg.mux.keepalive);
        let redial_client = Arc::clone(self);
        tokio::spawn(async move {
            run_ticker(ticker_pool, target, interval, ticker_cancel, move || {
                let client = Arc::clone(&redial_client);
                async move { client.dial_conn() }
            })
            .await;
        });

        let shutdown_client = Arc::clone(self);
        tokio::spawn(async move {
            shutdown_client.cancel.cancelled().await;
            shutdown_client.flows.close_all();
            shutdown_client.pool.close_all();
            info!("client shutdown complete");
        });

        let ipv4 = self
            .cfg
            .network
            .ipv4
            .addr
            .map_or_else(|| "<nil>".to_string(), |a| a.to_string());
        let ipv6 = self
            .cfg
            .network
            .ipv6
            .addr
            .map_or_else(|| "<nil>".to_string(), |a| a.to_string());
        info!(
            "Client started: IPv4:{} IPv6:{} -> {} ({} connections)",
            ipv4, ipv6, self.server_addr, self.pool.len()
        );
        Ok(())
    }

    /// Open an outbound stream: round-robin selection with one retry per
    /// live session. A session that closes mid-selection shows up as an
    /// `open_stream` failure and the next live session is tried; after as
    /// many retries as the pool holds, there is no tunnel.
    pub fn open_stream(&self) -> Result<MuxTunnelStream, SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        let attempts = self.pool.len().max(1);
        for _ in 0..attempts {
            let conn = self.pool.select()?;
            match conn.session().open_stream() {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(
                        "open_stream failed on {}: {}; retrying on next session",
                        conn.session().peer_addr(),
                        e
                    );
                }
            }
        }
        Err(SessionError::NoTunnel)
    }

    /// Resolve the UDP flow for `(caddr, target)`, opening and preambling
    /// a fresh stream when the flow is new.
    pub async fn udp(&self, caddr: &str, target: &Addr) -> Result<FlowEntry, PhantomError> {
        let taddr = target.to_string();
        self.flows
            .get_or_create(caddr, &taddr, || async {
                let mut stream = self.open_stream()?;
                write_proto(&mut stream, &Proto::udp(target.clone())).await?;
                debug!(
                    "UDP stream {} opened for {} -> {}",
                    stream.sid(),
                    caddr,
                    target
                );
                Ok(Box::new(stream) as DynStream)
            })
            .await
    }

    /// Tear down a UDP flow
    pub fn close_udp(&self, key: u64) {
        self.flows.close(key);
    }

    /// Live UDP flow count
    #[must_use]
    pub fn udp_flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Sessions currently in the pool
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.pool.len()
    }
}
