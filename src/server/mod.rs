//! Tunnel server
//!
//! Accept loop over sessions from the packet-socket listener; per session,
//! an accept loop over streams; per stream, one preamble read and a
//! dispatch by type. Stream-scoped failures close only that stream.

mod tcp;
mod udp;

pub use tcp::TCP_DIAL_TIMEOUT;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ForwardRule};
use crate::error::PhantomError;
use crate::pcap::{PacketBind, PacketConn, PacketIo};
use crate::protocol::{read_proto, write_proto, Proto, ProtoKind};
use crate::session::{Listener, MuxTunnelStream, Session, SessionConfig, TunnelStream};

/// How long a stream may take to deliver its preamble
const PREAMBLE_DEADLINE: Duration = Duration::from_secs(10);

/// The server half of the tunnel
pub struct Server {
    cfg: Config,
    session_cfg: Arc<SessionConfig>,
}

impl Server {
    /// Build a server from validated configuration
    pub fn new(cfg: Config) -> Result<Self, PhantomError> {
        let session_cfg = Arc::new(SessionConfig::from_config(&cfg)?);
        Ok(Self { cfg, session_cfg })
    }

    /// Bind the packet socket and serve sessions until cancelled
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PhantomError> {
        let bind = self.cfg.server.socket_addr()?;
        let params = PacketBind {
            carrier: self.cfg.pcap.carrier,
            local_ip: bind.ip(),
            local_port: Some(bind.port()),
            remote: None,
            sockbuf: self.cfg.pcap.sockbuf,
        };
        let pconn: Arc<dyn PacketIo> = Arc::new(PacketConn::bind(&params)?);

        let listener = Listener::listen(pconn, Arc::clone(&self.session_cfg), &cancel);
        info!(
            "Server listening on {} (carrier {})",
            bind, self.cfg.pcap.carrier
        );

        loop {
            match listener.accept().await {
                Ok(session) => {
                    let session_cancel = cancel.child_token();
                    tokio::spawn(async move {
                        run_session(session, session_cancel).await;
                    });
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!("session accept failed: {}", e);
                    break;
                }
            }
        }

        listener.close();
        info!("server stopped");
        Ok(())
    }
}

/// Accept streams on one session until it dies
async fn run_session(session: Arc<Session>, cancel: CancellationToken) {
    // Forward rules learned from the client over `TcpForward` streams.
    let rules: Arc<Mutex<Vec<ForwardRule>>> = Arc::new(Mutex::new(Vec::new()));

    loop {
        let stream = tokio::select! {
            s = session.accept_stream() => s,
            () = cancel.cancelled() => break,
        };
        match stream {
            Ok(stream) => {
                let rules = Arc::clone(&rules);
                let stream_cancel = cancel.child_token();
                tokio::spawn(async move {
                    handle_stream(stream, &rules, stream_cancel).await;
                });
            }
            Err(e) => {
                debug!("session {} stream accept ended: {}", session.peer_addr(), e);
                break;
            }
        }
    }

    session.close();
    info!("session closed: peer={}", session.peer_addr());
}

/// Read one preamble, then dispatch. Dropping the stream closes it.
async fn handle_stream(
    mut stream: MuxTunnelStream,
    rules: &Mutex<Vec<ForwardRule>>,
    cancel: CancellationToken,
) {
    let sid = stream.sid();

    let proto = match timeout(PREAMBLE_DEADLINE, read_proto(&mut stream)).await {
        Ok(Ok(proto)) => proto,
        Ok(Err(e)) => {
            warn!("malformed preamble on stream {}: {}", sid, e);
            return;
        }
        Err(_elapsed) => {
            warn!("stream {} sent no preamble within {:?}", sid, PREAMBLE_DEADLINE);
            return;
        }
    };

    match proto.kind {
        ProtoKind::Ping => {
            if let Err(e) = write_proto(&mut stream, &Proto::pong()).await {
                debug!("pong on stream {} failed: {}", sid, e);
            }
        }
        ProtoKind::Pong => {
            warn!("unexpected pong preamble on stream {}", sid);
        }
        ProtoKind::TcpForward => {
            if let Some(tcpf) = proto.tcpf {
                info!("registered {} forward rules from stream {}", tcpf.len(), sid);
                rules.lock().extend(tcpf);
            }
        }
        ProtoKind::Tcp => {
            if let Some(addr) = proto.addr {
                tcp::handle(stream, &addr, cancel).await;
            }
        }
        ProtoKind::Udp => {
            if let Some(addr) = proto.addr {
                udp::handle(stream, &addr, cancel).await;
            }
        }
    }
}
