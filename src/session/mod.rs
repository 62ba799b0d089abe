//! Reliable multiplexed sessions
//!
//! A [`Session`] is one client↔server channel: a packet transport, a KCP
//! endpoint for reliable delivery, and a stream multiplexer on top. The
//! client dials sessions; the server's [`Listener`] demultiplexes inbound
//! datagrams by peer and conversation id and yields sessions as they
//! appear.
//!
//! Composition order: `PacketConn` → KCP engine (+ per-datagram sealing) →
//! mux. Streams are handed out as [`MuxTunnelStream`] with session-scoped
//! 32-bit ids.

mod adapter;
mod engine;
mod stream;

pub use adapter::SessionAdapter;
pub use stream::{pipe_pair, DynStream, MuxTunnelStream, PipeStream, StreamCount, TunnelStream};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_smux::{MuxAcceptor, MuxBuilder, MuxConnector};
use bytes::Bytes;
use kcp_tokio::config::NodeDelayConfig;
use kcp_tokio::KcpConfig;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, KcpSettings, MuxSettings};
use crate::crypto::{CipherKind, DatagramCipher};
use crate::error::{ConfigError, SessionError};
use crate::pcap::PacketIo;
use crate::wire::{IPV4_HEADER_LEN, IPV6_HEADER_LEN};

use engine::{run_engine, ENGINE_QUEUE};

/// Queue depth for mux frames, matching the engine side
const MUX_QUEUE: usize = 8192;

/// Everything a session needs beyond its transport
pub struct SessionConfig {
    /// KCP endpoint settings
    pub kcp: KcpSettings,
    /// Mux settings
    pub mux: MuxSettings,
    /// Per-datagram cipher shared by every session
    pub cipher: Arc<DatagramCipher>,
    /// Largest KCP datagram that fits the carrier MTU after outer headers
    /// and cipher overhead
    pub max_payload: usize,
}

impl SessionConfig {
    /// Derive session settings from the loaded configuration
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        let cipher = if cfg.kcp.block == CipherKind::None {
            DatagramCipher::new(CipherKind::None, &[0u8; 32])
        } else {
            DatagramCipher::new(cfg.kcp.block, &cfg.encryption.key_bytes()?)
        };

        if cfg.kcp.pshard > 0 {
            warn!(
                "kcp.dshard/pshard configured ({}/{}) but this endpoint does not emit parity shards; relying on ARQ",
                cfg.kcp.dshard, cfg.kcp.pshard
            );
        }

        let server = cfg.server.socket_addr()?;
        let ip_header = if server.is_ipv4() {
            IPV4_HEADER_LEN
        } else {
            IPV6_HEADER_LEN
        };
        let overhead = ip_header + cfg.pcap.carrier.header_len() + cipher.overhead();
        let max_payload = (cfg.kcp.mtu as usize)
            .checked_sub(overhead)
            .filter(|p| *p >= 128)
            .ok_or_else(|| {
                ConfigError::validation(format!(
                    "kcp.mtu {} leaves no room after {overhead} bytes of framing overhead",
                    cfg.kcp.mtu
                ))
            })?;

        Ok(Self {
            kcp: cfg.kcp.clone(),
            mux: cfg.mux.clone(),
            cipher: Arc::new(cipher),
            max_payload,
        })
    }

    fn kcp_config(&self) -> KcpConfig {
        KcpConfig::new()
            .mtu(self.max_payload as u32)
            .send_window(self.kcp.window)
            .recv_window(self.kcp.window)
            .stream_mode(true)
            .nodelay_config(NodeDelayConfig::custom(
                self.kcp.nodelay.nodelay,
                self.kcp.nodelay.interval,
                self.kcp.nodelay.resend,
                self.kcp.nodelay.nc,
            ))
    }
}

fn log_mux_worker_result(result: Result<(), async_smux::error::MuxError>) {
    if let Err(e) = result {
        match &e {
            async_smux::error::MuxError::ConnectionClosed
            | async_smux::error::MuxError::StreamClosed(_) => {
                debug!("mux worker closed: {:?}", e);
            }
            async_smux::error::MuxError::IoError(io) => {
                let expected = matches!(
                    io.kind(),
                    std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::NotConnected
                        | std::io::ErrorKind::ConnectionAborted
                );
                if expected {
                    debug!("mux worker closed: {:?}", e);
                } else {
                    error!("mux worker error: {:?}", e);
                }
            }
            _ => error!("mux worker error: {:?}", e),
        }
    }
}

/// One reliable, encrypted, multiplexed session
pub struct Session {
    peer: SocketAddr,
    conv: u32,
    connector: MuxConnector<SessionAdapter>,
    acceptor: tokio::sync::Mutex<MuxAcceptor<SessionAdapter>>,
    cancel: CancellationToken,
    next_sid: AtomicU32,
    streams: Arc<StreamCount>,
    max_streams: usize,
}

impl Session {
    /// Wire up the mux and engine for one session. Returns the session and
    /// the channel carrying opened (decrypted) datagrams into its engine.
    fn establish(
        client_mode: bool,
        conv: u32,
        peer: SocketAddr,
        pconn: Arc<dyn PacketIo>,
        cfg: &SessionConfig,
        parent: &CancellationToken,
    ) -> (Arc<Self>, mpsc::Sender<Bytes>) {
        let cancel = parent.child_token();

        let (adapter, read_tx, write_rx) = SessionAdapter::new(cfg.mux.frame_size);
        let (input_tx, input_rx) = mpsc::channel(ENGINE_QUEUE);

        let (connector, acceptor) = if client_mode {
            let mut builder = MuxBuilder::client();
            builder.with_max_tx_queue(std::num::NonZeroUsize::new(MUX_QUEUE).expect("nonzero"));
            builder.with_max_rx_queue(std::num::NonZeroUsize::new(MUX_QUEUE).expect("nonzero"));
            let (connector, acceptor, worker) = builder.with_connection(adapter).build();
            tokio::spawn(async move { log_mux_worker_result(worker.await) });
            (connector, acceptor)
        } else {
            let mut builder = MuxBuilder::server();
            builder.with_max_tx_queue(std::num::NonZeroUsize::new(MUX_QUEUE).expect("nonzero"));
            builder.with_max_rx_queue(std::num::NonZeroUsize::new(MUX_QUEUE).expect("nonzero"));
            let (connector, acceptor, worker) = builder.with_connection(adapter).build();
            tokio::spawn(async move { log_mux_worker_result(worker.await) });
            (connector, acceptor)
        };

        tokio::spawn(run_engine(
            conv,
            cfg.kcp_config(),
            u64::from(self_update_ms(&cfg.kcp)),
            input_rx,
            write_rx,
            read_tx,
            pconn,
            Arc::clone(&cfg.cipher),
            peer,
            cancel.clone(),
        ));

        let session = Arc::new(Self {
            peer,
            conv,
            connector,
            acceptor: tokio::sync::Mutex::new(acceptor),
            cancel,
            next_sid: AtomicU32::new(1),
            streams: Arc::new(StreamCount::default()),
            max_streams: cfg.mux.max_streams,
        });

        (session, input_tx)
    }

    /// Client side: establish a session over a freshly bound transport and
    /// start its read pump. The transport is released if setup fails and
    /// closed when the session dies.
    pub fn dial(
        pconn: Arc<dyn PacketIo>,
        peer: SocketAddr,
        cfg: &SessionConfig,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>, SessionError> {
        if parent.is_cancelled() {
            pconn.close();
            return Err(SessionError::Cancelled);
        }

        let conv: u32 = rand::thread_rng().gen();
        let cipher = Arc::clone(&cfg.cipher);
        let (session, input_tx) =
            Self::establish(true, conv, peer, Arc::clone(&pconn), cfg, parent);

        // Read pump: single producer feeding the engine.
        let cancel = session.cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let read = tokio::select! {
                    r = pconn.read_from(&mut buf) => r,
                    () = cancel.cancelled() => break,
                };
                match read {
                    Ok((n, _from)) => {
                        let Some(plain) = cipher.open(&buf[..n]) else {
                            continue;
                        };
                        if plain.len() < 4
                            || u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]) != conv
                        {
                            continue;
                        }
                        if input_tx.send(Bytes::from(plain)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if e.is_recoverable() {
                            continue;
                        }
                        debug!("session read pump exiting: {}", e);
                        break;
                    }
                }
            }
            cancel.cancel();
            pconn.close();
        });

        debug!("session dialed: peer={} conv={}", peer, conv);
        Ok(session)
    }

    /// Open a new outbound logical stream with a fresh stream id
    pub fn open_stream(&self) -> Result<MuxTunnelStream, SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Closed);
        }
        if self.streams.get() >= self.max_streams {
            return Err(SessionError::Mux(format!(
                "stream limit {} reached",
                self.max_streams
            )));
        }
        let inner = self
            .connector
            .clone()
            .connect()
            .map_err(|e| SessionError::Mux(e.to_string()))?;
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        Ok(MuxTunnelStream::new(inner, sid, self.peer, &self.streams))
    }

    /// Wait for the peer to open a logical stream
    pub async fn accept_stream(&self) -> Result<MuxTunnelStream, SessionError> {
        let mut acceptor = self.acceptor.lock().await;
        let accepted = tokio::select! {
            s = acceptor.accept() => s,
            () = self.cancel.cancelled() => return Err(SessionError::Closed),
        };
        match accepted {
            Some(inner) => {
                let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
                Ok(MuxTunnelStream::new(inner, sid, self.peer, &self.streams))
            }
            None => {
                self.cancel.cancel();
                Err(SessionError::Closed)
            }
        }
    }

    /// The tunnel peer endpoint
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// The KCP conversation id
    #[must_use]
    pub const fn conv(&self) -> u32 {
        self.conv
    }

    /// Whether the session is terminally closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Live stream count
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.get()
    }

    /// Close the session; all streams unblock with errors
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// A future resolving when the session closes
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

const fn self_update_ms(kcp: &KcpSettings) -> u32 {
    if kcp.nodelay.interval == 0 {
        10
    } else {
        kcp.nodelay.interval
    }
}

/// Server-side session acceptor over one shared packet transport
pub struct Listener {
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Session>>>,
    cancel: CancellationToken,
}

struct SessionEntry {
    session: Arc<Session>,
    input_tx: mpsc::Sender<Bytes>,
}

impl Listener {
    /// Start demultiplexing sessions from the transport
    #[must_use]
    pub fn listen(
        pconn: Arc<dyn PacketIo>,
        cfg: Arc<SessionConfig>,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let (accept_tx, accept_rx) = mpsc::channel(64);

        let loop_cancel = cancel.clone();
        tokio::spawn(async move {
            demux_loop(pconn, cfg, accept_tx, loop_cancel).await;
        });

        Self {
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            cancel,
        }
    }

    /// Yield the next established session
    pub async fn accept(&self) -> Result<Arc<Session>, SessionError> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            s = rx.recv() => s.ok_or(SessionError::Closed),
            () = self.cancel.cancelled() => Err(SessionError::Cancelled),
        }
    }

    /// Stop accepting and close every session spawned from this listener
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Single-task demultiplexer: owns the session map, so no lock is needed.
async fn demux_loop(
    pconn: Arc<dyn PacketIo>,
    cfg: Arc<SessionConfig>,
    accept_tx: mpsc::Sender<Arc<Session>>,
    cancel: CancellationToken,
) {
    let mut sessions: HashMap<(SocketAddr, u32), SessionEntry> = HashMap::new();
    let mut sweep = tokio::time::interval(Duration::from_secs(5));
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,

            _ = sweep.tick() => {
                sessions.retain(|key, entry| {
                    let live = !entry.session.is_closed();
                    if !live {
                        debug!("pruning dead session: peer={} conv={}", key.0, key.1);
                    }
                    live
                });
            }

            read = pconn.read_from(&mut buf) => {
                let (n, peer) = match read {
                    Ok(ok) => ok,
                    Err(e) => {
                        if e.is_recoverable() {
                            continue;
                        }
                        info!("session listener transport closed: {}", e);
                        break;
                    }
                };

                let Some(plain) = cfg.cipher.open(&buf[..n]) else {
                    continue;
                };
                if plain.len() < 4 {
                    continue;
                }
                let conv = u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]);
                let key = (peer, conv);

                let stale = sessions
                    .get(&key)
                    .is_some_and(|e| e.session.is_closed());
                if stale {
                    sessions.remove(&key);
                }

                if !sessions.contains_key(&key) {
                    // First datagram from a new peer/conv establishes the
                    // session, exactly like an implicit handshake.
                    let (session, input_tx) = Session::establish(
                        false,
                        conv,
                        peer,
                        Arc::clone(&pconn),
                        &cfg,
                        &cancel,
                    );
                    info!("session accepted: peer={} conv={}", peer, conv);
                    if accept_tx.send(Arc::clone(&session)).await.is_err() {
                        session.close();
                        break;
                    }
                    sessions.insert(key, SessionEntry { session, input_tx });
                }

                if let Some(entry) = sessions.get(&key) {
                    // Dropping under backpressure is safe: KCP retransmits.
                    if let Err(mpsc::error::TrySendError::Full(_)) =
                        entry.input_tx.try_send(Bytes::from(plain))
                    {
                        debug!("engine input queue full, dropping datagram: conv={}", conv);
                    }
                }
            }
        }
    }

    for entry in sessions.values() {
        entry.session.close();
    }
    pconn.close();
}
