//! KCP engine pump
//!
//! One task per session drives the KCP state machine: datagrams from the
//! packet transport feed `engine.input`, mux frames feed `engine.send`,
//! and everything the engine emits goes back out through the transport
//! after sealing. The engine clock ticks at the configured nodelay
//! interval.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kcp_tokio::kcp_core::error::KcpCoreError;
use kcp_tokio::engine::KcpEngine;
use kcp_tokio::protocol::ConvId;
use kcp_tokio::KcpConfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crypto::DatagramCipher;
use crate::pcap::PacketIo;

/// Queue depth between the engine and the mux adapter
pub(crate) const ENGINE_QUEUE: usize = 8192;

/// Log an engine step result; returns false when the session must die
fn handle_kcp_result(label: &str, result: Result<(), KcpCoreError>) -> bool {
    if let Err(e) = result {
        warn!("KCP engine {} error: {:?}", label, e);
        return !e.is_fatal();
    }
    true
}

/// Seal and send everything the engine has queued for output since the
/// last drain.
async fn flush_output(
    engine: &mut KcpEngine,
    pconn: &Arc<dyn PacketIo>,
    cipher: &DatagramCipher,
    peer: SocketAddr,
) {
    for kcp_bytes in engine.drain_output() {
        match cipher.seal(&kcp_bytes) {
            Ok(sealed) => {
                if let Err(e) = pconn.write_to(&sealed, peer).await {
                    warn!("KCP engine output write error: {:?}", e);
                }
            }
            Err(e) => warn!("KCP engine output seal error: {:?}", e),
        }
    }
}

/// Drive one session's KCP endpoint until it dies or the session is
/// cancelled. Cancels `cancel` on exit so the owning session observes the
/// death.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_engine(
    conv: u32,
    kcp_config: KcpConfig,
    update_ms: u64,
    mut input_rx: mpsc::Receiver<Bytes>,
    mut write_rx: mpsc::Receiver<Bytes>,
    read_tx: mpsc::Sender<Bytes>,
    pconn: Arc<dyn PacketIo>,
    cipher: Arc<DatagramCipher>,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    use tokio::sync::mpsc::error::TrySendError;

    let mut engine = KcpEngine::new(ConvId::from(conv), kcp_config);

    // Everything KCP emits is sealed and carried as one outer frame.
    let mut update_interval = tokio::time::interval(Duration::from_millis(update_ms.max(1)));
    let mut pending_reads: std::collections::VecDeque<Bytes> = std::collections::VecDeque::new();

    debug!("KCP engine up: conv={} peer={}", conv, peer);

    'outer: loop {
        tokio::select! {
            Some(data) = input_rx.recv() => {
                if !handle_kcp_result("input", engine.input(data)) {
                    break;
                }
                if !handle_kcp_result("update", engine.update()) {
                    break;
                }
                flush_output(&mut engine, &pconn, &cipher, peer).await;
            }

            Some(data) = write_rx.recv() => {
                if !handle_kcp_result("send", engine.send(data)) {
                    break;
                }
                if !handle_kcp_result("update", engine.update()) {
                    break;
                }
                flush_output(&mut engine, &pconn, &cipher, peer).await;
            }

            _ = update_interval.tick() => {
                if !handle_kcp_result("update", engine.update()) {
                    break;
                }
                flush_output(&mut engine, &pconn, &cipher, peer).await;
                if engine.is_dead() {
                    debug!("KCP engine dead: conv={} peer={}", conv, peer);
                    break;
                }
            }

            () = cancel.cancelled() => {
                debug!("KCP engine cancelled: conv={} peer={}", conv, peer);
                break;
            }
        }

        // Re-offer anything the mux side refused last round.
        while let Some(data) = pending_reads.pop_front() {
            match read_tx.try_send(data) {
                Ok(()) => {}
                Err(TrySendError::Full(data)) => {
                    pending_reads.push_front(data);
                    break;
                }
                Err(TrySendError::Closed(_)) => break 'outer,
            }
        }

        // Drain ordered bytes the engine has assembled.
        while pending_reads.len() < ENGINE_QUEUE {
            match engine.recv() {
                Ok(Some(data)) => match read_tx.try_send(data) {
                    Ok(()) => {}
                    Err(TrySendError::Full(data)) => {
                        pending_reads.push_back(data);
                        break;
                    }
                    Err(TrySendError::Closed(_)) => break 'outer,
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("KCP recv error: {:?}", e);
                    break;
                }
            }
        }

        let _ = engine.flush();
        flush_output(&mut engine, &pconn, &cipher, peer).await;
    }

    cancel.cancel();
    debug!("KCP engine exit: conv={} peer={}", conv, peer);
}
