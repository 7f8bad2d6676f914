//! Listener loop (spec §4.5): binds a UDP socket, reads datagrams, and
//! hands each one to the supervisor under the routing lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::engine::{QuicEngine, SecurityVerifier, UpstreamHandler};
use crate::error::ListenError;
use crate::multiaddr::{self, QuicMultiaddr};
use crate::routing::RoutingTable;
use crate::session::Supervisor;
use crate::stats::{ListenerStats, StatsSnapshot};
use quicmux_config::QuicProtocolConfig;

/// Largest UDP datagram this listener will read. Larger than any
/// `max_udp_payload_size` a protocol config should reasonably set; the
/// engine is responsible for rejecting oversized payloads it doesn't want.
const READ_BUFFER_SIZE: usize = 65536;

/// The QUIC demultiplexing listener (spec §1, §4.5). Binds one UDP socket
/// per `listen()` call and demultiplexes every datagram that arrives on it
/// across the sessions in its routing table. Serves every tag in
/// `protocols` simultaneously, the way a libp2p QUIC transport listens for
/// several negotiated versions/ALPNs on one socket (spec §6).
pub struct Listener<E: QuicEngine + 'static> {
    protocols: Vec<QuicProtocolConfig>,
    security: Option<Arc<dyn SecurityVerifier>>,
    handler: Arc<dyn UpstreamHandler>,
    stats: Arc<ListenerStats>,
    table: RoutingTable<E>,
    local_addr: std::sync::Mutex<Option<QuicMultiaddr>>,
    is_listening: Arc<AtomicBool>,
    shutdown_tx: std::sync::Mutex<Option<broadcast::Sender<()>>>,
}

impl<E: QuicEngine + 'static> Listener<E> {
    pub fn new(
        protocols: Vec<QuicProtocolConfig>,
        handler: Arc<dyn UpstreamHandler>,
        security: Option<Arc<dyn SecurityVerifier>>,
    ) -> Self {
        Self {
            protocols,
            security,
            handler,
            stats: Arc::new(ListenerStats::new()),
            table: RoutingTable::new(),
            local_addr: std::sync::Mutex::new(None),
            is_listening: Arc::new(AtomicBool::new(false)),
            shutdown_tx: std::sync::Mutex::new(None),
        }
    }

    /// Binds `address` and spawns the read loop. Returns once the socket is
    /// bound; the loop itself runs in the background until `close()`.
    pub async fn listen(&self, address: &str) -> Result<QuicMultiaddr, ListenError> {
        if self.is_listening.load(Ordering::SeqCst) {
            return Err(ListenError::AlreadyListening);
        }
        if self.protocols.is_empty() {
            return Err(ListenError::NoProtocolsConfigured);
        }

        let requested = multiaddr::parse(address)
            .ok_or_else(|| ListenError::InvalidAddress(address.to_string()))?;

        let socket = UdpSocket::bind(requested.socket_addr())
            .await
            .map_err(ListenError::from)?;
        let bound = socket.local_addr().map_err(ListenError::from)?;
        let resolved = QuicMultiaddr::from(bound);

        info!(local = %resolved, "quic listener bound");

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        *self.shutdown_tx.lock().unwrap() = Some(shutdown_tx);
        *self.local_addr.lock().unwrap() = Some(resolved);
        self.is_listening.store(true, Ordering::SeqCst);

        let socket = Arc::new(socket);
        let supervisor = Supervisor::new(
            self.table.clone(),
            socket.clone(),
            self.stats.clone(),
            self.protocols.clone(),
            self.security.clone(),
            self.handler.clone(),
        );
        let is_listening = self.is_listening.clone();

        // A single ingress task processes datagrams one at a time, in the
        // order `recv_from` hands them back, rather than spawning a task
        // per datagram: that would let two datagrams from the same peer
        // race for the routing lock in an order `recv_from` never promised
        // (spec §5's per-address ordering guarantee) and would let load
        // balloon the task count without bound (spec §9 design notes).
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        debug!("listener read loop shutting down");
                        break;
                    }
                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, from)) => {
                                supervisor.handle_datagram(&buf[..len], from).await;
                            }
                            Err(err) => {
                                error!(error = %err, "listener socket read failed, stopping");
                                break;
                            }
                        }
                    }
                }
            }
            is_listening.store(false, Ordering::SeqCst);
        });

        Ok(resolved)
    }

    /// Stops accepting datagrams, tears down every session (established
    /// sessions first, then pending), and releases the socket and bound
    /// address. Idempotent: calling this on an already-closed listener is a
    /// no-op.
    pub async fn close(&self) {
        self.signal_shutdown();

        let mut guard = self.table.lock().await;
        for cid in guard.established_cids() {
            if let Some(session) = guard.lookup_established_mut(&cid) {
                session.engine.close("listener closed");
            }
            guard.remove(&cid);
        }
        for cid in guard.pending_cids() {
            if let Some(session) = guard.lookup_pending_mut(&cid) {
                session.engine.close("listener closed");
            }
            guard.remove(&cid);
        }
        drop(guard);

        *self.local_addr.lock().unwrap() = None;
        self.is_listening.store(false, Ordering::SeqCst);
    }

    /// Synchronous half of shutdown: signals the read loop to stop. Safe to
    /// call from `Drop`, where we can't await the routing lock.
    fn signal_shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    pub fn addresses(&self) -> Vec<QuicMultiaddr> {
        self.local_addr.lock().unwrap().iter().copied().collect()
    }

    pub fn is_listening(&self) -> bool {
        self.is_listening.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> StatsSnapshot {
        let guard = self.table.lock().await;
        self.stats.snapshot(
            guard.established_count(),
            guard.pending_count(),
            self.is_listening(),
        )
    }
}

impl<E: QuicEngine + 'static> Drop for Listener<E> {
    fn drop(&mut self) {
        if self.is_listening() {
            warn!("listener dropped without an explicit close(), sessions will not be torn down cleanly");
            self.signal_shutdown();
            self.is_listening.store(false, Ordering::SeqCst);
        }
    }
}
