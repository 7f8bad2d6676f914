//! Session supervisor (spec §4.4): datagram injection, event draining,
//! promotion, and transmission.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::engine::{QuicEngine, QuicEvent, SecurityOutcome, SecurityVerifier, UpstreamHandler};
use crate::multiaddr::QuicMultiaddr;
use crate::routing::{ConnectionId, RouteDecision, RoutingTable};
use crate::stats::ListenerStats;
use quicmux_config::QuicProtocolConfig;

/// A session whose handshake is in progress. Owns the engine.
pub struct PendingSession<E> {
    pub engine: E,
    pub peer_addr: SocketAddr,
    pub negotiated_version: u32,
}

/// Events forwarded to the upstream handler's stream-event receiver.
#[derive(Debug)]
pub enum StreamEvent {
    Data { stream_id: u64, data: Vec<u8>, fin: bool },
    Reset { stream_id: u64, error_code: u64 },
}

/// A session whose handshake completed: the engine plus the metadata
/// needed to route subsequent 1-RTT datagrams and to forward stream
/// events to the upstream handler. The engine stays here, guarded by the
/// same routing lock as every other session — the handler never touches
/// it directly (spec: the stream multiplexer is invoked through
/// well-defined interfaces only).
pub struct EstablishedSession<E> {
    pub engine: E,
    pub peer_addr: SocketAddr,
    pub remote_multiaddr: QuicMultiaddr,
    pub is_initiator: bool,
    pub peer_id: Option<String>,
    pub stream_tx: mpsc::UnboundedSender<StreamEvent>,
}

/// The handle given to the upstream handler once a connection is
/// established: identity and address metadata plus a channel of stream
/// events. Does not expose the engine.
pub struct EstablishedConnection {
    pub remote_multiaddr: QuicMultiaddr,
    pub is_initiator: bool,
    pub peer_id: Option<String>,
    pub stream_events: mpsc::UnboundedReceiver<StreamEvent>,
}

/// Drives sessions through their events and owns the pieces of the
/// pipeline described in spec §4.4: datagram injection, event draining,
/// promotion, and transmission.
pub struct Supervisor<E: QuicEngine> {
    table: RoutingTable<E>,
    socket: Arc<UdpSocket>,
    stats: Arc<ListenerStats>,
    protocols: Vec<QuicProtocolConfig>,
    security: Option<Arc<dyn SecurityVerifier>>,
    handler: Arc<dyn UpstreamHandler>,
    self_weak: std::sync::OnceLock<std::sync::Weak<Supervisor<E>>>,
}

impl<E: QuicEngine + 'static> Supervisor<E> {
    /// Constructs the supervisor already wrapped in `Arc`, keeping a weak
    /// self-reference so per-session timer tasks (spec §4.4.1 step 5) can
    /// re-enter `handle_datagram`'s dispatch machinery without the caller
    /// threading an `Arc` through every call site.
    ///
    /// `protocols` holds one `QuicProtocolConfig` per tag the listener
    /// serves; `protocols` must not be empty. Version negotiation offers
    /// the union of every tag's supported versions, and a new connection's
    /// engine is built from whichever tag's config lists the incoming
    /// packet's wire version.
    pub fn new(
        table: RoutingTable<E>,
        socket: Arc<UdpSocket>,
        stats: Arc<ListenerStats>,
        protocols: Vec<QuicProtocolConfig>,
        security: Option<Arc<dyn SecurityVerifier>>,
        handler: Arc<dyn UpstreamHandler>,
    ) -> Arc<Self> {
        let supervisor = Arc::new(Self {
            table,
            socket,
            stats,
            protocols,
            security,
            handler,
            self_weak: std::sync::OnceLock::new(),
        });
        let _ = supervisor.self_weak.set(Arc::downgrade(&supervisor));
        supervisor
    }

    /// The union of every configured protocol's supported wire versions,
    /// used as the candidate set for version negotiation (spec §4.2, and
    /// `original_source/libp2p/transport/quic/listener.py::_get_supported_versions`,
    /// which unions versions across its `_quic_configs` mapping the same way).
    fn supported_versions(&self) -> Vec<u32> {
        let mut versions: Vec<u32> = self
            .protocols
            .iter()
            .flat_map(|protocol| protocol.supported_versions.iter().copied())
            .collect();
        versions.sort_unstable();
        versions.dedup();
        versions
    }

    /// Selects the protocol configuration whose supported versions include
    /// `version`, mirroring `_handle_new_connection`'s per-version config
    /// lookup in the original listener. Falls back to the first configured
    /// protocol if none matches, which should not happen once a packet has
    /// already passed the version-negotiation check.
    fn protocol_for_version(&self, version: u32) -> &QuicProtocolConfig {
        self.protocols
            .iter()
            .find(|protocol| protocol.supported_versions.contains(&version))
            .unwrap_or(&self.protocols[0])
    }

    /// Handles one received datagram end to end, holding the routing lock
    /// for the entire classify → dispatch → drain → transmit sequence
    /// (spec §5).
    pub async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        self.stats.record_packet(data.len());

        let header = match crate::packet::parse_long_header(data) {
            Some(header) => header,
            None => {
                // Could be a short-header packet routed by address, or
                // genuinely malformed. Try address-based routing; only a
                // routing miss counts as invalid (spec §9 open question).
                let mut guard = self.table.lock().await;
                if let Some(cid) = guard.lookup_by_addr(&from).cloned() {
                    if guard.lookup_established_mut(&cid).is_some() {
                        self.inject_and_drain_established(&mut guard, &cid, data, from)
                            .await;
                        return;
                    }
                    if guard.lookup_pending_mut(&cid).is_some() {
                        self.inject_and_drain_pending(&mut guard, &cid, data, from)
                            .await;
                        return;
                    }
                }
                self.stats.record_invalid_packet();
                return;
            }
        };

        let supported_versions = self.supported_versions();
        if crate::version::needs_negotiation(&header, &supported_versions) {
            self.stats.record_version_negotiation();
            let datagram =
                crate::version::build_version_negotiation(&header, &supported_versions);
            if let Err(err) = self.socket.send_to(&datagram, from).await {
                warn!(%from, error = %err, "failed to send version negotiation");
            }
            return;
        }
        if header.version == 0 {
            // A version-negotiation packet arriving at the server: ignore.
            return;
        }

        let dcid = ConnectionId::from_bytes(header.dcid.clone());
        let is_initial = matches!(header.packet_type, crate::packet::PacketType::Initial);

        let mut guard = self.table.lock().await;
        let decision = guard.classify(&dcid, from, is_initial);

        match decision {
            RouteDecision::Established(cid) => {
                self.inject_and_drain_established(&mut guard, &cid, data, from)
                    .await;
            }
            RouteDecision::Pending(cid) | RouteDecision::ExistingByAddr(cid) => {
                if guard.lookup_established_mut(&cid).is_some() {
                    self.inject_and_drain_established(&mut guard, &cid, data, from)
                        .await;
                } else if guard.lookup_pending_mut(&cid).is_some() {
                    self.inject_and_drain_pending(&mut guard, &cid, data, from)
                        .await;
                }
            }
            RouteDecision::New => {
                let cid = ConnectionId::generate();
                let protocol = self.protocol_for_version(header.version);
                let engine = E::new_server(protocol, &header.dcid);
                let mut pending_session = PendingSession {
                    engine,
                    peer_addr: from,
                    negotiated_version: header.version,
                };
                pending_session
                    .engine
                    .receive_datagram(data, from, Instant::now());
                let events = drain_events(&mut pending_session.engine);
                guard.insert_pending(cid.clone(), from, pending_session);
                self.dispatch_pending_events(&mut guard, &cid, events, from)
                    .await;
                self.transmit_pending(&mut guard, &cid, from).await;
            }
            RouteDecision::Ignore => {}
        }
    }

    async fn inject_and_drain_established(
        &self,
        guard: &mut tokio::sync::MutexGuard<'_, crate::routing::RoutingInner<E>>,
        cid: &ConnectionId,
        data: &[u8],
        from: SocketAddr,
    ) {
        let Some(session) = guard.lookup_established_mut(cid) else {
            return;
        };
        session.engine.receive_datagram(data, from, Instant::now());
        let events = drain_events(&mut session.engine);
        if apply_established_events(guard, cid, events) {
            self.transmit_established(guard, cid, from).await;
        }
    }

    async fn inject_and_drain_pending(
        &self,
        guard: &mut tokio::sync::MutexGuard<'_, crate::routing::RoutingInner<E>>,
        cid: &ConnectionId,
        data: &[u8],
        from: SocketAddr,
    ) {
        let Some(session) = guard.lookup_pending_mut(cid) else {
            return;
        };
        session.engine.receive_datagram(data, from, Instant::now());
        let events = drain_events(&mut session.engine);
        self.dispatch_pending_events(guard, cid, events, from).await;
        self.transmit_pending(guard, cid, from).await;
    }

    async fn dispatch_pending_events(
        &self,
        guard: &mut tokio::sync::MutexGuard<'_, crate::routing::RoutingInner<E>>,
        cid: &ConnectionId,
        events: Vec<QuicEvent>,
        from: SocketAddr,
    ) {
        for event in events {
            match event {
                QuicEvent::HandshakeCompleted => {
                    self.promote(guard, cid, from).await;
                }
                QuicEvent::ConnectionTerminated { reason_phrase } => {
                    info!(?cid, reason = %reason_phrase, "pending session terminated");
                    guard.remove(cid);
                }
                // Stream events are not expected pre-handshake; any
                // well-formed QUIC engine only emits them post-handshake.
                QuicEvent::StreamDataReceived { .. } | QuicEvent::StreamReset { .. } => {
                    debug!(?cid, "ignoring stream event on a pending session");
                }
            }
        }
    }

    /// Promotes a pending session to established (spec §4.4.1).
    async fn promote(
        &self,
        guard: &mut tokio::sync::MutexGuard<'_, crate::routing::RoutingInner<E>>,
        cid: &ConnectionId,
        from: SocketAddr,
    ) {
        let mut pending = match guard.take_pending(cid) {
            Some(p) => p,
            None => return,
        };

        let remote_multiaddr = QuicMultiaddr {
            ip: from.ip(),
            port: from.port(),
        };

        let peer_id = match &self.security {
            Some(verifier) => match verifier.verify(&from) {
                SecurityOutcome::Verified { peer_id } => Some(peer_id),
                SecurityOutcome::Failed => {
                    warn!(?cid, %from, "security verification failed, dropping connection");
                    self.stats.record_connection_rejected();
                    pending.engine.close("security verification failed");
                    guard.remove(cid);
                    return;
                }
            },
            None => None,
        };

        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let established = EstablishedSession {
            engine: pending.engine,
            peer_addr: pending.peer_addr,
            remote_multiaddr,
            is_initiator: false,
            peer_id: peer_id.clone(),
            stream_tx,
        };
        guard.insert_established(cid.clone(), established);
        self.stats.record_connection_accepted();

        let connection = EstablishedConnection {
            remote_multiaddr,
            is_initiator: false,
            peer_id,
            stream_events: stream_rx,
        };
        let handler = self.handler.clone();
        let cid_for_log = cid.clone();
        tokio::spawn(async move {
            if let Err(err) = handler.handle(connection) {
                warn!(cid = ?cid_for_log, error = %err, "upstream handler returned an error");
            }
        });

        self.spawn_session_timer(cid.clone());
    }

    /// The timer-driven per-session task from spec §4.4.1 step 5: repeatedly
    /// sleeps until the engine's next requested deadline, invokes its
    /// timeout handler, and re-enters the normal event-dispatch path. Exits
    /// once the engine stops arming a timer or the session disappears.
    fn spawn_session_timer(&self, cid: ConnectionId) {
        let Some(supervisor) = self.self_weak.get().and_then(|weak| weak.upgrade()) else {
            return;
        };
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let mut guard = supervisor.table.lock().await;
                    match guard.lookup_established_mut(&cid) {
                        Some(session) => session.engine.next_timeout(),
                        None => return,
                    }
                };
                let Some(deadline) = deadline else { return };
                let now = Instant::now();
                if deadline > now {
                    tokio::time::sleep(deadline - now).await;
                }

                let mut guard = supervisor.table.lock().await;
                let Some(session) = guard.lookup_established_mut(&cid) else {
                    return;
                };
                session.engine.on_timeout(Instant::now());
                let events = drain_events(&mut session.engine);
                let fallback = session.peer_addr;
                if !apply_established_events(&mut guard, &cid, events) {
                    return;
                }
                supervisor.transmit_established(&mut guard, &cid, fallback).await;
            }
        });
    }

    async fn transmit_pending(
        &self,
        guard: &mut tokio::sync::MutexGuard<'_, crate::routing::RoutingInner<E>>,
        cid: &ConnectionId,
        from: SocketAddr,
    ) {
        let Some(session) = guard.lookup_pending_mut(cid) else {
            return;
        };
        let outgoing = session.engine.datagrams_to_send(Instant::now());
        if send_datagrams(&self.socket, outgoing, from).await {
            return;
        }
        if let Some(session) = guard.lookup_pending_mut(cid) {
            session.engine.close("persistent send failure");
        }
        guard.remove(cid);
    }

    async fn transmit_established(
        &self,
        guard: &mut tokio::sync::MutexGuard<'_, crate::routing::RoutingInner<E>>,
        cid: &ConnectionId,
        from: SocketAddr,
    ) {
        let Some(session) = guard.lookup_established_mut(cid) else {
            return;
        };
        let outgoing = session.engine.datagrams_to_send(Instant::now());
        if send_datagrams(&self.socket, outgoing, from).await {
            return;
        }
        if let Some(session) = guard.lookup_established_mut(cid) {
            session.engine.close("persistent send failure");
        }
        guard.remove(cid);
    }
}

/// Applies a batch of drained events to an established session. Returns
/// `false` if the session was torn down (`ConnectionTerminated`), in which
/// case the caller must not touch it again.
fn apply_established_events<E: QuicEngine>(
    guard: &mut tokio::sync::MutexGuard<'_, crate::routing::RoutingInner<E>>,
    cid: &ConnectionId,
    events: Vec<QuicEvent>,
) -> bool {
    for event in events {
        match event {
            QuicEvent::HandshakeCompleted => {
                // Already established; nothing to do.
            }
            QuicEvent::ConnectionTerminated { reason_phrase } => {
                info!(?cid, reason = %reason_phrase, "established connection terminated");
                guard.remove(cid);
                return false;
            }
            QuicEvent::StreamDataReceived { stream_id, data, fin } => {
                if let Some(session) = guard.lookup_established_mut(cid) {
                    let _ = session
                        .stream_tx
                        .send(StreamEvent::Data { stream_id, data, fin });
                }
            }
            QuicEvent::StreamReset { stream_id, error_code } => {
                if let Some(session) = guard.lookup_established_mut(cid) {
                    let _ = session
                        .stream_tx
                        .send(StreamEvent::Reset { stream_id, error_code });
                }
            }
        }
    }
    true
}

fn drain_events<E: QuicEngine>(engine: &mut E) -> Vec<QuicEvent> {
    let mut events = Vec::new();
    while let Some(event) = engine.next_event() {
        events.push(event);
    }
    events
}

/// Transmits every pending outbound datagram in one pass (spec §4.4.2):
/// multiple datagrams must be drained together to avoid starving
/// loss-recovery. Returns `false` if any send hit a non-transient error, in
/// which case the caller tears the session down (spec §4.4.2: "a send
/// error is logged and the session is torn down if the error is not
/// transient"); `WouldBlock`/`Interrupted` are treated as transient and
/// don't trigger teardown.
async fn send_datagrams(
    socket: &UdpSocket,
    outgoing: Vec<(Vec<u8>, SocketAddr)>,
    fallback_addr: SocketAddr,
) -> bool {
    let mut healthy = true;
    for (bytes, addr) in outgoing {
        let dest = if addr.port() == 0 { fallback_addr } else { addr };
        if let Err(err) = socket.send_to(&bytes, dest).await {
            error!(%dest, error = %err, "failed to transmit outbound datagram");
            if !matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted) {
                healthy = false;
            }
        }
    }
    healthy
}
