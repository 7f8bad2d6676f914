//! External collaborator contracts (spec §6): the embedded QUIC engine, the
//! post-handshake upstream handler, and the peer-identity security
//! verifier. This crate only consumes these traits — packet encryption,
//! loss recovery, flow control, and TLS live on the other side of them.

use std::net::SocketAddr;
use std::time::Instant;

use quicmux_config::QuicProtocolConfig;

/// Events the QUIC engine reports back to the supervisor after a datagram
/// injection or timer tick.
#[derive(Debug, Clone)]
pub enum QuicEvent {
    HandshakeCompleted,
    ConnectionTerminated { reason_phrase: String },
    StreamDataReceived { stream_id: u64, data: Vec<u8>, fin: bool },
    StreamReset { stream_id: u64, error_code: u64 },
}

/// The embedded QUIC protocol engine: handshake, encryption, loss recovery,
/// and flow control all live behind this trait. The core only feeds it
/// datagrams, drains its events, and transmits its outgoing datagrams.
pub trait QuicEngine: Send {
    /// Constructs a new server-side engine instance for a freshly observed
    /// connection, given the negotiated protocol configuration and the
    /// client's original destination connection ID.
    fn new_server(config: &QuicProtocolConfig, original_dcid: &[u8]) -> Self
    where
        Self: Sized;

    /// Feeds a received datagram to the engine.
    fn receive_datagram(&mut self, data: &[u8], from: SocketAddr, now: Instant);

    /// Drains the next queued event, if any.
    fn next_event(&mut self) -> Option<QuicEvent>;

    /// Returns the datagrams the engine wants transmitted, each paired with
    /// its destination address.
    fn datagrams_to_send(&mut self, now: Instant) -> Vec<(Vec<u8>, SocketAddr)>;

    /// The next instant the engine's timeout handler should be invoked, if
    /// any timer is currently armed.
    fn next_timeout(&self) -> Option<Instant>;

    /// Invoked by the per-session timer task when `next_timeout` elapses.
    fn on_timeout(&mut self, now: Instant);

    /// Closes the connection with the given human-readable reason.
    fn close(&mut self, reason: &str);
}

/// Outcome of post-handshake peer-identity verification.
pub enum SecurityOutcome {
    Verified { peer_id: String },
    Failed,
}

/// Verifies a peer's identity once the handshake has completed. Optional:
/// when no verifier is configured, promotion proceeds with a placeholder
/// identity to be filled in later by an upstream layer.
pub trait SecurityVerifier: Send + Sync {
    fn verify(&self, remote: &SocketAddr) -> SecurityOutcome;
}

/// Invoked once per accepted connection, in a fresh task. Errors are logged
/// and cause the connection to be closed, but never stop the listener. Takes
/// an engine-agnostic handle: the handler never sees the engine itself, only
/// its identity metadata and a stream of post-handshake events.
pub trait UpstreamHandler: Send + Sync {
    fn handle(
        &self,
        connection: crate::session::EstablishedConnection,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Seam for a future retry-token validator. Not wired into the listener:
/// retry-token issuance is an explicit Non-goal (spec §1). Kept as a trait
/// so a later implementation has a stable extension point.
pub trait RetryValidator: Send + Sync {
    fn validate(&self, token: &[u8], from: SocketAddr) -> bool;
}
