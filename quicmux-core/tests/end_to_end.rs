//! End-to-end scenarios over the session supervisor: one real UDP socket,
//! a scripted fake QUIC engine, and a handler that records every promoted
//! connection.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use quicmux_config::QuicProtocolConfig;
use quicmux_core::engine::{QuicEngine, QuicEvent, UpstreamHandler};
use quicmux_core::routing::RoutingTable;
use quicmux_core::session::{EstablishedConnection, Supervisor};
use quicmux_core::stats::ListenerStats;
use quicmux_core::Listener;

thread_local! {
    static NEXT_SCRIPT: RefCell<Option<Script>> = RefCell::new(None);
}

#[derive(Default)]
struct Script {
    events: VecDeque<QuicEvent>,
    outgoing: VecDeque<(Vec<u8>, SocketAddr)>,
}

fn arm(script: Script) {
    NEXT_SCRIPT.with(|cell| *cell.borrow_mut() = Some(script));
}

struct FakeEngine {
    events: VecDeque<QuicEvent>,
    outgoing: VecDeque<(Vec<u8>, SocketAddr)>,
}

impl QuicEngine for FakeEngine {
    fn new_server(_config: &QuicProtocolConfig, _original_dcid: &[u8]) -> Self {
        let script = NEXT_SCRIPT.with(|cell| cell.borrow_mut().take()).unwrap_or_default();
        FakeEngine {
            events: script.events,
            outgoing: script.outgoing,
        }
    }
    fn receive_datagram(&mut self, _data: &[u8], _from: SocketAddr, _now: Instant) {}
    fn next_event(&mut self) -> Option<QuicEvent> {
        self.events.pop_front()
    }
    fn datagrams_to_send(&mut self, _now: Instant) -> Vec<(Vec<u8>, SocketAddr)> {
        self.outgoing.drain(..).collect()
    }
    fn next_timeout(&self) -> Option<Instant> {
        None
    }
    fn on_timeout(&mut self, _now: Instant) {}
    fn close(&mut self, _reason: &str) {}
}

struct RecordingHandler {
    tx: mpsc::UnboundedSender<EstablishedConnection>,
}

impl UpstreamHandler for RecordingHandler {
    fn handle(
        &self,
        connection: EstablishedConnection,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let _ = self.tx.send(connection);
        Ok(())
    }
}

fn protocol_config() -> QuicProtocolConfig {
    QuicProtocolConfig {
        tag: "test".to_string(),
        supported_versions: vec![1],
        certificate: String::new(),
        private_key: String::new(),
        alpn_protocols: vec![],
        is_client: false,
        transport: Default::default(),
    }
}

fn build_initial(dcid: &[u8], scid: &[u8], version: u32) -> Vec<u8> {
    let mut packet = vec![0xC0u8];
    packet.extend_from_slice(&version.to_be_bytes());
    packet.push(dcid.len() as u8);
    packet.extend_from_slice(dcid);
    packet.push(scid.len() as u8);
    packet.extend_from_slice(scid);
    packet.push(0); // empty token, 1-byte varint length
    packet
}

async fn new_supervisor(
    tx: mpsc::UnboundedSender<EstablishedConnection>,
) -> (Arc<Supervisor<FakeEngine>>, RoutingTable<FakeEngine>, Arc<ListenerStats>) {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let stats = Arc::new(ListenerStats::new());
    let table = RoutingTable::new();
    let handler = Arc::new(RecordingHandler { tx });
    let supervisor = Supervisor::new(
        table.clone(),
        socket,
        stats.clone(),
        vec![protocol_config()],
        None,
        handler,
    );
    (supervisor, table, stats)
}

#[tokio::test]
async fn happy_path_promotes_on_handshake_completed() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (supervisor, table, stats) = new_supervisor(tx).await;

    arm(Script {
        events: VecDeque::from([QuicEvent::HandshakeCompleted]),
        outgoing: VecDeque::new(),
    });

    let from: SocketAddr = "127.0.0.1:40001".parse().unwrap();
    let packet = build_initial(b"clientdcid", b"clientscid", 1);
    supervisor.handle_datagram(&packet, from).await;

    let guard = table.lock().await;
    assert_eq!(guard.established_count(), 1);
    assert_eq!(guard.pending_count(), 0);
    drop(guard);

    let snap = stats.snapshot(1, 0, true);
    assert_eq!(snap.connections_accepted, 1);

    let connection = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
        .await
        .expect("handler should have been invoked")
        .expect("channel should still be open");
    assert!(!connection.is_initiator);
}

#[tokio::test]
async fn version_mismatch_triggers_negotiation_reply() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let (supervisor, table, stats) = new_supervisor(tx).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let from = client.local_addr().unwrap();

    let packet = build_initial(b"dcid", b"scid", 0xdead_beef);
    supervisor.handle_datagram(&packet, from).await;

    let mut buf = vec![0u8; 128];
    let (len, _) = tokio::time::timeout(std::time::Duration::from_secs(1), client.recv_from(&mut buf))
        .await
        .expect("should have received a reply")
        .unwrap();
    assert_eq!(buf[0] & 0x80, 0x80);
    assert_eq!(&buf[1..5], &[0, 0, 0, 0]);
    let _ = len;

    let guard = table.lock().await;
    assert!(guard.is_empty());
    drop(guard);
    let snap = stats.snapshot(0, 0, true);
    assert_eq!(snap.version_negotiations, 1);
}

#[tokio::test]
async fn malformed_datagram_from_unknown_address_is_invalid() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let (supervisor, table, stats) = new_supervisor(tx).await;

    let from: SocketAddr = "127.0.0.1:40002".parse().unwrap();
    supervisor.handle_datagram(&[0x01, 0x02], from).await;

    let guard = table.lock().await;
    assert!(guard.is_empty());
    drop(guard);
    let snap = stats.snapshot(0, 0, true);
    assert_eq!(snap.invalid_packets, 1);
}

#[tokio::test]
async fn short_header_from_known_address_routes_without_counting_invalid() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let (supervisor, table, stats) = new_supervisor(tx).await;

    arm(Script {
        events: VecDeque::from([QuicEvent::HandshakeCompleted]),
        outgoing: VecDeque::new(),
    });

    let from: SocketAddr = "127.0.0.1:40003".parse().unwrap();
    let initial = build_initial(b"dcid-a", b"scid-a", 1);
    supervisor.handle_datagram(&initial, from).await;

    // A short-header (1-RTT) packet from the same address: no long-header
    // match, but address fallback should find the now-established session.
    supervisor.handle_datagram(&[0x41, 0x02, 0x03], from).await;

    let guard = table.lock().await;
    assert_eq!(guard.established_count(), 1);
    drop(guard);
    let snap = stats.snapshot(1, 0, true);
    assert_eq!(snap.invalid_packets, 0);
}

#[tokio::test]
async fn address_reuse_routes_rotated_cid_to_existing_session() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let (supervisor, table, stats) = new_supervisor(tx).await;

    arm(Script {
        events: VecDeque::from([QuicEvent::HandshakeCompleted]),
        outgoing: VecDeque::new(),
    });

    let from: SocketAddr = "127.0.0.1:40004".parse().unwrap();
    let initial = build_initial(b"original-cid", b"scid-a", 1);
    supervisor.handle_datagram(&initial, from).await;

    arm(Script::default());
    // A second long-header packet from the same address, carrying a cid
    // the listener never issued: should fall back to the existing session
    // rather than spawning a new one.
    let rotated = build_initial(b"never-issued-cid", b"scid-b", 1);
    supervisor.handle_datagram(&rotated, from).await;

    let guard = table.lock().await;
    assert_eq!(guard.established_count(), 1);
    assert_eq!(guard.pending_count(), 0);
    drop(guard);
    let snap = stats.snapshot(1, 0, true);
    assert_eq!(snap.connections_accepted, 1);
}

#[tokio::test]
async fn non_initial_from_unknown_address_is_ignored_not_invalid() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let (supervisor, table, stats) = new_supervisor(tx).await;

    let from: SocketAddr = "127.0.0.1:40005".parse().unwrap();
    // A long-header Handshake packet (type bits 10) from an address with no
    // session: the parser succeeds, but classify() yields Ignore.
    let mut packet = vec![0xE0u8];
    packet.extend_from_slice(&1u32.to_be_bytes());
    packet.push(4);
    packet.extend_from_slice(b"dcid");
    packet.push(0);
    supervisor.handle_datagram(&packet, from).await;

    let guard = table.lock().await;
    assert!(guard.is_empty());
    drop(guard);
    let snap = stats.snapshot(0, 0, true);
    assert_eq!(snap.invalid_packets, 0);
}

#[tokio::test]
async fn connection_terminated_event_tears_down_pending_session() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let (supervisor, table, _stats) = new_supervisor(tx).await;

    arm(Script {
        events: VecDeque::from([QuicEvent::ConnectionTerminated {
            reason_phrase: "peer reset".to_string(),
        }]),
        outgoing: VecDeque::new(),
    });

    let from: SocketAddr = "127.0.0.1:40006".parse().unwrap();
    let packet = build_initial(b"dying-cid", b"scid", 1);
    supervisor.handle_datagram(&packet, from).await;

    let guard = table.lock().await;
    assert!(guard.is_empty());
}

#[tokio::test]
async fn close_while_pending_releases_socket_and_clears_state() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let handler = Arc::new(RecordingHandler { tx });
    let listener: Listener<FakeEngine> = Listener::new(vec![protocol_config()], handler, None);

    arm(Script::default());
    let bound = listener.listen("/ip4/127.0.0.1/udp/0/quic-v1").await.unwrap();
    assert!(listener.is_listening());
    assert_eq!(listener.addresses(), vec![bound]);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let packet = build_initial(b"pending-cid", b"scid", 1);
    client.send_to(&packet, bound.socket_addr()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let snap = listener.stats().await;
    assert_eq!(snap.pending_connections, 1);

    listener.close().await;

    assert!(!listener.is_listening());
    assert!(listener.addresses().is_empty());
    let snap = listener.stats().await;
    assert_eq!(snap.pending_connections, 0);
    assert_eq!(snap.active_connections, 0);

    // A fresh listen() on the same instance succeeds once closed.
    arm(Script::default());
    let rebound = listener.listen("/ip4/127.0.0.1/udp/0/quic-v1").await.unwrap();
    assert!(listener.is_listening());
    listener.close().await;
    let _ = rebound;
}
