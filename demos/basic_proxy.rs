/// Basic QUIC Listener Example
///
/// This example demonstrates how to run a bare QUIC demultiplexing
/// listener with a minimal single-protocol configuration and no metrics.
/// The QUIC engine itself is a stand-in: this crate demultiplexes and
/// tracks sessions, it does not implement the QUIC handshake.
///
/// Run with: cargo run --example basic_proxy

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use quicmux_config::{Config, Metrics, QuicProtocolConfig, TransportParams};
use quicmux_core::engine::{QuicEngine, QuicEvent, UpstreamHandler};
use quicmux_core::{EstablishedConnection, Listener};

struct NoopEngine {
    handshaked: bool,
}

impl QuicEngine for NoopEngine {
    fn new_server(_config: &QuicProtocolConfig, _original_dcid: &[u8]) -> Self {
        NoopEngine { handshaked: false }
    }
    fn receive_datagram(&mut self, _data: &[u8], _from: SocketAddr, _now: Instant) {}
    fn next_event(&mut self) -> Option<QuicEvent> {
        if self.handshaked {
            None
        } else {
            self.handshaked = true;
            Some(QuicEvent::HandshakeCompleted)
        }
    }
    fn datagrams_to_send(&mut self, _now: Instant) -> Vec<(Vec<u8>, SocketAddr)> {
        Vec::new()
    }
    fn next_timeout(&self) -> Option<Instant> {
        None
    }
    fn on_timeout(&mut self, _now: Instant) {}
    fn close(&mut self, _reason: &str) {}
}

struct LoggingHandler;

impl UpstreamHandler for LoggingHandler {
    fn handle(
        &self,
        connection: EstablishedConnection,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        println!("connection established from {}", connection.remote_multiaddr);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Config {
        listen_multiaddr: "/ip4/0.0.0.0/udp/4001/quic-v1".to_string(),
        protocols: vec![
            QuicProtocolConfig {
                tag: "libp2p".to_string(),
                supported_versions: vec![1],
                certificate: String::new(),
                private_key: String::new(),
                alpn_protocols: vec!["libp2p".to_string()],
                is_client: false,
                transport: TransportParams::default(),
            },
            QuicProtocolConfig {
                tag: "libp2p-draft".to_string(),
                supported_versions: vec![0xff00_001d],
                certificate: String::new(),
                private_key: String::new(),
                alpn_protocols: vec!["libp2p".to_string()],
                is_client: false,
                transport: TransportParams::default(),
            },
        ],
        metrics: Metrics {
            enabled: false,
            address: "127.0.0.1:9000".to_string(),
        },
    };

    let listener: Listener<NoopEngine> =
        Listener::new(config.protocols.clone(), Arc::new(LoggingHandler), None);
    let bound = listener.listen(&config.listen_multiaddr).await?;

    println!("Starting QUIC listener on {bound}, serving tags: {}",
        config.protocols.iter().map(|p| p.tag.as_str()).collect::<Vec<_>>().join(", "));
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    listener.close().await;

    Ok(())
}
