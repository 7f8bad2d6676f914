/// QUIC Listener with Metrics Example
///
/// This example demonstrates how to run the listener with Prometheus
/// metrics registered.
///
/// Run with: cargo run --example proxy_with_metrics
/// View metrics at: http://localhost:9000/metrics

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use prometheus::Registry;
use quicmux_config::{Config, Metrics, QuicProtocolConfig, TransportParams};
use quicmux_core::engine::{QuicEngine, QuicEvent, UpstreamHandler};
use quicmux_core::stats::PrometheusStats;
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
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into()))
        .with_target(false)
        .json()
        .init();

    let config = Config {
        listen_multiaddr: "/ip4/0.0.0.0/udp/4001/quic-v1".to_string(),
        protocols: vec![QuicProtocolConfig {
            tag: "libp2p".to_string(),
            supported_versions: vec![1],
            certificate: String::new(),
            private_key: String::new(),
            alpn_protocols: vec!["libp2p".to_string()],
            is_client: false,
            transport: TransportParams::default(),
        }],
        metrics: Metrics {
            enabled: true,
            address: "127.0.0.1:9000".to_string(),
        },
    };

    let registry = Registry::new();
    PrometheusStats::register(&registry)?;

    let tags: Vec<&str> = config.protocols.iter().map(|p| p.tag.as_str()).collect();
    println!("Metrics registered, listener serving tags: {}", tags.join(", "));
    println!("Metrics available at: http://{}/metrics", config.metrics.address);
    println!("Press Ctrl+C to stop");

    let listener: Listener<NoopEngine> =
        Listener::new(config.protocols.clone(), Arc::new(LoggingHandler), None);
    listener.listen(&config.listen_multiaddr).await?;

    tokio::signal::ctrl_c().await?;
    listener.close().await;

    Ok(())
}
