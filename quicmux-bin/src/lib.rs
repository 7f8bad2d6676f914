mod demo_engine;
mod handler;

use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use demo_engine::DemoEngine;
use handler::EchoHandler;
use quicmux_config::Config;
use quicmux_core::Listener;

/// Loads configuration, starts the QUIC listener, and (optionally) a
/// Prometheus metrics/health HTTP server, running until a shutdown signal
/// is delivered on `shutdown_tx`.
pub async fn run(config_path: &Path) -> Result<(), Box<dyn Error>> {
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("quicmux=debug".parse()?),
        )
        .with_target(false)
        .json()
        .init();

    let config = Config::from_file(config_path)?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

    // Built up front, not inside run_listener: the metrics server's
    // /health endpoint reports this listener's live session counts, so it
    // needs its own clone of the handle before either task starts.
    let listener: Arc<Listener<DemoEngine>> = Arc::new(Listener::new(
        config.protocols.clone(),
        Arc::new(EchoHandler),
        None,
    ));

    let (registry, metrics_handle) = if config.metrics.enabled {
        let registry = Registry::new();
        if let Err(err) = quicmux_core::stats::PrometheusStats::register(&registry) {
            warn!(error = %err, "failed to register QUIC listener metrics");
        }

        let metrics_addr: SocketAddr = config.metrics.address.parse()?;
        let metrics_listener = TcpListener::bind(metrics_addr).await?;
        info!("Metrics server listening on {}", metrics_addr);

        let registry_clone = registry.clone();
        let listener_clone = listener.clone();
        let mut shutdown_rx_clone = shutdown_rx.resubscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx_clone.recv() => {
                        info!("Metrics server shutting down");
                        break;
                    }
                    result = metrics_listener.accept() => {
                        if let Ok((stream, _)) = result {
                            let registry = registry_clone.clone();
                            let listener = listener_clone.clone();
                            let io = TokioIo::new(stream);

                            tokio::spawn(async move {
                                let service = hyper::service::service_fn(
                                    move |req: Request<hyper::body::Incoming>| {
                                        let registry = registry.clone();
                                        let listener = listener.clone();
                                        async move {
                                            match req.uri().path() {
                                                "/metrics" => {
                                                    let encoder = TextEncoder::new();
                                                    let metric_families = registry.gather();
                                                    let mut buffer = vec![];
                                                    encoder
                                                        .encode(&metric_families, &mut buffer)
                                                        .map_err(|e| {
                                                            format!("metrics encoding error: {e}")
                                                        })?;
                                                    Ok::<_, String>(Response::new(Full::new(
                                                        Bytes::from(buffer),
                                                    )))
                                                }
                                                "/health" => {
                                                    let snapshot = listener.stats().await;
                                                    let status = if snapshot.is_listening {
                                                        "healthy"
                                                    } else {
                                                        "not_listening"
                                                    };
                                                    let body = format!(
                                                        r#"{{"status":"{status}","listening":{},"active_connections":{},"pending_connections":{}}}"#,
                                                        snapshot.is_listening,
                                                        snapshot.active_connections,
                                                        snapshot.pending_connections,
                                                    );
                                                    Ok::<_, String>(Response::new(Full::new(
                                                        Bytes::from(body),
                                                    )))
                                                }
                                                "/" => Ok::<_, String>(Response::new(Full::new(
                                                    Bytes::from(r#"{"endpoints":["/health","/metrics"]}"#),
                                                ))),
                                                _ => Ok::<_, String>(Response::new(Full::new(
                                                    Bytes::from(r#"{"error":"not_found"}"#),
                                                ))),
                                            }
                                        }
                                    },
                                );

                                if let Err(err) =
                                    http1::Builder::new().serve_connection(io, service).await
                                {
                                    warn!("Metrics server connection error: {}", err);
                                }
                            });
                        }
                    }
                }
            }
        });

        (Some(registry), Some(handle))
    } else {
        (None, None)
    };

    let result = run_listener(&config, &listener, shutdown_rx).await;

    let _ = shutdown_tx.send(());
    if let Some(handle) = metrics_handle {
        info!("Waiting for metrics server to shut down");
        let _ = handle.await;
    }

    result
}

async fn run_listener(
    config: &Config,
    listener: &Listener<DemoEngine>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), Box<dyn Error>> {
    let bound = listener.listen(&config.listen_multiaddr).await?;
    info!(
        local = %bound,
        tags = ?config.protocols.iter().map(|p| p.tag.as_str()).collect::<Vec<_>>(),
        "quicmux listener started"
    );

    shutdown_rx.recv().await.ok();
    info!("shutdown received, closing listener");
    listener.close().await;

    Ok(())
}
