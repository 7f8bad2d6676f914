//! Demo upstream handler: logs every promoted connection and echoes back
//! any stream data it receives.

use tracing::info;

use quicmux_core::engine::UpstreamHandler;
use quicmux_core::{EstablishedConnection, StreamEvent};

pub struct EchoHandler;

impl UpstreamHandler for EchoHandler {
    fn handle(
        &self,
        mut connection: EstablishedConnection,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(
            remote = %connection.remote_multiaddr,
            peer_id = ?connection.peer_id,
            "connection established"
        );
        tokio::spawn(async move {
            while let Some(event) = connection.stream_events.recv().await {
                match event {
                    StreamEvent::Data { stream_id, data, fin } => {
                        info!(stream_id, bytes = data.len(), fin, "stream data received");
                    }
                    StreamEvent::Reset { stream_id, error_code } => {
                        info!(stream_id, error_code, "stream reset");
                    }
                }
            }
        });
        Ok(())
    }
}
