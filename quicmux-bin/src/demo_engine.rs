//! Minimal stand-in QUIC engine for the demo binary.
//!
//! A real deployment plugs in a proper QUIC implementation (handshake,
//! encryption, loss recovery); this crate's job stops at the `QuicEngine`
//! boundary (spec §6). This engine exists only so `quicmux-server` has
//! something concrete to run end to end: it completes the handshake on the
//! first datagram it sees and never negotiates a real stream.
use std::net::SocketAddr;
use std::time::Instant;

use quicmux_config::QuicProtocolConfig;
use quicmux_core::engine::{QuicEngine, QuicEvent};

pub struct DemoEngine {
    handshake_reported: bool,
}

impl QuicEngine for DemoEngine {
    fn new_server(_config: &QuicProtocolConfig, _original_dcid: &[u8]) -> Self {
        DemoEngine {
            handshake_reported: false,
        }
    }

    fn receive_datagram(&mut self, _data: &[u8], _from: SocketAddr, _now: Instant) {}

    fn next_event(&mut self) -> Option<QuicEvent> {
        if self.handshake_reported {
            None
        } else {
            self.handshake_reported = true;
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
