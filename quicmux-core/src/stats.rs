//! Monotonic listener statistics (spec §3, §6).

use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "metrics")]
use prometheus::{IntCounter, IntGauge, Registry};

/// Plain counters, always available regardless of whether a Prometheus
/// registry was configured. This struct is the source of truth for
/// `stats()`; the optional [`PrometheusStats`] mirror is additive.
#[derive(Default)]
pub struct ListenerStats {
    pub connections_accepted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub version_negotiations: AtomicU64,
    pub bytes_received: AtomicU64,
    pub packets_processed: AtomicU64,
    pub invalid_packets: AtomicU64,
}

/// A consistent snapshot of the counters plus live session counts, as
/// returned by `Listener::stats()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_processed: u64,
    pub bytes_received: u64,
    pub invalid_packets: u64,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub version_negotiations: u64,
    pub active_connections: usize,
    pub pending_connections: usize,
    pub is_listening: bool,
}

impl ListenerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_packet(&self, bytes: usize) {
        self.packets_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_invalid_packet(&self) {
        self.invalid_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_version_negotiation(&self) {
        self.version_negotiations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(
        &self,
        active_connections: usize,
        pending_connections: usize,
        is_listening: bool,
    ) -> StatsSnapshot {
        StatsSnapshot {
            packets_processed: self.packets_processed.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            invalid_packets: self.invalid_packets.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            version_negotiations: self.version_negotiations.load(Ordering::Relaxed),
            active_connections,
            pending_connections,
            is_listening,
        }
    }
}

/// Optional Prometheus mirror of [`ListenerStats`], following the same
/// "struct of registered counters, updated at the same call sites as the
/// plain counters" shape as the teacher's connection-pool metrics.
#[cfg(feature = "metrics")]
pub struct PrometheusStats {
    pub connections_accepted: IntCounter,
    pub connections_rejected: IntCounter,
    pub version_negotiations: IntCounter,
    pub bytes_received: IntCounter,
    pub packets_processed: IntCounter,
    pub invalid_packets: IntCounter,
    pub active_connections: IntGauge,
    pub pending_connections: IntGauge,
}

#[cfg(feature = "metrics")]
impl PrometheusStats {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let connections_accepted = IntCounter::new(
            "quicmux_connections_accepted_total",
            "Total QUIC connections promoted to established",
        )?;
        let connections_rejected = IntCounter::new(
            "quicmux_connections_rejected_total",
            "Total QUIC connections rejected during promotion",
        )?;
        let version_negotiations = IntCounter::new(
            "quicmux_version_negotiations_total",
            "Total version-negotiation datagrams sent",
        )?;
        let bytes_received = IntCounter::new(
            "quicmux_bytes_received_total",
            "Total bytes received on the listening socket",
        )?;
        let packets_processed = IntCounter::new(
            "quicmux_packets_processed_total",
            "Total datagrams processed",
        )?;
        let invalid_packets = IntCounter::new(
            "quicmux_invalid_packets_total",
            "Total datagrams that failed routing after a parse miss",
        )?;
        let active_connections = IntGauge::new(
            "quicmux_active_connections",
            "Current number of established connections",
        )?;
        let pending_connections = IntGauge::new(
            "quicmux_pending_connections",
            "Current number of in-progress handshakes",
        )?;

        registry.register(Box::new(connections_accepted.clone()))?;
        registry.register(Box::new(connections_rejected.clone()))?;
        registry.register(Box::new(version_negotiations.clone()))?;
        registry.register(Box::new(bytes_received.clone()))?;
        registry.register(Box::new(packets_processed.clone()))?;
        registry.register(Box::new(invalid_packets.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(pending_connections.clone()))?;

        Ok(Self {
            connections_accepted,
            connections_rejected,
            version_negotiations,
            bytes_received,
            packets_processed,
            invalid_packets,
            active_connections,
            pending_connections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let stats = ListenerStats::new();
        let snap = stats.snapshot(0, 0, false);
        assert_eq!(snap.packets_processed, 0);
        assert_eq!(snap.connections_accepted, 0);
    }

    #[test]
    fn records_accumulate() {
        let stats = ListenerStats::new();
        stats.record_packet(100);
        stats.record_packet(50);
        stats.record_invalid_packet();
        stats.record_connection_accepted();
        stats.record_version_negotiation();

        let snap = stats.snapshot(1, 2, true);
        assert_eq!(snap.packets_processed, 2);
        assert_eq!(snap.bytes_received, 150);
        assert_eq!(snap.invalid_packets, 1);
        assert_eq!(snap.connections_accepted, 1);
        assert_eq!(snap.version_negotiations, 1);
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.pending_connections, 2);
        assert!(snap.is_listening);
    }
}
