//! Dual-keyed routing table (spec §4.3).
//!
//! The teacher's session tables (`sniproxy-core/src/udp_connection.rs`) use
//! an `Arc<DashMap<SocketAddr, Session>>` behind one shared handle: each
//! map operation is independently locked. Spec §5 requires a single lock
//! held across an entire datagram's classify → lookup → insert-or-route →
//! dispatch → drain → transmit sequence, which a sharded map cannot give us
//! (two different map operations in the same critical section could land on
//! different shard locks). We generalize the teacher's "one shared handle"
//! shape to a single `tokio::sync::Mutex` guarding all four maps together.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use crate::engine::QuicEngine;
use crate::session::{EstablishedSession, PendingSession};

/// Opaque connection identifier, 0-20 bytes, compared bytewise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(Vec<u8>);

impl ConnectionId {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Generates a new server-side connection ID: 8 cryptographically
    /// random bytes, as required by spec §3.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = vec![0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

/// The outcome of classifying an incoming datagram against the routing
/// table (design note §9): a single tagged result instead of a ladder of
/// conditionals at the call site.
pub enum RouteDecision {
    Established(ConnectionId),
    Pending(ConnectionId),
    /// Routed by address fallback to an existing session under a different
    /// cid than the one carried in the packet (CID rotation, or a
    /// server-generated cid the listener hasn't learned from this packet).
    ExistingByAddr(ConnectionId),
    /// No session recognizes this datagram; if it's an Initial, create one.
    New,
    /// Not an Initial and unrecognized: drop silently.
    Ignore,
}

/// The state guarded by the single routing lock.
pub struct RoutingInner<E: QuicEngine> {
    pending: HashMap<ConnectionId, PendingSession<E>>,
    established: HashMap<ConnectionId, EstablishedSession<E>>,
    addr_to_cid: HashMap<SocketAddr, ConnectionId>,
    cid_to_addr: HashMap<ConnectionId, SocketAddr>,
}

impl<E: QuicEngine> Default for RoutingInner<E> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            established: HashMap::new(),
            addr_to_cid: HashMap::new(),
            cid_to_addr: HashMap::new(),
        }
    }
}

impl<E: QuicEngine> RoutingInner<E> {
    /// Classifies an incoming datagram per the tie-break ladder in spec
    /// §4.3: established cid match wins, then pending cid match, then
    /// address fallback (pruning a dangling mapping if found), then "new"
    /// for an Initial or "ignore" otherwise.
    pub fn classify(&mut self, dcid: &ConnectionId, addr: SocketAddr, is_initial: bool) -> RouteDecision {
        if self.established.contains_key(dcid) {
            return RouteDecision::Established(dcid.clone());
        }
        if self.pending.contains_key(dcid) {
            return RouteDecision::Pending(dcid.clone());
        }
        if let Some(existing_cid) = self.addr_to_cid.get(&addr).cloned() {
            if self.established.contains_key(&existing_cid) {
                return RouteDecision::ExistingByAddr(existing_cid);
            }
            if self.pending.contains_key(&existing_cid) {
                return RouteDecision::ExistingByAddr(existing_cid);
            }
            // Dangling mapping: no session behind it. Delete and proceed
            // as though the address were truly unknown.
            self.addr_to_cid.remove(&addr);
            self.cid_to_addr.remove(&existing_cid);
        }
        if is_initial {
            RouteDecision::New
        } else {
            RouteDecision::Ignore
        }
    }

    pub fn lookup_pending_mut(&mut self, cid: &ConnectionId) -> Option<&mut PendingSession<E>> {
        self.pending.get_mut(cid)
    }

    pub fn lookup_established_mut(&mut self, cid: &ConnectionId) -> Option<&mut EstablishedSession<E>> {
        self.established.get_mut(cid)
    }

    pub fn lookup_by_addr(&self, addr: &SocketAddr) -> Option<&ConnectionId> {
        self.addr_to_cid.get(addr)
    }

    /// Inserts a new pending session. Requires neither `cid` nor `addr` to
    /// be currently mapped.
    pub fn insert_pending(&mut self, cid: ConnectionId, addr: SocketAddr, session: PendingSession<E>) {
        debug_assert!(!self.pending.contains_key(&cid) && !self.established.contains_key(&cid));
        debug_assert!(!self.addr_to_cid.contains_key(&addr));
        self.addr_to_cid.insert(addr, cid.clone());
        self.cid_to_addr.insert(cid.clone(), addr);
        self.pending.insert(cid, session);
    }

    /// Removes the engine from the pending map under `cid`, returning its
    /// `PendingSession` so the caller can wrap it as established. Address
    /// mappings are left untouched.
    pub fn take_pending(&mut self, cid: &ConnectionId) -> Option<PendingSession<E>> {
        self.pending.remove(cid)
    }

    /// Re-inserts the session under the same cid, now established. The
    /// `addr_to_cid`/`cid_to_addr` entries are unchanged.
    pub fn insert_established(&mut self, cid: ConnectionId, session: EstablishedSession<E>) {
        self.established.insert(cid, session);
    }

    /// Removes the session from whichever side holds it and drops both
    /// address mappings.
    pub fn remove(&mut self, cid: &ConnectionId) {
        self.pending.remove(cid);
        self.established.remove(cid);
        if let Some(addr) = self.cid_to_addr.remove(cid) {
            self.addr_to_cid.remove(&addr);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn established_count(&self) -> usize {
        self.established.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.established.is_empty() && self.addr_to_cid.is_empty() && self.cid_to_addr.is_empty()
    }

    pub fn established_cids(&self) -> Vec<ConnectionId> {
        self.established.keys().cloned().collect()
    }

    pub fn pending_cids(&self) -> Vec<ConnectionId> {
        self.pending.keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn addr_cid_invariant_holds(&self) -> bool {
        if self.addr_to_cid.len() != self.cid_to_addr.len() {
            return false;
        }
        self.addr_to_cid
            .iter()
            .all(|(addr, cid)| self.cid_to_addr.get(cid) == Some(addr))
    }
}

/// Shared handle to the routing table. All mutation is serialized through
/// the single contained mutex (spec §5).
pub struct RoutingTable<E: QuicEngine> {
    inner: Arc<Mutex<RoutingInner<E>>>,
}

impl<E: QuicEngine> Clone for RoutingTable<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: QuicEngine> Default for RoutingTable<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RoutingInner::default())),
        }
    }
}

impl<E: QuicEngine> RoutingTable<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, RoutingInner<E>> {
        self.inner.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::QuicEvent;
    use crate::session::PendingSession;
    use std::time::Instant;

    struct NoopEngine;

    impl QuicEngine for NoopEngine {
        fn new_server(_config: &quicmux_config::QuicProtocolConfig, _original_dcid: &[u8]) -> Self {
            NoopEngine
        }
        fn receive_datagram(&mut self, _data: &[u8], _from: SocketAddr, _now: Instant) {}
        fn next_event(&mut self) -> Option<QuicEvent> {
            None
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

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn pending(addr: SocketAddr) -> PendingSession<NoopEngine> {
        PendingSession {
            engine: NoopEngine,
            peer_addr: addr,
            negotiated_version: 1,
        }
    }

    #[tokio::test]
    async fn classify_unknown_initial_is_new() {
        let table: RoutingTable<NoopEngine> = RoutingTable::new();
        let mut guard = table.lock().await;
        let cid = ConnectionId::from_bytes(b"cid1".to_vec());
        match guard.classify(&cid, addr(1), true) {
            RouteDecision::New => {}
            _ => panic!("expected New"),
        }
    }

    #[tokio::test]
    async fn classify_unknown_non_initial_is_ignored() {
        let table: RoutingTable<NoopEngine> = RoutingTable::new();
        let mut guard = table.lock().await;
        let cid = ConnectionId::from_bytes(b"cid1".to_vec());
        match guard.classify(&cid, addr(1), false) {
            RouteDecision::Ignore => {}
            _ => panic!("expected Ignore"),
        }
    }

    #[tokio::test]
    async fn established_cid_match_wins_unconditionally() {
        let table: RoutingTable<NoopEngine> = RoutingTable::new();
        let cid = ConnectionId::from_bytes(b"cid1".to_vec());
        {
            let mut guard = table.lock().await;
            guard.insert_pending(cid.clone(), addr(1), pending(addr(1)));
            let taken = guard.take_pending(&cid).unwrap();
            guard.insert_established(
                cid.clone(),
                EstablishedSession {
                    engine: taken.engine,
                    peer_addr: taken.peer_addr,
                    remote_multiaddr: crate::multiaddr::QuicMultiaddr {
                        ip: addr(1).ip(),
                        port: addr(1).port(),
                    },
                    is_initiator: false,
                    peer_id: None,
                    stream_tx: tokio::sync::mpsc::unbounded_channel().0,
                },
            );
        }
        let mut guard = table.lock().await;
        match guard.classify(&cid, addr(1), true) {
            RouteDecision::Established(got) => assert_eq!(got, cid),
            _ => panic!("expected Established"),
        }
    }

    #[tokio::test]
    async fn address_fallback_routes_rotated_cid_to_existing_session() {
        let table: RoutingTable<NoopEngine> = RoutingTable::new();
        let original_cid = ConnectionId::from_bytes(b"orig".to_vec());
        {
            let mut guard = table.lock().await;
            guard.insert_pending(original_cid.clone(), addr(1), pending(addr(1)));
        }
        let mut guard = table.lock().await;
        let unknown_cid = ConnectionId::from_bytes(b"never-issued".to_vec());
        match guard.classify(&unknown_cid, addr(1), true) {
            RouteDecision::ExistingByAddr(got) => assert_eq!(got, original_cid),
            _ => panic!("expected ExistingByAddr"),
        }
    }

    #[tokio::test]
    async fn dangling_address_mapping_is_pruned_and_treated_as_new() {
        let table: RoutingTable<NoopEngine> = RoutingTable::new();
        let cid = ConnectionId::from_bytes(b"cid1".to_vec());
        {
            let mut guard = table.lock().await;
            guard.insert_pending(cid.clone(), addr(1), pending(addr(1)));
            // Simulate a dangling mapping: session removed without cleaning
            // address maps via the normal remove() path.
            guard.pending.remove(&cid);
        }
        let mut guard = table.lock().await;
        let other_cid = ConnectionId::from_bytes(b"other".to_vec());
        match guard.classify(&other_cid, addr(1), true) {
            RouteDecision::New => {}
            _ => panic!("expected New after pruning dangling mapping"),
        }
        assert!(guard.addr_to_cid.is_empty());
        assert!(guard.cid_to_addr.is_empty());
    }

    #[tokio::test]
    async fn remove_clears_both_directions() {
        let table: RoutingTable<NoopEngine> = RoutingTable::new();
        let cid = ConnectionId::from_bytes(b"cid1".to_vec());
        let mut guard = table.lock().await;
        guard.insert_pending(cid.clone(), addr(1), pending(addr(1)));
        guard.remove(&cid);
        assert!(guard.is_empty());
    }

    #[tokio::test]
    async fn addr_cid_maps_stay_mutual_inverses() {
        let table: RoutingTable<NoopEngine> = RoutingTable::new();
        let mut guard = table.lock().await;
        for i in 0..10u16 {
            let cid = ConnectionId::from_bytes(vec![i as u8]);
            guard.insert_pending(cid, addr(i), pending(addr(i)));
        }
        assert!(guard.addr_cid_invariant_holds());
        let cid5 = ConnectionId::from_bytes(vec![5u8]);
        guard.remove(&cid5);
        assert!(guard.addr_cid_invariant_holds());
    }
}
