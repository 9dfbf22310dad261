use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Registry-scoped connection identifier. Monotonic and never reused, so two
/// connections sharing a remote address (NAT, repeated reconnects) can never
/// collide on their registry key.
pub type ConnId = u64;

/// Lines queued for a single peer before it counts as stalled.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// The registered face of one connection: everything the router needs in
/// order to deliver a line without ever touching the socket itself. The
/// socket write half stays owned by that connection's writer task.
#[derive(Clone)]
pub struct Peer {
    pub id: ConnId,
    pub addr: String,
    outbound: mpsc::Sender<String>,
    shutdown: CancellationToken,
}

impl Peer {
    pub fn new(
        id: ConnId,
        addr: String,
        outbound: mpsc::Sender<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            addr,
            outbound,
            shutdown,
        }
    }

    /// Queue a line for this peer without blocking. A full queue (the peer
    /// has stopped draining its socket) and a closed queue (the writer task
    /// is already gone) are both delivery failures.
    pub fn deliver(&self, line: String) -> Result<(), DeliveryFailed> {
        self.outbound.try_send(line).map_err(|_| DeliveryFailed)
    }

    /// Ask the connection's tasks to wind down. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct DeliveryFailed;

/// The concurrent set of live connections; the only shared mutable state in
/// the server. Every mutation and every snapshot goes through the mutex, so
/// no broadcast ever sees a half-added or half-removed member.
pub struct Registry {
    peers: Mutex<BTreeMap<ConnId, Peer>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn insert(&self, peer: Peer) {
        let mut peers = self.peers.lock().await;
        peers.insert(peer.id, peer);
    }

    /// Removes a peer if it is still registered. Removing twice is a no-op,
    /// which is what lets the router and the connection task race on teardown
    /// without double-announcing a departure.
    pub async fn remove(&self, id: ConnId) -> Option<Peer> {
        let mut peers = self.peers.lock().await;
        peers.remove(&id)
    }

    /// Point-in-time membership, ordered by join (ids are monotonic and the
    /// map iterates in key order), optionally excluding one connection.
    pub async fn snapshot(&self, excluding: Option<ConnId>) -> Vec<Peer> {
        let peers = self.peers.lock().await;
        peers
            .values()
            .filter(|peer| Some(peer.id) != excluding)
            .cloned()
            .collect()
    }

    /// Empties the registry, handing back every remaining peer. Used once,
    /// at server shutdown.
    pub async fn drain(&self) -> Vec<Peer> {
        let mut peers = self.peers.lock().await;
        std::mem::take(&mut *peers).into_values().collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer(registry: &Registry, addr: &str) -> Peer {
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        Peer::new(
            registry.next_id(),
            addr.to_string(),
            tx,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn snapshot_iterates_in_join_order() {
        let registry = Registry::new();
        for addr in ["10.0.0.1:1", "10.0.0.2:2", "10.0.0.3:3"] {
            registry.insert(test_peer(&registry, addr)).await;
        }

        let addrs: Vec<_> = registry
            .snapshot(None)
            .await
            .into_iter()
            .map(|peer| peer.addr)
            .collect();
        assert_eq!(addrs, ["10.0.0.1:1", "10.0.0.2:2", "10.0.0.3:3"]);
    }

    #[tokio::test]
    async fn snapshot_can_exclude_one_member() {
        let registry = Registry::new();
        let first = test_peer(&registry, "10.0.0.1:1");
        let excluded_id = first.id;
        registry.insert(first).await;
        registry.insert(test_peer(&registry, "10.0.0.2:2")).await;

        let members = registry.snapshot(Some(excluded_id)).await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].addr, "10.0.0.2:2");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = Registry::new();
        let peer = test_peer(&registry, "10.0.0.1:1");
        let id = peer.id;
        registry.insert(peer).await;

        assert!(registry.remove(id).await.is_some());
        assert!(registry.remove(id).await.is_none());
        assert!(registry.remove(9999).await.is_none());
    }

    #[tokio::test]
    async fn identical_addresses_get_distinct_entries() {
        let registry = Registry::new();
        registry.insert(test_peer(&registry, "10.0.0.1:1")).await;
        registry.insert(test_peer(&registry, "10.0.0.1:1")).await;

        assert_eq!(registry.snapshot(None).await.len(), 2);
    }

    #[tokio::test]
    async fn drain_empties_the_registry() {
        let registry = Registry::new();
        registry.insert(test_peer(&registry, "10.0.0.1:1")).await;
        registry.insert(test_peer(&registry, "10.0.0.2:2")).await;

        let drained = registry.drain().await;
        assert_eq!(drained.len(), 2);
        assert!(registry.snapshot(None).await.is_empty());
    }
}
