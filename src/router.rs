use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::{ConnId, Peer, Registry};

/// Fans inbound lines out to the current membership. The router only ever
/// enqueues onto each peer's bounded outbound queue; socket writes happen in
/// the peers' own writer tasks, so a stalled recipient cannot stall the
/// iteration over everyone else.
pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Admits a new connection: assigns it an id, registers it, and announces
    /// the join to every current member, the newcomer included (peers see
    /// their own arrival, matching the wire behavior clients expect).
    pub async fn register(
        &self,
        addr: String,
        outbound: mpsc::Sender<String>,
        shutdown: CancellationToken,
    ) -> Peer {
        let peer = Peer::new(self.registry.next_id(), addr, outbound, shutdown);
        self.registry.insert(peer.clone()).await;
        info!(peer = %peer.addr, "client joined");

        let failed = self
            .announce(format!("[SERVER] - {} joined", peer.addr))
            .await;
        self.reap(failed).await;
        peer
    }

    /// Broadcasts one line from `source` to the current membership: the
    /// sender sees `[you]<text>`, everyone else sees `[<addr>]<text>`.
    /// Delivery failures never surface to the caller; the affected peers are
    /// disconnected instead.
    pub async fn relay(&self, source: &Peer, text: &str) {
        let members = self.registry.snapshot(None).await;
        let mut failed = Vec::new();
        for member in members {
            let line = if member.id == source.id {
                format!("[you]{text}")
            } else {
                format!("[{}]{text}", source.addr)
            };
            if member.deliver(line).is_err() {
                failed.push(member.id);
            }
        }
        self.reap(failed).await;
    }

    /// Removes a connection and announces the departure to the remaining
    /// members. Safe to call from both the connection's own teardown and the
    /// router's failure handling; only the call that actually removes the
    /// peer announces anything.
    pub async fn disconnect(&self, id: ConnId) {
        self.reap(vec![id]).await;
    }

    /// Closes every remaining connection. Server shutdown only.
    pub async fn close_all(&self) {
        for peer in self.registry.drain().await {
            peer.close();
        }
    }

    /// Delivers a server notice to every current member, returning the ids
    /// whose delivery failed.
    async fn announce(&self, line: String) -> Vec<ConnId> {
        let members = self.registry.snapshot(None).await;
        members
            .into_iter()
            .filter(|member| member.deliver(line.clone()).is_err())
            .map(|member| member.id)
            .collect()
    }

    /// Removes dead peers and announces their departures. A leave notice can
    /// itself fail against another dead peer, so this loops until the
    /// membership is quiet again.
    async fn reap(&self, mut dead: Vec<ConnId>) {
        while let Some(id) = dead.pop() {
            let Some(peer) = self.registry.remove(id).await else {
                continue;
            };
            debug!(peer = %peer.addr, "client removed");
            peer.close();
            let failed = self.announce(format!("[SERVER] - {} left", peer.addr)).await;
            dead.extend(failed);
        }
    }
}
