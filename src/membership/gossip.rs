//! Gossip Disseminator loop.
//!
//! Proxy nodes first forward the whole queue to proxies of their direct top zones, without
//! consuming it. Then up to `K` peers of our own zone each receive the queue, and the sends that
//! succeed count toward retiring the entries.

use rand::seq::SliceRandom;
use std::sync::Arc;

use super::service::MembershipService;
use super::types::{GossipMessage, Node, NodeState, now_secs};

impl MembershipService {
    pub(crate) async fn gossip_loop(self: Arc<Self>) {
        while self.pause(self.config.timing.gossip_interval()).await {
            let purged = self.events.purge_expired(now_secs());
            if purged > 0 {
                tracing::debug!("Purged {} expired events", purged);
            }
            self.gossip_tick().await;
        }
        tracing::debug!("Gossip loop stopped");
    }

    /// One dissemination round. Returns the number of datagrams sent.
    pub async fn gossip_tick(&self) -> usize {
        if self.broadcasts.is_empty() {
            return 0;
        }

        let me = self.myself();
        let fanout = self.broadcasts.fanout();
        let mut sent = 0;

        if me.is_proxy {
            for top_zone in self.topology.get_direct_top_zones(&me.zone) {
                let peers = pick_peers(self.gossip_peers(|n| n.zone == top_zone && n.is_proxy), fanout);
                for peer in peers {
                    sent += self.gossip_to(&peer, false).await;
                }
            }
        }

        let peers = pick_peers(self.gossip_peers(|n| n.zone == me.zone), fanout);
        for peer in peers {
            sent += self.gossip_to(&peer, true).await;
        }

        sent
    }

    fn gossip_peers(&self, keep: impl Fn(&Node) -> bool) -> Vec<Node> {
        self.registry
            .snapshot()
            .values()
            .filter(|node| node.uuid != self.uuid && node.state != NodeState::Leave)
            .filter(|node| keep(node))
            .cloned()
            .collect()
    }

    /// Sends the whole queue to `peer`. With `consume`, the entries count as sent only once
    /// the datagrams actually left.
    async fn gossip_to(&self, peer: &Node, consume: bool) -> usize {
        let batch = self.broadcasts.pending();
        if batch.is_empty() {
            return 0;
        }
        let messages: Vec<GossipMessage> = batch.iter().map(|b| b.message.clone()).collect();

        match self
            .send_messages(&self.socket, &peer.addr(), &peer.zone, &messages)
            .await
        {
            Ok(sent) => {
                if consume {
                    let ids: Vec<u64> = batch.iter().map(|b| b.id).collect();
                    self.broadcasts.mark_sent(&ids);
                }
                sent
            }
            Err(e) => {
                tracing::debug!("Gossip to {} failed: {}", peer.name, e);
                0
            }
        }
    }
}

fn pick_peers(mut peers: Vec<Node>, count: usize) -> Vec<Node> {
    peers.shuffle(&mut rand::thread_rng());
    peers.truncate(count);
    peers
}
