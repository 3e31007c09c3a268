//! Failure Detector
//!
//! Every probe interval we ping the nodes waiting for a ping-back plus one random eligible
//! peer. A missing ack falls back to an indirect probe through up to `indirect_relays` alive
//! nodes of the target's zone; if none of them gets an answer either, the target becomes
//! `suspect`. The reaper turns stale suspects into `dead` and purges old `leave` nodes.

use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::UdpSocket;

use super::bus::NodeEvent;
use super::error::{MembershipError, Result};
use super::history::HistoryEntry;
use super::service::MembershipService;
use super::types::{Ack, GossipMessage, Node, NodeId, NodeMessage, NodeState, Ping, PingRelay, now_secs};

/// What a probe concluded about its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Alive,
    Leaving,
    Suspected,
}

impl MembershipService {
    pub(crate) async fn detector_loop(self: Arc<Self>) {
        while self.pause(self.config.timing.probe_interval()).await {
            for target in self.next_probe_targets() {
                if self.is_stopping() {
                    break;
                }
                self.probe(&target).await;
            }
        }
        tracing::debug!("Failure detector stopped");
    }

    pub(crate) async fn reaper_loop(self: Arc<Self>) {
        while self.pause(self.config.timing.probe_interval()).await {
            self.reap_expired(now_secs());
        }
    }

    /// Pending ping-backs first, then one random eligible peer.
    pub fn next_probe_targets(&self) -> Vec<Node> {
        let ping_back = std::mem::take(&mut *self.ping_back.lock());
        let mut targets: Vec<Node> = ping_back
            .iter()
            .filter_map(|uuid| self.registry.get(uuid))
            .filter(|node| node.state != NodeState::Leave)
            .collect();

        let candidates = self.ping_candidates();
        if let Some(random) = candidates.choose(&mut rand::thread_rng())
            && !targets.iter().any(|t| t.uuid == random.uuid)
        {
            targets.push(random.clone());
        }
        targets
    }

    /// Peers we may probe: not us, not leaving. Other zones only proxy to proxy, and only
    /// across a direct zone link.
    pub fn ping_candidates(&self) -> Vec<Node> {
        let me = self.myself();
        self.registry
            .snapshot()
            .values()
            .filter(|node| node.uuid != me.uuid && node.state != NodeState::Leave)
            .filter(|node| {
                node.zone == me.zone
                    || (me.is_proxy
                        && node.is_proxy
                        && (self.topology.is_direct_top_zone(&me.zone, &node.zone)
                            || self.topology.is_direct_sub_zone(&me.zone, &node.zone)))
            })
            .cloned()
            .collect()
    }

    /// Probes one node, directly then indirectly, and applies the verdict.
    pub async fn probe(&self, target: &Node) -> ProbeOutcome {
        let ack = match self.do_ping(target).await {
            Ok(ack) => Some(ack),
            Err(e) => {
                tracing::debug!("Direct ping to {} failed: {}", target.name, e);
                self.indirect_ping(target).await
            }
        };

        match ack {
            Some(node) if node.state == NodeState::Leave => {
                self.set_leave(node.into_node(), false);
                ProbeOutcome::Leaving
            }
            Some(node) => {
                self.set_alive(
                    Node {
                        state: NodeState::Alive,
                        ..node.into_node()
                    },
                    false,
                    true,
                );
                ProbeOutcome::Alive
            }
            None => {
                tracing::debug!("No ack from {} ({}), suspecting it", target.name, target.uuid);
                self.set_suspect(target.clone());
                ProbeOutcome::Suspected
            }
        }
    }

    /// Sends a ping from a fresh socket and waits for the matching ack.
    pub async fn do_ping(&self, target: &Node) -> Result<NodeMessage> {
        let me = self.myself();
        let seqno = self.seqno.fetch_add(1, Ordering::Relaxed);
        let ping = GossipMessage::Ping(Ping {
            node: target.uuid.clone(),
            from: me.uuid.clone(),
            from_zone: me.zone.clone(),
            seqno,
        });

        let socket = self.ephemeral_socket().await?;
        let addr = target.addr();
        self.send_messages(&socket, &addr, &target.zone, &[ping])
            .await?;

        let reply = self
            .wait_for_ack(&socket, &addr, self.config.timing.ping_timeout(), |ack| {
                ack.seqno == seqno && ack.node.uuid == target.uuid
            })
            .await?;
        Ok(reply.node)
    }

    /// Asks a few alive nodes of the target's zone to ping it for us. First ack wins.
    async fn indirect_ping(&self, target: &Node) -> Option<NodeMessage> {
        let me = self.myself();
        let mut relays: Vec<Node> = self
            .registry
            .snapshot()
            .values()
            .filter(|node| node.uuid != me.uuid && node.uuid != target.uuid)
            .filter(|node| node.state == NodeState::Alive && node.zone == target.zone)
            .cloned()
            .collect();
        relays.shuffle(&mut rand::thread_rng());
        relays.truncate(self.config.timing.indirect_relays);

        if relays.is_empty() {
            return None;
        }

        let socket = match self.ephemeral_socket().await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::debug!("Cannot open relay socket: {}", e);
                return None;
            }
        };

        let request = GossipMessage::PingRelay(PingRelay {
            tgt: target.uuid.clone(),
            from: me.uuid.clone(),
            from_zone: me.zone.clone(),
        });
        let mut asked = 0;
        for relay in &relays {
            match self
                .send_messages(&socket, &relay.addr(), &relay.zone, std::slice::from_ref(&request))
                .await
            {
                Ok(_) => asked += 1,
                Err(e) => tracing::debug!("Cannot reach relay {}: {}", relay.name, e),
            }
        }
        if asked == 0 {
            return None;
        }

        let timeout = self.config.timing.indirect_ping_timeout();
        match self
            .wait_for_ack(&socket, "relays", timeout, |ack| ack.node.uuid == target.uuid)
            .await
        {
            Ok(ack) => {
                tracing::debug!("Indirect ping to {} succeeded", target.name);
                Some(ack.node)
            }
            Err(e) => {
                tracing::debug!("Indirect ping to {} failed: {}", target.name, e);
                None
            }
        }
    }

    /// Answers a ping addressed to us, and queues a ping-back if we believed the sender was
    /// not alive.
    pub(crate) async fn handle_ping(&self, ping: Ping, src: SocketAddr) -> Result<()> {
        if ping.node != self.uuid {
            tracing::debug!("Ignoring ping for {} (not us) from {}", ping.node, src);
            return Ok(());
        }

        if let Some(sender) = self.registry.get(&ping.from)
            && sender.state != NodeState::Alive
            && sender.state != NodeState::Leave
        {
            self.queue_ping_back(sender.uuid);
        }

        let me = self.myself();
        let ack = GossipMessage::Ack(Ack {
            node: NodeMessage::from_node(&me, me.state),
            seqno: ping.seqno,
        });
        self.send_messages(&self.socket, &src.to_string(), &ping.from_zone, &[ack])
            .await?;
        Ok(())
    }

    /// Pings `relay.tgt` on behalf of the requester and forwards the ack back to it.
    pub(crate) async fn handle_ping_relay(&self, relay: PingRelay, src: SocketAddr) {
        let Some(target) = self.registry.get(&relay.tgt) else {
            tracing::debug!("Ping relay for unknown node {} from {}", relay.tgt, src);
            return;
        };

        let node = match self.do_ping(&target).await {
            Ok(node) => node,
            Err(e) => {
                tracing::debug!("Relayed ping to {} failed: {}", target.name, e);
                return;
            }
        };

        let ack = GossipMessage::Ack(Ack { node, seqno: 0 });
        if let Err(e) = self
            .send_messages(&self.socket, &src.to_string(), &relay.from_zone, &[ack])
            .await
        {
            tracing::debug!("Cannot forward relayed ack to {}: {}", src, e);
        }
    }

    async fn ephemeral_socket(&self) -> Result<UdpSocket> {
        let ip = self.socket.local_addr()?.ip();
        Ok(UdpSocket::bind(SocketAddr::new(ip, 0)).await?)
    }

    async fn wait_for_ack(
        &self,
        socket: &UdpSocket,
        peer: &str,
        timeout: Duration,
        matches: impl Fn(&Ack) -> bool,
    ) -> Result<Ack> {
        let mut buf = vec![0u8; 65536];
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
            let (len, src) = match received {
                Err(_) => return Err(MembershipError::Timeout(peer.to_string())),
                Ok(Err(e)) => return Err(MembershipError::network(peer, e)),
                Ok(Ok(received)) => received,
            };

            let Some(messages) = self.open_packet(&buf[..len], src) else {
                continue;
            };
            for message in messages {
                if let GossipMessage::Ack(ack) = message
                    && matches(&ack)
                {
                    return Ok(ack);
                }
            }
        }
    }

    /// Suspects past their timeout become `dead`, `leave` nodes past theirs are purged.
    ///
    /// Returns `(newly dead, purged)`. `dead` nodes are never purged.
    pub fn reap_expired(&self, now: u64) -> (usize, usize) {
        let node_count = self.registry.len();
        let suspect_timeout = self.config.timing.suspect_timeout(node_count).as_secs();
        let leave_timeout = self.config.timing.leave_timeout(node_count).as_secs();

        let (dead, purged) = self.registry.write(|nodes| {
            let mut dead = Vec::new();
            let mut purged = Vec::new();

            for node in nodes.values_mut() {
                if node.uuid == self.uuid {
                    continue;
                }
                match (node.state, node.suspect_time, node.leave_time) {
                    (NodeState::Suspect, Some(since), _) if now > since + suspect_timeout => {
                        node.state = NodeState::Dead;
                        dead.push(node.clone());
                    }
                    (NodeState::Leave, _, Some(since)) if now > since + leave_timeout => {
                        purged.push(node.uuid.clone());
                    }
                    _ => {}
                }
            }
            for uuid in &purged {
                nodes.remove(uuid);
            }
            (dead, purged)
        });

        for node in &dead {
            tracing::info!("Node {} ({}) suspected for too long, now dead", node.name, node.uuid);
            self.history.add(HistoryEntry::NodeStateChange {
                name: node.name.clone(),
                display_name: node.display_name.clone(),
                uuid: node.uuid.clone(),
                old_state: NodeState::Suspect,
                state: NodeState::Dead,
            });
            self.bus.publish(NodeEvent::ChangeNode(node.uuid.clone()));
            self.broadcasts.push(GossipMessage::dead(node));
        }
        for uuid in &purged {
            tracing::info!("Purging node {} after its leave timeout", uuid);
            self.bus.publish(NodeEvent::DeleteNode(uuid.clone()));
        }

        (dead.len(), purged.len())
    }

    pub fn queue_ping_back(&self, uuid: NodeId) {
        let mut queue = self.ping_back.lock();
        if !queue.contains(&uuid) {
            queue.push(uuid);
        }
    }
}
