//! Anti-Entropy Sync
//!
//! Periodic push-pull with one random peer over HTTP, the zone-filtered answer to incoming
//! push-pulls, the startup join and LAN broadcast detection.

use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

use super::error::{MembershipError, Result};
use super::protocol::{ENDPOINT_PUSH_PULL, PushPullEnvelope, PushPullReply};
use super::service::MembershipService;
use super::types::{DetectPing, DetectPong, GossipMessage, Node, NodeId, NodeMessage, NodeState};

impl MembershipService {
    pub(crate) async fn sync_loop(self: Arc<Self>) {
        while self.pause(self.config.timing.sync_interval()).await {
            let candidates = self.sync_candidates();
            let Some(peer) = candidates.choose(&mut rand::thread_rng()) else {
                continue;
            };

            match self.push_pull(&peer.addr()).await {
                Ok(count) => tracing::debug!("Push-pull with {} returned {} nodes", peer.name, count),
                Err(e) if e.is_transient() => {
                    tracing::debug!("Push-pull with {} failed, retrying later: {}", peer.name, e)
                }
                Err(e) => tracing::warn!("Push-pull with {} failed: {}", peer.name, e),
            }
        }
        tracing::debug!("Sync loop stopped");
    }

    /// Alive peers of our zone, and alive proxies of our direct top zones.
    pub fn sync_candidates(&self) -> Vec<Node> {
        let me = self.myself();
        self.registry
            .snapshot()
            .values()
            .filter(|node| node.uuid != me.uuid && node.state == NodeState::Alive)
            .filter(|node| {
                node.zone == me.zone
                    || (node.is_proxy && self.topology.is_direct_top_zone(&me.zone, &node.zone))
            })
            .cloned()
            .collect()
    }

    /// What we push: our own zone and everything below it, plus unexpired events.
    pub fn build_push_pull_envelope(&self) -> PushPullEnvelope {
        let zone = self.local_zone();
        let sub_zones = self.topology.get_sub_zones(&zone);
        let nodes = self
            .registry
            .snapshot()
            .iter()
            .filter(|(_, node)| {
                node.zone.is_empty() || node.zone == zone || sub_zones.contains(&node.zone)
            })
            .map(|(uuid, node)| (uuid.clone(), node.clone()))
            .collect();
        PushPullEnvelope::new(&zone, nodes, self.events.snapshot())
    }

    /// Exchanges full views with the agent at `addr` (`host:port`) and merges its answer.
    ///
    /// Returns the number of nodes received.
    pub async fn push_pull(&self, addr: &str) -> Result<usize> {
        let envelope = self.build_push_pull_envelope();
        let msg = serde_json::to_string(&envelope)?;
        let url = format!("http://{}{}", addr, ENDPOINT_PUSH_PULL);

        let response = self
            .http_client
            .get(&url)
            .query(&[("msg", msg)])
            .timeout(self.config.timing.ping_timeout() * 3)
            .send()
            .await?;

        let status = response.status();
        match response.json::<PushPullReply>().await? {
            PushPullReply::Refused(refused) if status == reqwest::StatusCode::FORBIDDEN => {
                Err(MembershipError::UnauthorizedZone(refused.error))
            }
            PushPullReply::Refused(refused) => {
                tracing::debug!("Push-pull to {} answered {}: {}", addr, status, refused.error);
                Err(MembershipError::UnexpectedReply(addr.to_string()))
            }
            PushPullReply::Accepted(reply) => {
                let count = reply.nodes.len();
                self.merge_nodes(reply.nodes);
                self.merge_events(reply.events);
                Ok(count)
            }
        }
    }

    /// Serves an incoming push-pull: answer according to the caller's zone, then merge what
    /// it sent us.
    pub fn answer_push_pull(&self, envelope: PushPullEnvelope) -> Result<PushPullEnvelope> {
        let nodes = self.nodes_for_push_pull_response(&envelope.ask_from_zone)?;
        let reply = PushPullEnvelope::new(&self.local_zone(), nodes, self.events.snapshot());

        self.merge_nodes(envelope.nodes);
        self.merge_events(envelope.events);
        Ok(reply)
    }

    /// The node view a caller from `caller_zone` is allowed to see.
    ///
    /// - same zone or one of our top zones: everything we know
    /// - direct sub zone: our proxies plus the caller's own zone
    /// - anything else: refused
    pub fn nodes_for_push_pull_response(&self, caller_zone: &str) -> Result<HashMap<NodeId, Node>> {
        let zone = self.local_zone();
        let nodes = self.registry.snapshot();

        if caller_zone == zone || self.topology.is_top_zone(&zone, caller_zone) {
            return Ok((*nodes).clone());
        }

        if self.topology.is_direct_sub_zone(&zone, caller_zone) {
            return Ok(nodes
                .iter()
                .filter(|(_, node)| (node.zone == zone && node.is_proxy) || node.zone == caller_zone)
                .map(|(uuid, node)| (uuid.clone(), node.clone()))
                .collect());
        }

        tracing::warn!("Refusing push-pull from unrelated zone {}", caller_zone);
        Err(MembershipError::UnauthorizedZone(caller_zone.to_string()))
    }

    /// Startup join.
    ///
    /// With seeds: push-pull them until another node is known (a bootstrap node tries once).
    /// Without seeds but with auto-detection: push-pull the detected proxies in a stable
    /// order so nodes starting together pick the same target.
    pub async fn join(&self) -> bool {
        let seeds = self.config.seeds.clone();

        if !seeds.is_empty() {
            loop {
                for seed in &seeds {
                    match self.push_pull(seed).await {
                        Ok(count) => tracing::info!("Joined through {} ({} nodes)", seed, count),
                        Err(e) => tracing::debug!("Seed {} did not answer: {}", seed, e),
                    }
                }
                if self.registry.len() > 1 {
                    return true;
                }
                if self.config.bootstrap {
                    tracing::info!("No seed answered, starting as cluster bootstrap");
                    return false;
                }
                if !self.pause(self.config.timing.probe_interval()).await {
                    return false;
                }
            }
        }

        if !self.config.auto_detect {
            return false;
        }

        let timeout = Duration::from_secs(self.config.detect_timeout_secs);
        let detected = match self.detect(timeout).await {
            Ok(detected) => detected,
            Err(e) => {
                tracing::warn!("Network detection failed: {}", e);
                return false;
            }
        };

        self.join_detected(detected).await
    }

    /// Push-pulls the detected proxies in address order until one answers.
    pub(crate) async fn join_detected(&self, detected: Vec<NodeMessage>) -> bool {
        let mut proxies: Vec<Node> = detected
            .into_iter()
            .map(NodeMessage::into_node)
            .filter(|node| node.is_proxy)
            .collect();
        proxies.sort_by_key(|node| node.addr());

        for proxy in proxies {
            match self.push_pull(&proxy.addr()).await {
                Ok(count) => {
                    tracing::info!("Auto-joined through {} ({} nodes)", proxy.addr(), count);
                    return true;
                }
                Err(e) => tracing::debug!("Detected proxy {} did not answer: {}", proxy.addr(), e),
            }
        }
        false
    }

    /// Broadcasts a detect-ping on the LAN and collects the pongs for `timeout`.
    pub async fn detect(&self, timeout: Duration) -> Result<Vec<NodeMessage>> {
        let port = self.socket.local_addr()?.port();
        self.detect_at(SocketAddr::from((Ipv4Addr::BROADCAST, port)), timeout)
            .await
    }

    /// Sends a detect-ping to `target` and collects the pongs of every other node for
    /// `timeout`.
    pub(crate) async fn detect_at(
        &self,
        target: SocketAddr,
        timeout: Duration,
    ) -> Result<Vec<NodeMessage>> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
        socket.set_broadcast(true)?;

        let zone = self.local_zone();
        let ping = GossipMessage::DetectPing(DetectPing {
            from_zone: zone.clone(),
        });
        let target = target.to_string();
        self.send_messages(&socket, &target, &zone, &[ping]).await?;

        let mut found: HashMap<NodeId, NodeMessage> = HashMap::new();
        let mut buf = vec![0u8; 65536];
        let deadline = tokio::time::Instant::now() + timeout;

        while let Ok(received) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            let (len, src) = match received {
                Ok(received) => received,
                Err(e) => return Err(MembershipError::network(target, e)),
            };
            let Some(messages) = self.open_packet(&buf[..len], src) else {
                continue;
            };
            for message in messages {
                if let GossipMessage::DetectPong(pong) = message
                    && pong.node.uuid != self.uuid
                {
                    tracing::debug!("Detected {} at {}", pong.node.name, src);
                    found.insert(pong.node.uuid.clone(), pong.node);
                }
            }
        }

        tracing::info!("Network detection found {} nodes", found.len());
        Ok(found.into_values().collect())
    }

    pub(crate) async fn handle_detect_ping(&self, detect: DetectPing, src: SocketAddr) -> Result<()> {
        let me = self.myself();
        let pong = GossipMessage::DetectPong(DetectPong {
            node: NodeMessage::from_node(&me, me.state),
            from_zone: me.zone.clone(),
        });
        self.send_messages(&self.socket, &src.to_string(), &detect.from_zone, &[pong])
            .await?;
        Ok(())
    }
}
