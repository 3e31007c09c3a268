use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::info;

use super::broadcast::{BroadcastQueue, pack_datagrams};
use super::bus::NodeEventBus;
use super::error::{MembershipError, Result};
use super::events::EventStore;
use super::history::HistoryLog;
use super::registry::NodeRegistry;
use super::types::{GossipMessage, Node, NodeId, NodeState, decode_datagram};
use crate::config::{AgentConfig, GossipTiming};
use crate::crypto::Encrypter;
use crate::zone::ZoneTopology;

const RETENTION_FILE: &str = "nodes.json";
const INCARNATION_FILE: &str = "incarnation";
const HISTORY_DIR: &str = "history";
const HISTORY_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const MAX_DATAGRAM: usize = 65536;

/// The membership engine.
///
/// Owns every piece of membership state; the periodic loops and the HTTP handlers all work
/// through an `Arc<MembershipService>`. Lifecycle is `new` → `start` → `stop`.
pub struct MembershipService {
    pub(crate) config: AgentConfig,
    pub(crate) uuid: NodeId,
    /// The local node as built at startup. The live version is the registry entry.
    identity: Node,
    pub(crate) topology: Arc<ZoneTopology>,
    pub(crate) registry: NodeRegistry,
    pub(crate) broadcasts: BroadcastQueue,
    pub(crate) events: EventStore,
    pub(crate) history: HistoryLog,
    pub(crate) bus: NodeEventBus,
    pub(crate) encrypter: Arc<dyn Encrypter>,
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) http_client: reqwest::Client,
    /// Nodes that pinged us while we thought they were not alive.
    pub(crate) ping_back: Mutex<Vec<NodeId>>,
    /// Groups last reported by the group detectors.
    pub(crate) detected_groups: Mutex<BTreeSet<String>>,
    pub(crate) seqno: AtomicU64,
    stopping: AtomicBool,
    shutdown: Notify,
    pub(crate) leave_requested: Notify,
}

impl MembershipService {
    pub async fn new(
        config: AgentConfig,
        topology: Arc<ZoneTopology>,
        encrypter: Arc<dyn Encrypter>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let port = socket.local_addr()?.port();

        let uuid = config.resolve_uuid()?;
        let registry = match &config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let path = dir.join(RETENTION_FILE);
                NodeRegistry::restore(&path, &uuid).unwrap_or_else(|e| {
                    tracing::warn!("Ignoring unreadable retention file {}: {}", path.display(), e);
                    NodeRegistry::new()
                })
            }
            None => NodeRegistry::new(),
        };
        let incarnation = config
            .data_dir
            .as_ref()
            .and_then(|dir| std::fs::read_to_string(dir.join(INCARNATION_FILE)).ok())
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(|saved| saved + 1)
            .unwrap_or(0);

        let history = HistoryLog::new(
            config.data_dir.as_ref().map(|dir| dir.join(HISTORY_DIR)),
            config.timing.history_max_bytes,
        )?;

        let advertised = config.advertised_addr();
        let mut identity = Node::new(uuid.clone(), &config.name, &advertised, port);
        identity.display_name = config.display_name.clone();
        if !config.bind_addr.ip().is_unspecified() {
            identity.local_addr = config.bind_addr.ip().to_string();
        }
        identity.incarnation = incarnation;
        identity.zone = config.zone.clone();
        identity.is_proxy = config.is_proxy;
        identity.groups = config.groups.iter().cloned().collect();

        let service = Arc::new(Self {
            uuid,
            identity: identity.clone(),
            topology,
            registry,
            broadcasts: BroadcastQueue::new(config.timing.fanout),
            events: EventStore::new(config.timing.event_ttl_secs),
            history,
            bus: NodeEventBus::new(),
            encrypter,
            socket: Arc::new(socket),
            http_client: reqwest::Client::new(),
            ping_back: Mutex::new(Vec::new()),
            detected_groups: Mutex::new(BTreeSet::new()),
            seqno: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
            shutdown: Notify::new(),
            leave_requested: Notify::new(),
            config,
        });

        service.set_alive(identity, true, false);
        let dropped = service.clean_nodes_from_zone();
        if dropped > 0 {
            info!("Dropped {} restored nodes outside our zone view", dropped);
        }

        info!(
            "Membership ready: {} ({}) zone={} proxy={} incarnation={}",
            service.identity.name,
            service.uuid,
            service.identity.zone,
            service.identity.is_proxy,
            incarnation
        );
        Ok(service)
    }

    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting membership service...");

        let _receive_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            })
        };

        let _detector_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.detector_loop().await;
            })
        };

        let _reaper_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.reaper_loop().await;
            })
        };

        let _gossip_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.gossip_loop().await;
            })
        };

        let _sync_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.sync_loop().await;
            })
        };

        let _history_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.history_loop().await;
            })
        };

        if self.config.data_dir.is_some() {
            let service = self.clone();
            tokio::spawn(async move {
                service.retention_loop().await;
            });
        }

        let _leave_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.shutdown_after_leave().await;
            })
        };

        let _join_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.join().await;
            })
        };

        tracing::info!("All background tasks started");
    }

    /// Cooperative shutdown: loops exit at their next iteration boundary.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping membership service");
        self.shutdown.notify_waiters();

        if let Err(e) = self.history.flush() {
            tracing::error!("Failed to flush history: {}", e);
        }
        if let Err(e) = self.checkpoint() {
            tracing::error!("Failed to save retention: {}", e);
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Resolves once [`MembershipService::stop`] has been called.
    pub async fn wait_stopped(&self) {
        loop {
            let notified = self.shutdown.notified();
            if self.is_stopping() {
                return;
            }
            notified.await;
        }
    }

    /// Sleeps `period`, returning `false` if the service was stopped meanwhile.
    pub(crate) async fn pause(&self, period: Duration) -> bool {
        let notified = self.shutdown.notified();
        if self.is_stopping() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(period) => !self.is_stopping(),
            _ = notified => false,
        }
    }

    pub fn uuid(&self) -> &NodeId {
        &self.uuid
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn timing(&self) -> &GossipTiming {
        &self.config.timing
    }

    pub fn topology(&self) -> &ZoneTopology {
        &self.topology
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn broadcasts(&self) -> &BroadcastQueue {
        &self.broadcasts
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn bus(&self) -> &NodeEventBus {
        &self.bus
    }

    pub fn api_token(&self) -> Option<&str> {
        self.config.api_token.as_deref()
    }

    /// The live local node.
    pub fn myself(&self) -> Node {
        // the local entry is never removed from the registry
        self.registry
            .get(&self.uuid)
            .unwrap_or_else(|| self.identity.clone())
    }

    pub fn local_zone(&self) -> String {
        self.myself().zone
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.registry
            .snapshot()
            .values()
            .filter(|node| node.state == NodeState::Alive)
            .cloned()
            .collect()
    }

    /// Encrypts for `dest_zone` and sends every message to `addr`, packed under the budget.
    pub(crate) async fn send_messages(
        &self,
        socket: &UdpSocket,
        addr: &str,
        dest_zone: &str,
        messages: &[GossipMessage],
    ) -> Result<usize> {
        let datagrams = pack_datagrams(messages, self.config.timing.packet_budget)?;
        for datagram in &datagrams {
            let packet = self.encrypter.encrypt(datagram, dest_zone);
            socket
                .send_to(&packet, addr)
                .await
                .map_err(|e| MembershipError::network(addr, e))?;
        }
        Ok(datagrams.len())
    }

    /// Decrypts and decodes one received packet. `None` if it must be dropped.
    pub(crate) fn open_packet(&self, packet: &[u8], src: SocketAddr) -> Option<Vec<GossipMessage>> {
        let Some(payload) = self.encrypter.decrypt(packet) else {
            tracing::debug!("Dropping undecryptable datagram from {}", src);
            return None;
        };
        match decode_datagram(&payload) {
            Ok(messages) => Some(messages),
            Err(e) => {
                tracing::debug!("Dropping malformed datagram from {}: {}", src, e);
                None
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let notified = self.shutdown.notified();
            if self.is_stopping() {
                break;
            }

            let received = tokio::select! {
                received = self.socket.recv_from(&mut buf) => received,
                _ = notified => break,
            };

            match received {
                Ok((len, src)) => {
                    let Some(messages) = self.open_packet(&buf[..len], src) else {
                        continue;
                    };
                    for message in messages {
                        self.handle_message(message, src).await;
                    }
                }
                Err(e) => {
                    tracing::debug!("UDP receive failed: {}", e);
                }
            }
        }

        tracing::debug!("Receive loop stopped");
    }

    /// Routes one decoded message to its handler or state-machine entry point.
    pub(crate) async fn handle_message(self: &Arc<Self>, message: GossipMessage, src: SocketAddr) {
        match message {
            GossipMessage::Ping(ping) => {
                if let Err(e) = self.handle_ping(ping, src).await {
                    tracing::debug!("Cannot answer ping from {}: {}", src, e);
                }
            }
            GossipMessage::PingRelay(relay) => {
                let service = self.clone();
                tokio::spawn(async move {
                    service.handle_ping_relay(relay, src).await;
                });
            }
            GossipMessage::DetectPing(detect) => {
                if let Err(e) = self.handle_detect_ping(detect, src).await {
                    tracing::debug!("Cannot answer detect-ping from {}: {}", src, e);
                }
            }
            GossipMessage::Ack(_) | GossipMessage::DetectPong(_) => {
                tracing::debug!("Stray {} reply from {}", message_kind(&message), src);
            }
            GossipMessage::Alive(node) => {
                self.set_alive(node.into_node(), false, false);
            }
            // a remote death claim is never trusted as is, it only raises suspicion
            GossipMessage::Suspect(node) | GossipMessage::Dead(node) => {
                self.set_suspect(node.into_node());
            }
            GossipMessage::Leave(node) => {
                self.set_leave(node.into_node(), false);
            }
            GossipMessage::Event(event) => {
                self.merge_event(event);
            }
        }
    }

    async fn history_loop(self: Arc<Self>) {
        while self.pause(HISTORY_FLUSH_INTERVAL).await {
            if let Err(e) = self.history.flush() {
                tracing::error!("Failed to write history: {}", e);
            }
        }
    }

    async fn retention_loop(self: Arc<Self>) {
        while self.pause(self.config.timing.retention_interval()).await {
            if let Err(e) = self.checkpoint() {
                tracing::error!("Failed to save retention: {}", e);
            }
        }
    }

    /// Writes the node map and our incarnation into the data directory, if any.
    pub fn checkpoint(&self) -> Result<()> {
        let Some(dir) = &self.config.data_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        self.registry.persist(&dir.join(RETENTION_FILE), &self.uuid)?;
        std::fs::write(
            dir.join(INCARNATION_FILE),
            self.myself().incarnation.to_string(),
        )?;
        Ok(())
    }

    async fn shutdown_after_leave(self: Arc<Self>) {
        let notified = self.shutdown.notified();
        tokio::select! {
            _ = self.leave_requested.notified() => {}
            _ = notified => return,
        }

        let grace = self.config.timing.leave_grace();
        info!("Leaving the cluster, stopping in {:?}", grace);
        tokio::time::sleep(grace).await;
        self.stop();
    }
}

fn message_kind(message: &GossipMessage) -> &'static str {
    match message {
        GossipMessage::Ping(_) => "ping",
        GossipMessage::Ack(_) => "ack",
        GossipMessage::PingRelay(_) => "ping-relay",
        GossipMessage::DetectPing(_) => "detect-ping",
        GossipMessage::DetectPong(_) => "detect-pong",
        GossipMessage::Alive(_) => "alive",
        GossipMessage::Suspect(_) => "suspect",
        GossipMessage::Dead(_) => "dead",
        GossipMessage::Leave(_) => "leave",
        GossipMessage::Event(_) => "event",
    }
}
