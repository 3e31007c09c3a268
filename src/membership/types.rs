use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Stable node identity. Survives address and name changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    #[default]
    Unknown,
    Alive,
    Suspect,
    Dead,
    Leave,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Unknown => "unknown",
            NodeState::Alive => "alive",
            NodeState::Suspect => "suspect",
            NodeState::Dead => "dead",
            NodeState::Leave => "leave",
        };
        f.write_str(s)
    }
}

/// A single member of the cluster, as stored in the registry.
///
/// `incarnation` is the per-node logical clock: only its owner increases it, and a claim
/// about a node is only believed when it carries a newer incarnation (or was verified by us).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub uuid: NodeId,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub public_addr: String,
    #[serde(default)]
    pub local_addr: String,
    pub port: u16,
    pub incarnation: u64,
    pub state: NodeState,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    #[serde(default)]
    pub services: BTreeMap<String, Value>,
    #[serde(default)]
    pub checks: BTreeMap<String, Value>,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub is_proxy: bool,

    /// Epoch seconds of the transition to `suspect` (or `dead`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspect_time: Option<u64>,
    /// Epoch seconds of the transition to `leave`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leave_time: Option<u64>,
}

impl Node {
    pub fn new(uuid: NodeId, name: &str, addr: &str, port: u16) -> Self {
        Self {
            uuid,
            name: name.to_string(),
            display_name: String::new(),
            public_addr: addr.to_string(),
            local_addr: addr.to_string(),
            port,
            incarnation: 0,
            state: NodeState::Alive,
            groups: BTreeSet::new(),
            services: BTreeMap::new(),
            checks: BTreeMap::new(),
            zone: String::new(),
            is_proxy: false,
            suspect_time: None,
            leave_time: None,
        }
    }

    /// `host:port` used to reach the node, over UDP and HTTP alike.
    pub fn addr(&self) -> String {
        let host = if self.public_addr.is_empty() {
            &self.local_addr
        } else {
            &self.public_addr
        };
        format!("{}:{}", host, self.port)
    }
}

/// Node state as it travels inside `alive`/`suspect`/`dead`/`leave`/`ack` messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeMessage {
    pub uuid: NodeId,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub public_addr: String,
    #[serde(default)]
    pub local_addr: String,
    pub port: u16,
    pub incarnation: u64,
    #[serde(default)]
    pub state: NodeState,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    #[serde(default)]
    pub services: BTreeMap<String, Value>,
    #[serde(default)]
    pub checks: BTreeMap<String, Value>,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub is_proxy: bool,
}

impl NodeMessage {
    pub fn from_node(node: &Node, state: NodeState) -> Self {
        Self {
            uuid: node.uuid.clone(),
            name: node.name.clone(),
            display_name: node.display_name.clone(),
            public_addr: node.public_addr.clone(),
            local_addr: node.local_addr.clone(),
            port: node.port,
            incarnation: node.incarnation,
            state,
            groups: node.groups.clone(),
            services: node.services.clone(),
            checks: node.checks.clone(),
            zone: node.zone.clone(),
            is_proxy: node.is_proxy,
        }
    }

    pub fn into_node(self) -> Node {
        Node {
            uuid: self.uuid,
            name: self.name,
            display_name: self.display_name,
            public_addr: self.public_addr,
            local_addr: self.local_addr,
            port: self.port,
            incarnation: self.incarnation,
            state: self.state,
            groups: self.groups,
            services: self.services,
            checks: self.checks,
            zone: self.zone,
            is_proxy: self.is_proxy,
            suspect_time: None,
            leave_time: None,
        }
    }
}

/// A generic short-lived broadcast payload. Kept for a fixed TTL, then forgotten.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub eventid: String,
    pub from: NodeId,
    pub payload: Value,
    /// Creation time, epoch seconds.
    pub ctime: u64,
}

impl Event {
    /// The `type` field of the payload, if any.
    pub fn event_type(&self) -> Option<&str> {
        self.payload.get("type").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ping {
    /// The uuid the sender expects to reach.
    pub node: NodeId,
    pub from: NodeId,
    #[serde(default)]
    pub from_zone: String,
    #[serde(default)]
    pub seqno: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ack {
    pub node: NodeMessage,
    #[serde(default)]
    pub seqno: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PingRelay {
    pub tgt: NodeId,
    pub from: NodeId,
    #[serde(default)]
    pub from_zone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectPing {
    #[serde(default)]
    pub from_zone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectPong {
    pub node: NodeMessage,
    #[serde(default)]
    pub from_zone: String,
}

/// The UDP wire protocol. JSON, tagged by `type`.
///
/// - `ping`/`ack`: direct liveness probe.
/// - `ping-relay`: ask a peer to probe a target on our behalf (indirect probe).
/// - `detect-ping`/`detect-pong`: LAN broadcast discovery.
/// - `alive`/`suspect`/`dead`/`leave`: disseminated node state.
/// - `event`: generic disseminated payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GossipMessage {
    Ping(Ping),
    Ack(Ack),
    PingRelay(PingRelay),
    DetectPing(DetectPing),
    DetectPong(DetectPong),
    Alive(NodeMessage),
    Suspect(NodeMessage),
    Dead(NodeMessage),
    Leave(NodeMessage),
    Event(Event),
}

impl GossipMessage {
    pub fn alive(node: &Node) -> Self {
        GossipMessage::Alive(NodeMessage::from_node(node, NodeState::Alive))
    }

    pub fn suspect(node: &Node) -> Self {
        GossipMessage::Suspect(NodeMessage::from_node(node, NodeState::Suspect))
    }

    pub fn dead(node: &Node) -> Self {
        GossipMessage::Dead(NodeMessage::from_node(node, NodeState::Dead))
    }

    pub fn leave(node: &Node) -> Self {
        GossipMessage::Leave(NodeMessage::from_node(node, NodeState::Leave))
    }

    /// Node state messages are disseminated ahead of everything else.
    pub fn is_node_state(&self) -> bool {
        matches!(
            self,
            GossipMessage::Alive(_)
                | GossipMessage::Suspect(_)
                | GossipMessage::Dead(_)
                | GossipMessage::Leave(_)
        )
    }
}

/// Decodes a datagram payload: either one message or a packed batch of them.
///
/// Inside a batch, entries that do not parse are skipped so one bad entry does not cost the
/// rest of the datagram.
pub fn decode_datagram(payload: &[u8]) -> Result<Vec<GossipMessage>, serde_json::Error> {
    match serde_json::from_slice::<Value>(payload)? {
        Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| match serde_json::from_value(item) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::debug!("Skipping malformed batch entry: {}", e);
                    None
                }
            })
            .collect()),
        single => Ok(vec![serde_json::from_value(single)?]),
    }
}

/// Current time in epoch seconds.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
