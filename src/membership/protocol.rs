//! Membership HTTP Protocol
//!
//! Endpoints and Data Transfer Objects of the agent's HTTP surface. The TCP listener shares
//! the UDP gossip port, so `Node::addr()` is the HTTP authority of a node as well.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::types::{Event, Node, NodeId};

// --- API Endpoints ---

/// Anti-entropy exchange. Public: any peer may push-pull, zone rules decide what it gets.
pub const ENDPOINT_PUSH_PULL: &str = "/agent/push-pull";
/// Forces a node into `leave` (protected).
pub const ENDPOINT_LEAVE: &str = "/agent/leave/:uuid";
pub const ENDPOINT_MEMBERS: &str = "/agent/members";
pub const ENDPOINT_MEMBERS_HISTORY: &str = "/agent/members/history";
/// Push-pull with the given `host:port` now.
pub const ENDPOINT_JOIN: &str = "/agent/join/:hostport";
/// UDP broadcast discovery, `?timeout=N` seconds.
pub const ENDPOINT_DETECT: &str = "/agent/detect";
/// `PUT` adds, `DELETE` removes a local group (protected).
pub const ENDPOINT_GROUPS: &str = "/agent/parameters/groups/:name";
pub const ENDPOINT_ZONES: &str = "/agent/zones";
/// Moves the local node to another zone (protected).
pub const ENDPOINT_ZONE: &str = "/agent/zone";
pub const ENDPOINT_GUESS: &str = "/agent/query/guess/:name_or_uuid";
pub const ENDPOINT_NAME: &str = "/agent/name";
pub const ENDPOINT_UUID: &str = "/agent/uuid";
/// `POST` stacks a new event (protected).
pub const ENDPOINT_EVENT: &str = "/agent/event";
/// Latest known event of a type (protected).
pub const ENDPOINT_EVENT_BY_TYPE: &str = "/agent/event/:event_type";

pub const PUSH_PULL_TYPE: &str = "push-pull-msg";

// --- Data Transfer Objects ---

/// Both sides of a push-pull: our node view and our unexpired events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushPullEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    /// Zone of the sender, deciding what the receiver may answer.
    #[serde(rename = "ask-from-zone", default)]
    pub ask_from_zone: String,
    #[serde(default)]
    pub nodes: HashMap<NodeId, Node>,
    #[serde(default)]
    pub events: HashMap<String, Event>,
}

impl PushPullEnvelope {
    pub fn new(
        ask_from_zone: &str,
        nodes: HashMap<NodeId, Node>,
        events: HashMap<String, Event>,
    ) -> Self {
        Self {
            kind: PUSH_PULL_TYPE.to_string(),
            ask_from_zone: ask_from_zone.to_string(),
            nodes,
            events,
        }
    }
}

/// Query string of the push-pull endpoint: the JSON-encoded envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct PushPullQuery {
    pub msg: String,
}

/// What a push-pull call may answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PushPullReply {
    Refused(ErrorResponse),
    Accepted(PushPullEnvelope),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinResponse {
    pub success: bool,
    /// Nodes received from the peer.
    #[serde(default)]
    pub nodes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DetectQuery {
    pub timeout: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ZoneChangeRequest {
    pub zone: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventRequest {
    pub event_type: String,
}
