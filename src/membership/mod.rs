//! Membership & Failure Detection Module
//!
//! Implements a zone-aware, SWIM-style membership protocol. Every agent keeps a view of the
//! nodes it is allowed to see and converges it with its peers.
//!
//! ## Core Mechanisms
//! - **State machine** (`state`): alive/suspect/dead/leave transitions, arbitrated by per-node
//!   incarnation numbers. Claims about the local node are refuted, never accepted.
//! - **Failure detection** (`detector`): direct UDP ping, indirect ping through relays, then
//!   suspicion with a timeout that grows with the cluster size.
//! - **Dissemination** (`broadcast`, `gossip`): bounded fan-out epidemic broadcast of state
//!   changes and events, packed into size-limited datagrams.
//! - **Anti-entropy** (`sync`): periodic HTTP push-pull of full views, filtered by zone.
//! - **Zones**: a node sees its own zone, its sub-zones, and only the proxies of the zones
//!   above it (see [`crate::zone`]).

pub mod broadcast;
pub mod bus;
pub mod detector;
pub mod error;
pub mod events;
pub mod gossip;
pub mod handlers;
pub mod history;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod state;
pub mod sync;
pub mod types;


pub use error::{MembershipError, Result};
pub use service::MembershipService;
pub use types::{Node, NodeId, NodeState};
