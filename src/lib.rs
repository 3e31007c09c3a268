//! Zonal Gossip Agent Library
//!
//! This library crate defines the modules of a self-organizing cluster membership agent.
//! It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! - **`config`**: Agent configuration (JSON file plus command-line overrides) and protocol
//!   timers.
//! - **`crypto`**: Per-zone datagram protection, used by the membership layer as a black box.
//! - **`membership`**: The SWIM-style membership engine: node state machine, UDP failure
//!   detection, gossip dissemination, HTTP push-pull anti-entropy and the agent HTTP API.
//! - **`zone`**: The zone hierarchy and the visibility rules every cross-zone decision uses.

pub mod config;
pub mod crypto;
pub mod membership;
pub mod zone;
