//! Zone Topology Module
//!
//! Zones are named realms (sites, datacenters, customers) arranged as a tree through their
//! declared `sub-zones`. Every cross-zone decision taken by the membership layer goes through
//! this module:
//!
//! - **Own zone**: every node is visible.
//! - **Sub zones**: every node is visible, sub zones push their state up to us.
//! - **Top zones**: only proxy nodes are visible.
//! - **Anything else**: invisible.
//!
//! The derived trees are cached and only recomputed after a zone is registered.

pub mod topology;

#[cfg(test)]
mod tests;

pub use topology::{MAX_ZONE_DEPTH, Zone, ZoneTopology};
