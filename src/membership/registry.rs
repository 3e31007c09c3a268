//! Node Registry
//!
//! The authoritative map of known nodes. All writes go through a single writer-side map
//! guarded by a mutex; after each write an immutable copy is published, so readers grab an
//! `Arc` snapshot and iterate it without holding any lock while writers proceed.

use super::error::Result;
use super::types::{Node, NodeId};

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub type NodeMap = HashMap<NodeId, Node>;

pub struct NodeRegistry {
    writer: Mutex<NodeMap>,
    published: RwLock<Arc<NodeMap>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::from_nodes(NodeMap::new())
    }

    pub fn from_nodes(nodes: NodeMap) -> Self {
        Self {
            published: RwLock::new(Arc::new(nodes.clone())),
            writer: Mutex::new(nodes),
        }
    }

    /// Immutable view of the registry, safe to iterate while writers run.
    pub fn snapshot(&self) -> Arc<NodeMap> {
        self.published.read().clone()
    }

    pub fn get(&self, uuid: &NodeId) -> Option<Node> {
        self.published.read().get(uuid).cloned()
    }

    pub fn contains(&self, uuid: &NodeId) -> bool {
        self.published.read().contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.published.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` against the writer map and publishes the result as the new snapshot.
    ///
    /// The closure must stay short: no I/O, no awaiting.
    pub fn write<R>(&self, f: impl FnOnce(&mut NodeMap) -> R) -> R {
        let mut nodes = self.writer.lock();
        let result = f(&mut nodes);
        *self.published.write() = Arc::new(nodes.clone());
        result
    }

    pub fn set(&self, node: Node) {
        self.write(|nodes| {
            nodes.insert(node.uuid.clone(), node);
        });
    }

    pub fn delete(&self, uuid: &NodeId) -> Option<Node> {
        self.write(|nodes| nodes.remove(uuid))
    }

    pub fn delete_many(&self, uuids: &[NodeId]) -> usize {
        if uuids.is_empty() {
            return 0;
        }
        self.write(|nodes| {
            uuids
                .iter()
                .filter(|uuid| nodes.remove(*uuid).is_some())
                .count()
        })
    }

    /// Writes the registry, minus `myself`, to `path` (write to a temp file, then rename).
    pub fn persist(&self, path: &Path, myself: &NodeId) -> Result<()> {
        let snapshot = self.snapshot();
        let nodes: HashMap<&NodeId, &Node> = snapshot
            .iter()
            .filter(|(uuid, _)| *uuid != myself)
            .collect();

        let json = serde_json::to_vec(&nodes)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;

        tracing::debug!("Saved {} nodes to {}", nodes.len(), path.display());
        Ok(())
    }

    /// Loads a retention file written by [`NodeRegistry::persist`].
    ///
    /// Our own stale entry is dropped: the local node is always rebuilt fresh at startup.
    /// A missing file is an empty registry.
    pub fn restore(path: &Path, myself: &NodeId) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No retention file at {}, starting empty", path.display());
            return Ok(Self::new());
        }

        let raw = std::fs::read(path)?;
        let mut nodes: NodeMap = serde_json::from_slice(&raw)?;
        nodes.remove(myself);

        tracing::info!("Restored {} nodes from {}", nodes.len(), path.display());
        Ok(Self::from_nodes(nodes))
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::types::NodeState;
    use tempfile::TempDir;

    fn node(id: &str) -> Node {
        Node::new(NodeId::from(id), id, "127.0.0.1", 6768)
    }

    #[test]
    fn test_set_get_delete() {
        let registry = NodeRegistry::new();
        registry.set(node("a"));
        registry.set(node("b"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(&NodeId::from("a")).unwrap().name, "a");

        assert!(registry.delete(&NodeId::from("a")).is_some());
        assert!(registry.get(&NodeId::from("a")).is_none());
        assert!(registry.delete(&NodeId::from("a")).is_none());
    }

    #[test]
    fn test_delete_many_counts_removed() {
        let registry = NodeRegistry::new();
        registry.set(node("a"));
        registry.set(node("b"));
        registry.set(node("c"));

        let removed = registry.delete_many(&[NodeId::from("a"), NodeId::from("z")]);

        assert_eq!(removed, 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let registry = NodeRegistry::new();
        registry.set(node("a"));

        let before = registry.snapshot();
        registry.write(|nodes| {
            if let Some(n) = nodes.get_mut(&NodeId::from("a")) {
                n.state = NodeState::Dead;
            }
            nodes.insert(NodeId::from("b"), node("b"));
        });

        assert_eq!(before.len(), 1);
        assert_eq!(before[&NodeId::from("a")].state, NodeState::Alive);
        assert_eq!(registry.snapshot()[&NodeId::from("a")].state, NodeState::Dead);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_persist_and_restore_skip_myself() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nodes.json");
        let me = NodeId::from("me");

        let registry = NodeRegistry::new();
        registry.set(node("me"));
        registry.set(node("peer"));
        registry.persist(&path, &me).unwrap();

        let restored = NodeRegistry::restore(&path, &me).unwrap();
        assert_eq!(restored.len(), 1);
        assert!(restored.contains(&NodeId::from("peer")));
        assert!(!restored.contains(&me));
    }

    #[test]
    fn test_restore_drops_stale_self_entry_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nodes.json");
        let me = NodeId::from("me");

        // Written by an older run that still had itself in the map.
        let registry = NodeRegistry::new();
        registry.set(node("me"));
        registry.persist(&path, &NodeId::from("someone-else")).unwrap();

        let restored = NodeRegistry::restore(&path, &me).unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn test_restore_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let restored =
            NodeRegistry::restore(&dir.path().join("absent.json"), &NodeId::from("me")).unwrap();
        assert!(restored.is_empty());
    }
}
