//! Membership State Machine
//!
//! The single path through which node state changes: gossip, the failure detector, push-pull
//! merges and the HTTP surface all end up here. Entry points return whether the claim changed
//! local state; a rejected claim (stale incarnation, zone admission) is a normal outcome.
//!
//! ```text
//! unknown -> alive <-> suspect -> dead
//!     any -> leave (purged later)
//! ```

use std::collections::{BTreeSet, HashMap};

use super::bus::NodeEvent;
use super::history::HistoryEntry;
use super::service::MembershipService;
use super::types::{Event, GossipMessage, Node, NodeId, NodeState, now_secs};

/// Outcome of a registry write, applied to the side channels once the lock is released.
enum Applied {
    New(Node),
    Changed {
        node: Node,
        old_state: NodeState,
        old_zone: String,
    },
}

impl MembershipService {
    /// Accepts an `alive` claim.
    ///
    /// `bootstrap` is only used for our own entry at startup. `strong` means we verified the
    /// node ourselves (it answered a ping), which overrides the incarnation check as long as
    /// the state actually changes.
    pub fn set_alive(&self, node: Node, bootstrap: bool, strong: bool) -> bool {
        if node.uuid == self.uuid {
            return self.accept_self_alive(node, bootstrap);
        }

        let admissible = self.is_admissible(&node);
        let applied = self.registry.write(|nodes| match nodes.get_mut(&node.uuid) {
            None => {
                if !admissible {
                    return None;
                }
                let mut fresh = node;
                fresh.state = NodeState::Alive;
                fresh.suspect_time = None;
                fresh.leave_time = None;
                nodes.insert(fresh.uuid.clone(), fresh.clone());
                Some(Applied::New(fresh))
            }
            Some(prev) => {
                let newer = node.incarnation > prev.incarnation;
                let verified = strong && prev.state != NodeState::Alive;
                if !newer && !verified {
                    return None;
                }

                let old_state = prev.state;
                let old_zone = prev.zone.clone();
                let incarnation = prev.incarnation.max(node.incarnation);
                *prev = Node {
                    incarnation,
                    state: NodeState::Alive,
                    suspect_time: None,
                    leave_time: None,
                    ..node
                };
                Some(Applied::Changed {
                    node: prev.clone(),
                    old_state,
                    old_zone,
                })
            }
        });

        match applied {
            None => false,
            Some(Applied::New(node)) => {
                tracing::info!("New node detected: {} ({}) zone={}", node.name, node.uuid, node.zone);
                self.record_state_change(&node, NodeState::Unknown);
                self.bus.publish(NodeEvent::NewNode(node.uuid.clone()));
                self.broadcasts.push(GossipMessage::alive(&node));
                true
            }
            Some(Applied::Changed {
                node,
                old_state,
                old_zone,
            }) => {
                if old_state != NodeState::Alive {
                    tracing::info!("Node {} is back alive (was {})", node.name, old_state);
                    self.record_state_change(&node, old_state);
                }
                if old_zone != node.zone {
                    self.record_zone_change(&node, &old_zone);
                }
                self.bus.publish(NodeEvent::ChangeNode(node.uuid.clone()));
                self.broadcasts.push(GossipMessage::alive(&node));
                true
            }
        }
    }

    fn accept_self_alive(&self, node: Node, bootstrap: bool) -> bool {
        if bootstrap {
            self.registry.set(node.clone());
            self.broadcasts.push(GossipMessage::alive(&node));
            return true;
        }

        let local = self.myself();
        if local.state == NodeState::Leave {
            return false;
        }
        if node.incarnation > local.incarnation {
            tracing::warn!(
                "Someone claims we are alive at incarnation {} (we are at {}), refuting",
                node.incarnation,
                local.incarnation
            );
            self.increase_incarnation_and_broadcast(node.incarnation);
        }
        false
    }

    /// Accepts a `suspect` claim, or a remote `dead` claim which only raises suspicion.
    pub fn set_suspect(&self, node: Node) -> bool {
        self.degrade(node, NodeState::Suspect)
    }

    /// Declares a node dead. Only trusted local callers use this; the regular way to `dead`
    /// is the suspicion timeout.
    pub fn set_dead(&self, node: Node) -> bool {
        self.degrade(node, NodeState::Dead)
    }

    /// `alive` → `suspect` or `alive` → `dead`. Claims about ourselves are refuted.
    fn degrade(&self, node: Node, state: NodeState) -> bool {
        if node.uuid == self.uuid {
            let local = self.myself();
            if node.incarnation < local.incarnation || local.state == NodeState::Leave {
                return false;
            }
            tracing::warn!(
                "Someone claims we are {} at incarnation {}, refuting",
                state,
                node.incarnation
            );
            self.increase_incarnation_and_broadcast(node.incarnation);
            return false;
        }

        let now = now_secs();
        let changed = self.registry.write(|nodes| {
            let prev = nodes.get_mut(&node.uuid)?;
            if node.incarnation < prev.incarnation || prev.state != NodeState::Alive {
                return None;
            }
            prev.state = state;
            prev.incarnation = node.incarnation;
            prev.suspect_time = Some(now);
            Some(prev.clone())
        });

        let Some(changed) = changed else {
            return false;
        };

        tracing::info!("Node {} ({}) is now {}", changed.name, changed.uuid, state);
        self.record_state_change(&changed, NodeState::Alive);
        self.bus.publish(NodeEvent::ChangeNode(changed.uuid.clone()));
        let message = match state {
            NodeState::Dead => GossipMessage::dead(&changed),
            _ => GossipMessage::suspect(&changed),
        };
        self.broadcasts.push(message);
        true
    }

    /// Accepts a `leave` claim.
    ///
    /// For ourselves, only a forced leave (local admin action) is accepted: we switch to
    /// `leave`, broadcast it and stop after the grace delay. Anything else about us is
    /// refuted. For other nodes, `force` skips the incarnation check.
    pub fn set_leave(&self, node: Node, force: bool) -> bool {
        if node.uuid == self.uuid {
            return self.accept_self_leave(node, force);
        }

        let now = now_secs();
        let changed = self.registry.write(|nodes| {
            let prev = nodes.get_mut(&node.uuid)?;
            if prev.state == NodeState::Leave || (!force && node.incarnation < prev.incarnation) {
                return None;
            }
            let old_state = prev.state;
            prev.state = NodeState::Leave;
            prev.incarnation = prev.incarnation.max(node.incarnation);
            prev.leave_time = Some(now);
            Some((prev.clone(), old_state))
        });

        let Some((changed, old_state)) = changed else {
            return false;
        };

        tracing::info!("Node {} ({}) is leaving the cluster", changed.name, changed.uuid);
        self.record_state_change(&changed, old_state);
        self.bus.publish(NodeEvent::ChangeNode(changed.uuid.clone()));
        self.broadcasts.push(GossipMessage::leave(&changed));
        true
    }

    fn accept_self_leave(&self, node: Node, force: bool) -> bool {
        let local = self.myself();
        if local.state == NodeState::Leave {
            return false;
        }

        if !force {
            tracing::warn!(
                "Someone claims we are leaving at incarnation {}, refuting",
                node.incarnation
            );
            self.increase_incarnation_and_broadcast(node.incarnation);
            return false;
        }

        let now = now_secs();
        let Some(me) = self.registry.write(|nodes| {
            let me = nodes.get_mut(&self.uuid)?;
            me.state = NodeState::Leave;
            me.leave_time = Some(now);
            Some(me.clone())
        }) else {
            return false;
        };

        tracing::info!("Local node is leaving the cluster");
        self.record_state_change(&me, local.state);
        self.bus.publish(NodeEvent::ChangeNode(me.uuid.clone()));
        self.broadcasts.push(GossipMessage::leave(&me));
        self.leave_requested.notify_one();
        true
    }

    /// Bumps our incarnation past `seen` (and past our current one) and broadcasts `alive`.
    pub fn increase_incarnation_and_broadcast(&self, seen: u64) -> u64 {
        self.update_myself(|me| {
            me.incarnation = me.incarnation.max(seen) + 1;
        })
        .map(|me| me.incarnation)
        .unwrap_or_default()
    }

    /// Applies `f` to our own entry, bumps the incarnation and broadcasts the result.
    fn update_myself(&self, f: impl FnOnce(&mut Node)) -> Option<Node> {
        let me = self.registry.write(|nodes| {
            let me = nodes.get_mut(&self.uuid)?;
            let before = me.incarnation;
            f(me);
            if me.incarnation == before {
                me.incarnation += 1;
            }
            Some(me.clone())
        })?;

        self.bus.publish(NodeEvent::ChangeNode(me.uuid.clone()));
        self.broadcasts.push(GossipMessage::alive(&me));
        Some(me)
    }

    /// Merges a node map received by push-pull, claim by claim, through the entry points.
    pub fn merge_nodes(&self, nodes: HashMap<NodeId, Node>) -> usize {
        let mut changed = 0;
        for (uuid, mut node) in nodes {
            node.uuid = uuid;
            let applied = match node.state {
                NodeState::Alive => self.set_alive(node, false, false),
                NodeState::Suspect | NodeState::Dead => self.set_suspect(node),
                NodeState::Leave => self.set_leave(node, false),
                NodeState::Unknown => false,
            };
            changed += usize::from(applied);
        }
        changed
    }

    /// A node we see for the first time is admitted unless it lives in one of our top zones
    /// without being a proxy.
    pub fn is_admissible(&self, node: &Node) -> bool {
        let local_zone = self.local_zone();
        if node.zone.is_empty() || node.zone == local_zone {
            return true;
        }
        if self.topology.is_top_zone(&local_zone, &node.zone) {
            return node.is_proxy;
        }
        true
    }

    pub fn add_group(&self, group: &str) -> bool {
        if group.is_empty() || self.myself().groups.contains(group) {
            return false;
        }
        let Some(me) = self.update_myself(|me| {
            me.groups.insert(group.to_string());
        }) else {
            return false;
        };
        tracing::info!("Group {} added to the local node", group);
        self.history.add(HistoryEntry::GroupAdd {
            name: me.name.clone(),
            display_name: me.display_name.clone(),
            uuid: me.uuid.clone(),
            group: group.to_string(),
        });
        true
    }

    pub fn remove_group(&self, group: &str) -> bool {
        if !self.myself().groups.contains(group) {
            return false;
        }
        let Some(me) = self.update_myself(|me| {
            me.groups.remove(group);
        }) else {
            return false;
        };
        tracing::info!("Group {} removed from the local node", group);
        self.history.add(HistoryEntry::GroupRemove {
            name: me.name.clone(),
            display_name: me.display_name.clone(),
            uuid: me.uuid.clone(),
            group: group.to_string(),
        });
        true
    }

    /// Replaces the set of automatically detected groups.
    ///
    /// Groups that appeared are added, groups that are no longer detected are removed, all
    /// under a single incarnation bump. Manually added groups are left alone.
    pub fn update_detected_groups(&self, detected: BTreeSet<String>) -> bool {
        let previous = std::mem::replace(&mut *self.detected_groups.lock(), detected.clone());
        let current = self.myself().groups;

        let added: Vec<String> = detected.difference(&current).cloned().collect();
        let removed: Vec<String> = previous
            .difference(&detected)
            .filter(|g| current.contains(*g))
            .cloned()
            .collect();
        if added.is_empty() && removed.is_empty() {
            return false;
        }

        let Some(me) = self.update_myself(|me| {
            me.groups.extend(added.iter().cloned());
            for group in &removed {
                me.groups.remove(group);
            }
        }) else {
            return false;
        };

        for group in added {
            self.history.add(HistoryEntry::GroupAdd {
                name: me.name.clone(),
                display_name: me.display_name.clone(),
                uuid: me.uuid.clone(),
                group,
            });
        }
        for group in removed {
            self.history.add(HistoryEntry::GroupRemove {
                name: me.name.clone(),
                display_name: me.display_name.clone(),
                uuid: me.uuid.clone(),
                group,
            });
        }
        true
    }

    /// Moves the local node to another zone and forgets nodes that are no longer visible.
    pub fn change_zone(&self, zone: &str) -> bool {
        let old_zone = self.local_zone();
        if zone.is_empty() || zone == old_zone {
            return false;
        }
        let Some(me) = self.update_myself(|me| {
            me.zone = zone.to_string();
        }) else {
            return false;
        };

        tracing::info!("Local node moved from zone {} to {}", old_zone, zone);
        self.record_zone_change(&me, &old_zone);
        self.clean_nodes_from_zone();
        true
    }

    /// Drops every node our zone should not see: we keep our own zone, all of our sub zones
    /// and the proxy nodes of our top zones.
    pub fn clean_nodes_from_zone(&self) -> usize {
        let local_zone = self.local_zone();
        let sub_zones = self.topology.get_sub_zones(&local_zone);
        let top_zones = self.topology.get_top_zones(&local_zone);

        let removed = self.registry.write(|nodes| {
            let doomed: Vec<NodeId> = nodes
                .values()
                .filter(|node| node.uuid != self.uuid)
                .filter(|node| {
                    let visible = node.zone.is_empty()
                        || node.zone == local_zone
                        || sub_zones.contains(&node.zone)
                        || (top_zones.contains(&node.zone) && node.is_proxy);
                    !visible
                })
                .map(|node| node.uuid.clone())
                .collect();
            for uuid in &doomed {
                nodes.remove(uuid);
            }
            doomed
        });

        for uuid in &removed {
            tracing::info!("Forgetting node {} outside zone {}", uuid, local_zone);
            self.bus.publish(NodeEvent::DeleteNode(uuid.clone()));
        }
        removed.len()
    }

    /// Stores a new event created locally and queues it for dissemination.
    pub fn stack_event(&self, payload: serde_json::Value) -> Event {
        let event = Event {
            eventid: NodeId::new().0,
            from: self.uuid.clone(),
            payload,
            ctime: now_secs(),
        };
        self.events.add(event.clone());
        self.broadcasts.push(GossipMessage::Event(event.clone()));
        event
    }

    /// Stores an event received from a peer; unknown ones are passed on.
    pub fn merge_event(&self, event: Event) -> bool {
        if event.payload.is_null() || !self.events.add(event.clone()) {
            return false;
        }
        tracing::debug!("New event {} from {}", event.eventid, event.from);
        self.broadcasts.push(GossipMessage::Event(event));
        true
    }

    pub fn merge_events(&self, events: HashMap<String, Event>) -> usize {
        let fresh = self.events.merge(events);
        let count = fresh.len();
        for event in fresh {
            self.broadcasts.push(GossipMessage::Event(event));
        }
        count
    }

    /// Number of nodes, optionally restricted to a state and/or a group.
    pub fn count(&self, state: Option<NodeState>, group: Option<&str>) -> usize {
        self.registry
            .snapshot()
            .values()
            .filter(|node| state.is_none_or(|s| node.state == s))
            .filter(|node| group.is_none_or(|g| node.groups.contains(g)))
            .count()
    }

    /// Nodes carrying `group` that are neither dead nor leaving.
    pub fn find_group_nodes(&self, group: &str) -> Vec<NodeId> {
        let mut found: Vec<NodeId> = self
            .registry
            .snapshot()
            .values()
            .filter(|node| !matches!(node.state, NodeState::Dead | NodeState::Leave))
            .filter(|node| node.groups.contains(group))
            .map(|node| node.uuid.clone())
            .collect();
        found.sort();
        found
    }

    /// Looks a node up by uuid, then by name, then by display name.
    pub fn guess(&self, name_or_uuid: &str) -> Option<Node> {
        let nodes = self.registry.snapshot();
        if let Some(node) = nodes.get(&NodeId::from(name_or_uuid)) {
            return Some(node.clone());
        }
        nodes
            .values()
            .find(|node| node.name == name_or_uuid)
            .or_else(|| {
                nodes
                    .values()
                    .find(|node| !node.display_name.is_empty() && node.display_name == name_or_uuid)
            })
            .cloned()
    }

    fn record_state_change(&self, node: &Node, old_state: NodeState) {
        self.history.add(HistoryEntry::NodeStateChange {
            name: node.name.clone(),
            display_name: node.display_name.clone(),
            uuid: node.uuid.clone(),
            old_state,
            state: node.state,
        });
    }

    fn record_zone_change(&self, node: &Node, old_zone: &str) {
        self.history.add(HistoryEntry::NodeZoneChange {
            name: node.name.clone(),
            display_name: node.display_name.clone(),
            uuid: node.uuid.clone(),
            old_zone: old_zone.to_string(),
            zone: node.zone.clone(),
        });
    }
}
