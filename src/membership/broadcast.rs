//! Broadcast queue for epidemic dissemination.
//!
//! Every local state change becomes an entry here. Each gossip tick hands all pending entries
//! to up to `K` peers; entries successfully sent to peers of our own zone are marked sent and
//! retired once sent `K` times. Relays to other zones do not count.

use super::types::GossipMessage;

use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct Broadcast {
    pub id: u64,
    pub message: GossipMessage,
    pub send_count: usize,
    /// Node state changes go out ahead of events.
    pub prioritary: bool,
}

#[derive(Default)]
struct Entries {
    next_id: u64,
    pending: Vec<Broadcast>,
}

pub struct BroadcastQueue {
    entries: Mutex<Entries>,
    fanout: usize,
}

impl BroadcastQueue {
    pub fn new(fanout: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            fanout: fanout.max(1),
        }
    }

    pub fn push(&self, message: GossipMessage) {
        let mut entries = self.entries.lock();
        let id = entries.next_id;
        entries.next_id += 1;
        let prioritary = message.is_node_state();
        entries.pending.push(Broadcast {
            id,
            message,
            send_count: 0,
            prioritary,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().pending.is_empty()
    }

    pub fn fanout(&self) -> usize {
        self.fanout
    }

    /// Copy of the queue, in dissemination order: prioritary first, then least sent first.
    pub fn pending(&self) -> Vec<Broadcast> {
        let mut entries = self.entries.lock();
        entries
            .pending
            .sort_by_key(|b| (!b.prioritary, b.send_count));
        entries.pending.clone()
    }

    /// Bumps the send count of the given entries and retires those that reached the fan-out.
    ///
    /// Entries retired or unknown meanwhile are skipped.
    pub fn mark_sent(&self, ids: &[u64]) {
        let mut entries = self.entries.lock();
        for entry in entries.pending.iter_mut() {
            if ids.contains(&entry.id) {
                entry.send_count += 1;
            }
        }
        let fanout = self.fanout;
        entries.pending.retain(|b| b.send_count < fanout);
    }
}

/// Packs messages into JSON-array datagrams of at most `budget` bytes.
///
/// A single message larger than the budget still goes out, alone in its datagram.
pub fn pack_datagrams(
    messages: &[GossipMessage],
    budget: usize,
) -> Result<Vec<Vec<u8>>, serde_json::Error> {
    let mut datagrams = Vec::new();
    let mut current: Vec<Vec<u8>> = Vec::new();
    // "[" + "]" + separators
    let mut current_len = 2;

    for message in messages {
        let encoded = serde_json::to_vec(message)?;
        let extra = encoded.len() + usize::from(!current.is_empty());

        if !current.is_empty() && current_len + extra > budget {
            datagrams.push(join(&current));
            current.clear();
            current_len = 2;
        }

        current_len += encoded.len() + usize::from(!current.is_empty());
        current.push(encoded);
    }

    if !current.is_empty() {
        datagrams.push(join(&current));
    }

    Ok(datagrams)
}

fn join(parts: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(Vec::len).sum::<usize>() + parts.len() + 1);
    out.push(b'[');
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        out.extend_from_slice(part);
    }
    out.push(b']');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::types::{Event, GossipMessage, Node, NodeId, decode_datagram};
    use serde_json::json;

    fn alive(id: &str) -> GossipMessage {
        GossipMessage::alive(&Node::new(NodeId::from(id), id, "10.0.0.1", 6768))
    }

    fn event(id: &str) -> GossipMessage {
        GossipMessage::Event(Event {
            eventid: id.to_string(),
            from: NodeId::from("origin"),
            payload: json!({ "type": "deploy" }),
            ctime: 1,
        })
    }

    fn ids(queue: &BroadcastQueue) -> Vec<u64> {
        queue.pending().iter().map(|b| b.id).collect()
    }

    #[test]
    fn test_entry_retired_after_fanout_sends() {
        let queue = BroadcastQueue::new(3);
        queue.push(alive("a"));

        for _ in 0..2 {
            queue.mark_sent(&ids(&queue));
        }
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending()[0].send_count, 2);

        queue.mark_sent(&ids(&queue));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_only_marked_entries_count() {
        let queue = BroadcastQueue::new(2);
        queue.push(alive("a"));
        queue.push(alive("b"));
        let first = queue.pending()[0].id;

        queue.mark_sent(&[first]);
        queue.mark_sent(&[first, 999]);

        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_ne!(pending[0].id, first);
        assert_eq!(pending[0].send_count, 0);
    }

    #[test]
    fn test_node_state_is_prioritary_and_least_sent_first() {
        let queue = BroadcastQueue::new(10);
        queue.push(event("e1"));
        queue.mark_sent(&ids(&queue));
        queue.push(event("e2"));
        queue.push(alive("a"));

        let pending = queue.pending();

        assert!(pending[0].prioritary);
        assert!(matches!(pending[0].message, GossipMessage::Alive(_)));
        assert!(matches!(&pending[1].message, GossipMessage::Event(e) if e.eventid == "e2"));
        assert!(matches!(&pending[2].message, GossipMessage::Event(e) if e.eventid == "e1"));
        assert!(!pending[2].prioritary);
    }

    #[test]
    fn test_pack_respects_budget() {
        let messages: Vec<GossipMessage> = (0..40).map(|i| alive(&format!("node-{i}"))).collect();

        let datagrams = pack_datagrams(&messages, 1400).unwrap();

        assert!(datagrams.len() > 1);
        let mut total = 0;
        for datagram in &datagrams {
            assert!(datagram.len() <= 1400);
            total += decode_datagram(datagram).unwrap().len();
        }
        assert_eq!(total, 40);
    }

    #[test]
    fn test_oversized_message_goes_alone() {
        let mut big = Node::new(NodeId::from("big"), "big", "10.0.0.1", 6768);
        big.services
            .insert("blob".to_string(), json!("x".repeat(3000)));
        let messages = vec![alive("a"), GossipMessage::alive(&big), alive("b")];

        let datagrams = pack_datagrams(&messages, 1400).unwrap();

        assert_eq!(datagrams.len(), 3);
        assert_eq!(decode_datagram(&datagrams[1]).unwrap().len(), 1);
    }

    #[test]
    fn test_pack_empty_is_nothing() {
        assert!(pack_datagrams(&[], 1400).unwrap().is_empty());
    }
}
