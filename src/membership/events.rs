//! Event store: ids of recently seen events with their payload, kept for a fixed TTL so an
//! event is disseminated once and not bounced around forever. Delivery is best effort.

use super::types::Event;

use dashmap::DashMap;
use std::collections::HashMap;

pub struct EventStore {
    events: DashMap<String, Event>,
    ttl_secs: u64,
}

impl EventStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            events: DashMap::new(),
            ttl_secs,
        }
    }

    /// Stores the event. Returns `false` if it was already known or has no id.
    pub fn add(&self, event: Event) -> bool {
        if event.eventid.is_empty() || self.events.contains_key(&event.eventid) {
            return false;
        }
        self.events.insert(event.eventid.clone(), event);
        true
    }

    pub fn contains(&self, eventid: &str) -> bool {
        self.events.contains_key(eventid)
    }

    /// Adds every unknown, non-empty event and returns the ones that were new.
    pub fn merge(&self, events: HashMap<String, Event>) -> Vec<Event> {
        let mut fresh = Vec::new();
        for (eventid, mut event) in events {
            if eventid.is_empty() || event.payload.is_null() {
                continue;
            }
            event.eventid = eventid;
            if self.add(event.clone()) {
                fresh.push(event);
            }
        }
        fresh
    }

    pub fn snapshot(&self) -> HashMap<String, Event> {
        self.events
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Most recent event whose payload has the given `type`.
    pub fn find_by_type(&self, event_type: &str) -> Option<Event> {
        self.events
            .iter()
            .filter(|entry| entry.value().event_type() == Some(event_type))
            .max_by_key(|entry| entry.value().ctime)
            .map(|entry| entry.value().clone())
    }

    pub fn has_event_type(&self, event_type: &str) -> bool {
        self.events
            .iter()
            .any(|entry| entry.value().event_type() == Some(event_type))
    }

    /// Drops every event created more than the TTL before `now`, delivered or not.
    pub fn purge_expired(&self, now: u64) -> usize {
        let before = self.events.len();
        let limit = now.saturating_sub(self.ttl_secs);
        self.events.retain(|_, event| event.ctime >= limit);
        before - self.events.len()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
