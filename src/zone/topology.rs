use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Traversal depth cap. A misconfigured zone graph (cycle, runaway chain) is truncated here
/// instead of being rejected.
pub const MAX_ZONE_DEPTH: usize = 32;

/// A zone as declared in the configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Zone {
    pub name: String,
    #[serde(rename = "sub-zones", default)]
    pub sub_zones: Vec<String>,
}

impl Zone {
    pub fn new(name: &str, sub_zones: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            sub_zones: sub_zones.iter().map(|z| z.to_string()).collect(),
        }
    }
}

#[derive(Default)]
struct Tree {
    zones: BTreeMap<String, Zone>,
    dirty: bool,
    /// zone -> direct sub zones
    down: HashMap<String, BTreeSet<String>>,
    /// zone -> direct top zones
    up: HashMap<String, BTreeSet<String>>,
    /// zone -> every descendant
    all_down: HashMap<String, BTreeSet<String>>,
    /// zone -> every ancestor
    all_up: HashMap<String, BTreeSet<String>>,
}

impl Tree {
    fn relink(&mut self) {
        if !self.dirty {
            return;
        }

        self.down.clear();
        self.up.clear();
        self.all_down.clear();
        self.all_up.clear();

        for (name, zone) in self.zones.iter() {
            let subs = self.down.entry(name.clone()).or_default();
            for sub in zone.sub_zones.iter() {
                subs.insert(sub.clone());
            }
            for sub in zone.sub_zones.iter() {
                self.up.entry(sub.clone()).or_default().insert(name.clone());
            }
        }

        let names: BTreeSet<String> = self
            .down
            .keys()
            .chain(self.up.keys())
            .cloned()
            .collect();

        for name in names {
            let mut descendants = BTreeSet::new();
            collect(&self.down, &name, &name, 0, &mut descendants);
            self.all_down.insert(name.clone(), descendants);

            let mut ancestors = BTreeSet::new();
            collect(&self.up, &name, &name, 0, &mut ancestors);
            self.all_up.insert(name, ancestors);
        }

        tracing::debug!("Zone tree relinked ({} zones)", self.zones.len());
        self.dirty = false;
    }
}

fn collect(
    graph: &HashMap<String, BTreeSet<String>>,
    origin: &str,
    current: &str,
    depth: usize,
    out: &mut BTreeSet<String>,
) {
    if depth >= MAX_ZONE_DEPTH {
        tracing::debug!(
            "Zone traversal from {} truncated at depth {}",
            origin,
            MAX_ZONE_DEPTH
        );
        return;
    }

    let Some(next) = graph.get(current) else {
        return;
    };

    for zone in next {
        if zone == origin {
            continue;
        }
        if out.insert(zone.clone()) {
            collect(graph, origin, zone, depth + 1, out);
        }
    }
}

/// Cached view of the zone hierarchy.
///
/// Queries lazily rebuild the cached closures when a zone was added since the last query.
/// Unknown zones are not an error: they simply have no relatives.
#[derive(Default)]
pub struct ZoneTopology {
    tree: Mutex<Tree>,
}

impl ZoneTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_zones(zones: impl IntoIterator<Item = Zone>) -> Self {
        let topology = Self::new();
        for zone in zones {
            topology.add(zone);
        }
        topology
    }

    /// Registers (or replaces) a zone and marks the cached tree dirty.
    pub fn add(&self, zone: Zone) {
        if zone.name.is_empty() {
            return;
        }
        let mut tree = self.tree.lock();
        tree.zones.insert(zone.name.clone(), zone);
        tree.dirty = true;
    }

    pub fn get_zones(&self) -> BTreeMap<String, Zone> {
        self.tree.lock().zones.clone()
    }

    pub fn has_zone(&self, name: &str) -> bool {
        self.tree.lock().zones.contains_key(name)
    }

    fn query(&self, pick: impl FnOnce(&Tree) -> Option<&BTreeSet<String>>) -> BTreeSet<String> {
        let mut tree = self.tree.lock();
        tree.relink();
        pick(&*tree).cloned().unwrap_or_default()
    }

    /// Every ancestor of `zone`.
    pub fn get_top_zones(&self, zone: &str) -> BTreeSet<String> {
        self.query(|t| t.all_up.get(zone))
    }

    /// Every descendant of `zone`.
    pub fn get_sub_zones(&self, zone: &str) -> BTreeSet<String> {
        self.query(|t| t.all_down.get(zone))
    }

    pub fn get_direct_top_zones(&self, zone: &str) -> BTreeSet<String> {
        self.query(|t| t.up.get(zone))
    }

    pub fn get_direct_sub_zones(&self, zone: &str) -> BTreeSet<String> {
        self.query(|t| t.down.get(zone))
    }

    /// Is `candidate` an ancestor of `from`?
    pub fn is_top_zone(&self, from: &str, candidate: &str) -> bool {
        self.get_top_zones(from).contains(candidate)
    }

    /// Is `candidate` a descendant of `from`?
    pub fn is_sub_zone(&self, from: &str, candidate: &str) -> bool {
        self.get_sub_zones(from).contains(candidate)
    }

    pub fn is_direct_top_zone(&self, from: &str, candidate: &str) -> bool {
        self.get_direct_top_zones(from).contains(candidate)
    }

    pub fn is_direct_sub_zone(&self, from: &str, candidate: &str) -> bool {
        self.get_direct_sub_zones(from).contains(candidate)
    }
}
