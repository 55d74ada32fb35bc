// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Discovery catalog: the read-only view of the peers in a cluster
//!
//! The catalog backend (etcd or similar) lives outside this crate; the
//! router consumes [DiscoveryNode] values and PUT/DELETE events. Selection
//! policies must converge across every process in the cluster, so all
//! ordering and tie-breaking is derived from the stable 128-bit node-name
//! hash rather than from any per-process state.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use rand::Rng;

use crate::config::GatewayConfig;
use crate::identity::NameHash;
use crate::message::Metadata;

/// Virtual ring points generated per node for consistent-hash selection.
const RING_POINTS_PER_NODE: usize = 16;

/// A discovery catalog change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryAction {
    /// Node inserted or updated
    Put,
    /// Node removed
    Delete,
}

/// Static facts a node publishes about itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryNodeInfo {
    /// Numeric node id
    pub id: u64,
    /// Node name
    pub name: String,
    /// Host the node runs on
    pub hostname: String,
    /// Numeric node type
    pub type_id: u64,
    /// Human-readable node type
    pub type_name: String,
    /// Application version string
    pub version: String,
    /// Namespace and labels, used by gateway matching
    pub metadata: Metadata,
    /// Advertised ingress gateways, in preference order
    pub gateways: Vec<GatewayConfig>,
}

/// One peer as seen through discovery. Shared (`Rc`) and read-only apart
/// from the ingress round-robin cursor.
#[derive(Debug)]
pub struct DiscoveryNode {
    info: DiscoveryNodeInfo,
    name_hash: NameHash,
    ingress_cursor: Cell<usize>,
}

impl DiscoveryNode {
    /// Wrap published node facts, precomputing the stable name hash.
    pub fn new(info: DiscoveryNodeInfo) -> Rc<Self> {
        let name_hash = NameHash::digest(info.name.as_bytes());
        Rc::new(Self {
            info,
            name_hash,
            ingress_cursor: Cell::new(0),
        })
    }

    /// The published facts.
    pub fn info(&self) -> &DiscoveryNodeInfo {
        &self.info
    }

    /// Numeric node id.
    pub fn id(&self) -> u64 {
        self.info.id
    }

    /// Node name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// The stable 128-bit hash over the node name. Identical on every
    /// process in the cluster for the same name.
    pub fn name_hash(&self) -> NameHash {
        self.name_hash
    }

    /// Number of advertised ingress gateways.
    pub fn ingress_size(&self) -> usize {
        self.info.gateways.len()
    }

    /// The next ingress gateway, round-robin over the advertised order.
    pub fn next_ingress_gateway(&self) -> Option<&GatewayConfig> {
        if self.info.gateways.is_empty() {
            return None;
        }
        let cursor = self.ingress_cursor.get();
        self.ingress_cursor
            .set((cursor + 1) % self.info.gateways.len());
        self.info.gateways.get(cursor % self.info.gateways.len())
    }
}

fn ring_point(node: &DiscoveryNode, index: usize) -> u128 {
    let mut key = Vec::with_capacity(node.name().len() + 8);
    key.extend_from_slice(node.name().as_bytes());
    key.push(b'#');
    key.extend_from_slice(&(index as u64).to_be_bytes());
    NameHash::digest(&key).as_u128()
}

/// The peer catalog with the four selection policies.
///
/// Every process holding the same set contents makes the same
/// consistent-hash choice for the same key; round-robin and random are
/// local policies and intentionally diverge between processes.
#[derive(Debug, Default)]
pub struct DiscoverySet {
    by_id: HashMap<u64, Rc<DiscoveryNode>>,
    by_name: HashMap<String, Rc<DiscoveryNode>>,
    // sorted by name hash so iteration order is cluster-stable
    ordered: Vec<Rc<DiscoveryNode>>,
    ring: Vec<(u128, Rc<DiscoveryNode>)>,
    round_robin_cursor: Cell<usize>,
}

impl DiscoverySet {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known nodes.
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// All nodes, ordered by their stable name hash.
    pub fn nodes(&self) -> &[Rc<DiscoveryNode>] {
        &self.ordered
    }

    /// Apply a PUT/DELETE event.
    pub fn apply(&mut self, action: DiscoveryAction, node: &Rc<DiscoveryNode>) {
        match action {
            DiscoveryAction::Put => self.insert(node.clone()),
            DiscoveryAction::Delete => self.remove(node),
        }
    }

    /// Insert or replace a node. A node replaces any prior entry with the
    /// same id or the same name.
    pub fn insert(&mut self, node: Rc<DiscoveryNode>) {
        if node.id() != 0 {
            if let Some(old) = self.by_id.remove(&node.id()) {
                self.by_name.remove(old.name());
            }
        }
        if !node.name().is_empty() {
            if let Some(old) = self.by_name.remove(node.name()) {
                self.by_id.remove(&old.id());
            }
        }

        if node.id() != 0 {
            self.by_id.insert(node.id(), node.clone());
        }
        if !node.name().is_empty() {
            self.by_name.insert(node.name().to_string(), node.clone());
        }
        self.rebuild();
    }

    /// Remove a node by identity (id preferred, name as fallback).
    pub fn remove(&mut self, node: &Rc<DiscoveryNode>) {
        let mut removed = false;
        if node.id() != 0 {
            if let Some(old) = self.by_id.remove(&node.id()) {
                self.by_name.remove(old.name());
                removed = true;
            }
        }
        if !removed && !node.name().is_empty() {
            if let Some(old) = self.by_name.remove(node.name()) {
                self.by_id.remove(&old.id());
            }
        }
        self.rebuild();
    }

    fn rebuild(&mut self) {
        let mut seen: Vec<Rc<DiscoveryNode>> = Vec::with_capacity(self.by_id.len());
        for node in self.by_id.values() {
            seen.push(node.clone());
        }
        for node in self.by_name.values() {
            if node.id() == 0 || !self.by_id.contains_key(&node.id()) {
                seen.push(node.clone());
            }
        }
        seen.sort_by_key(|n| n.name_hash());
        self.ordered = seen;

        self.ring.clear();
        for node in &self.ordered {
            for index in 0..RING_POINTS_PER_NODE {
                self.ring.push((ring_point(node, index), node.clone()));
            }
        }
        // equal points resolve to the smaller name key on every process
        self.ring.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.name_hash().cmp(&b.1.name_hash()))
        });

        if self.round_robin_cursor.get() >= self.ordered.len() {
            self.round_robin_cursor.set(0);
        }
    }

    /// Look up a node by numeric id.
    pub fn get_node_by_id(&self, id: u64) -> Option<Rc<DiscoveryNode>> {
        self.by_id.get(&id).cloned()
    }

    /// Look up a node by name.
    pub fn get_node_by_name(&self, name: &str) -> Option<Rc<DiscoveryNode>> {
        self.by_name.get(name).cloned()
    }

    /// Select the node owning `key` on the consistent-hash ring.
    pub fn get_node_by_consistent_hash(&self, key: &[u8]) -> Option<Rc<DiscoveryNode>> {
        if self.ring.is_empty() {
            return None;
        }
        let point = NameHash::digest(key).as_u128();
        let index = match self.ring.binary_search_by(|(p, _)| p.cmp(&point)) {
            Ok(found) => found,
            Err(insertion) if insertion == self.ring.len() => 0,
            Err(insertion) => insertion,
        };
        Some(self.ring[index].1.clone())
    }

    /// Select a uniformly random node.
    pub fn get_node_by_random(&self) -> Option<Rc<DiscoveryNode>> {
        if self.ordered.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..self.ordered.len());
        Some(self.ordered[index].clone())
    }

    /// Select nodes in rotation. Over N selections against M live peers
    /// each peer is visited ⌊N/M⌋ or ⌈N/M⌉ times.
    pub fn get_node_by_round_robin(&self) -> Option<Rc<DiscoveryNode>> {
        if self.ordered.is_empty() {
            return None;
        }
        let cursor = self.round_robin_cursor.get() % self.ordered.len();
        self.round_robin_cursor.set(cursor + 1);
        Some(self.ordered[cursor].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u64, name: &str) -> Rc<DiscoveryNode> {
        DiscoveryNode::new(DiscoveryNodeInfo {
            id,
            name: name.to_string(),
            ..DiscoveryNodeInfo::default()
        })
    }

    #[test]
    fn lookup_by_id_and_name() {
        let mut set = DiscoverySet::new();
        set.insert(node(1, "svc-a"));
        set.insert(node(2, "svc-b"));

        assert_eq!(2, set.len());
        assert_eq!("svc-a", set.get_node_by_id(1).unwrap().name());
        assert_eq!(2, set.get_node_by_name("svc-b").unwrap().id());
        assert!(set.get_node_by_id(3).is_none());
    }

    #[test]
    fn reinsert_with_new_id_replaces_name_entry() {
        let mut set = DiscoverySet::new();
        set.insert(node(5, "svc-a"));
        set.insert(node(6, "svc-a"));

        assert_eq!(1, set.len());
        assert!(set.get_node_by_id(5).is_none());
        assert_eq!(6, set.get_node_by_name("svc-a").unwrap().id());
    }

    #[test]
    fn delete_removes_both_indices() {
        let mut set = DiscoverySet::new();
        let n = node(1, "svc-a");
        set.insert(n.clone());
        set.apply(DiscoveryAction::Delete, &n);
        assert!(set.is_empty());
        assert!(set.get_node_by_name("svc-a").is_none());
    }

    #[test]
    fn consistent_hash_is_stable_and_converges() {
        let mut left = DiscoverySet::new();
        let mut right = DiscoverySet::new();
        for (id, name) in [(1, "svc-a"), (2, "svc-b"), (3, "svc-c")] {
            left.insert(node(id, name));
        }
        // same contents, different insertion order
        for (id, name) in [(3, "svc-c"), (1, "svc-a"), (2, "svc-b")] {
            right.insert(node(id, name));
        }

        for key in ["user:1", "user:2", "session-42", ""] {
            let a = left.get_node_by_consistent_hash(key.as_bytes()).unwrap();
            let b = right.get_node_by_consistent_hash(key.as_bytes()).unwrap();
            assert_eq!(a.id(), b.id(), "diverged on key {key:?}");
            // repeat selections do not drift
            let c = left.get_node_by_consistent_hash(key.as_bytes()).unwrap();
            assert_eq!(a.id(), c.id());
        }
    }

    #[test]
    fn consistent_hash_spreads_keys() {
        let mut set = DiscoverySet::new();
        for id in 1..=4u64 {
            set.insert(node(id, &format!("svc-{id}")));
        }
        let mut hits = std::collections::HashMap::new();
        for key in 0..256u32 {
            let chosen = set
                .get_node_by_consistent_hash(&key.to_be_bytes())
                .unwrap();
            *hits.entry(chosen.id()).or_insert(0usize) += 1;
        }
        // all nodes should own some share of the key space
        assert_eq!(4, hits.len());
    }

    #[test]
    fn round_robin_visits_evenly() {
        let mut set = DiscoverySet::new();
        for id in 1..=3u64 {
            set.insert(node(id, &format!("svc-{id}")));
        }
        let mut hits = std::collections::HashMap::new();
        for _ in 0..9 {
            let chosen = set.get_node_by_round_robin().unwrap();
            *hits.entry(chosen.id()).or_insert(0usize) += 1;
        }
        assert_eq!(vec![3, 3, 3], {
            let mut v: Vec<usize> = hits.values().copied().collect();
            v.sort();
            v
        });
    }

    #[test]
    fn empty_set_selects_nothing() {
        let set = DiscoverySet::new();
        assert!(set.get_node_by_random().is_none());
        assert!(set.get_node_by_round_robin().is_none());
        assert!(set.get_node_by_consistent_hash(b"k").is_none());
    }

    #[test]
    fn ingress_gateways_rotate() {
        let n = DiscoveryNode::new(DiscoveryNodeInfo {
            id: 1,
            name: "svc".to_string(),
            gateways: vec![
                GatewayConfig {
                    address: "tcp://a:1".to_string(),
                    ..GatewayConfig::default()
                },
                GatewayConfig {
                    address: "tcp://b:2".to_string(),
                    ..GatewayConfig::default()
                },
            ],
            ..DiscoveryNodeInfo::default()
        });

        assert_eq!(2, n.ingress_size());
        assert_eq!("tcp://a:1", n.next_ingress_gateway().unwrap().address);
        assert_eq!("tcp://b:2", n.next_ingress_gateway().unwrap().address);
        assert_eq!("tcp://a:1", n.next_ingress_gateway().unwrap().address);
    }
}
