//! Protolab Consistent Hashing
//!
//! Consistent hashing ring with virtual nodes. Keys and virtual nodes hash
//! onto a modular ring; a key belongs to the first virtual node at or after
//! its position, wrapping past the end. Membership changes report exactly
//! which keys changed owner.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::{SharedClock, SystemClock};
use crate::event::{Event, EventLog};
use crate::node::{node_ids, NodeId};
use protolab_common::config::HashRingConfig;
use protolab_common::utils::ring_position;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Virtual Node
// =============================================================================

/// A virtual node in the hash ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualNode {
    pub server: NodeId,
    pub replica_index: usize,
    pub position: u64,
}

impl VirtualNode {
    fn label(server: &NodeId, replica_index: usize) -> String {
        format!("{}#{}", server, replica_index)
    }
}

/// One key changing owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMove {
    pub key: String,
    pub from: Option<NodeId>,
    pub to: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashRingStats {
    pub servers: usize,
    pub virtual_nodes_per_server: usize,
    pub ring_points: usize,
    pub keys: usize,
    pub distribution: BTreeMap<NodeId, usize>,
    pub keys_moved: usize,
}

// =============================================================================
// Hash Ring
// =============================================================================

/// A consistent hash ring for distributing keys across servers.
#[derive(Debug, Clone)]
pub struct HashRing {
    config: HashRingConfig,
    ring: BTreeMap<u64, VirtualNode>,
    servers: Vec<NodeId>,
    virtual_nodes: usize,
    keys: BTreeSet<String>,
    keys_moved: usize,
    events: EventLog,
    clock: SharedClock,
}

impl HashRing {
    /// Create a ring holding servers `S0..S{n-1}`.
    pub fn new(config: HashRingConfig) -> Self {
        let mut ring = Self {
            ring: BTreeMap::new(),
            servers: Vec::new(),
            virtual_nodes: config.virtual_nodes,
            keys: BTreeSet::new(),
            keys_moved: 0,
            events: EventLog::new(),
            clock: SystemClock::shared(),
            config,
        };
        for server in node_ids("S", ring.config.servers) {
            ring.place_server(&server);
            ring.servers.push(server);
        }
        ring
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn log(&mut self, kind: &str, description: String, data: serde_json::Value) {
        let now = self.clock.now_millis();
        self.events.record(now, kind, description, data);
    }

    pub fn events(&self) -> &[Event] {
        self.events.events()
    }

    pub fn servers(&self) -> &[NodeId] {
        &self.servers
    }

    pub fn keys(&self) -> &BTreeSet<String> {
        &self.keys
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// Virtual nodes in ring order.
    pub fn ring_points(&self) -> Vec<&VirtualNode> {
        self.ring.values().collect()
    }

    pub fn key_position(&self, key: &str) -> u64 {
        ring_position(key, self.config.ring_size)
    }

    /// Insert the server's virtual nodes. A colliding position probes
    /// forward to the next free slot.
    fn place_server(&mut self, server: &NodeId) {
        let ring_size = self.config.ring_size;
        for replica_index in 0..self.virtual_nodes {
            let mut position = ring_position(&VirtualNode::label(server, replica_index), ring_size);
            let mut probes = 0u64;
            while self.ring.contains_key(&position) {
                probes += 1;
                if ring_size != 0 && probes >= ring_size {
                    break;
                }
                position = match ring_size {
                    0 => position.wrapping_add(1),
                    size => (position + 1) % size,
                };
            }
            if self.ring.contains_key(&position) {
                tracing::warn!(server = %server, replica_index, "ring full, virtual node dropped");
                continue;
            }
            self.ring.insert(
                position,
                VirtualNode {
                    server: server.clone(),
                    replica_index,
                    position,
                },
            );
        }
    }

    fn owner_at(&self, position: u64) -> Option<&NodeId> {
        self.ring
            .range(position..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, vnode)| &vnode.server)
    }

    /// Server responsible for `key`, whether or not the key is stored.
    pub fn owner_of(&self, key: &str) -> Option<&NodeId> {
        self.owner_at(self.key_position(key))
    }

    /// The first `count` distinct servers clockwise from the key.
    pub fn preference_list(&self, key: &str, count: usize) -> Vec<NodeId> {
        let position = self.key_position(key);
        let mut result: Vec<NodeId> = Vec::with_capacity(count);
        for (_, vnode) in self.ring.range(position..).chain(self.ring.range(..position)) {
            if result.len() >= count {
                break;
            }
            if !result.contains(&vnode.server) {
                result.push(vnode.server.clone());
            }
        }
        result
    }

    pub fn add_key(&mut self, key: &str) -> Option<NodeId> {
        self.keys.insert(key.to_string());
        let owner = self.owner_of(key).cloned();
        let position = self.key_position(key);
        self.log(
            "key_added",
            format!("{} at {} -> {}", key, position, owner.as_ref().map(NodeId::as_str).unwrap_or("<none>")),
            json!({ "key": key, "position": position, "owner": owner }),
        );
        owner
    }

    fn ownership(&self) -> BTreeMap<String, Option<NodeId>> {
        self.keys
            .iter()
            .map(|k| (k.clone(), self.owner_of(k).cloned()))
            .collect()
    }

    fn diff(&mut self, before: BTreeMap<String, Option<NodeId>>) -> Vec<KeyMove> {
        let moves: Vec<KeyMove> = before
            .into_iter()
            .filter_map(|(key, from)| {
                let to = self.owner_of(&key).cloned();
                (from != to).then_some(KeyMove { key, from, to })
            })
            .collect();
        self.keys_moved += moves.len();
        moves
    }

    pub fn add_server(&mut self, server: &NodeId) -> Vec<KeyMove> {
        if self.servers.contains(server) {
            self.log(
                "add_server_failed",
                format!("{} already on the ring", server),
                json!({ "server": server }),
            );
            return Vec::new();
        }
        let before = self.ownership();
        self.place_server(server);
        self.servers.push(server.clone());
        let moves = self.diff(before);
        tracing::info!(server = %server, moved = moves.len(), "server added");
        self.log(
            "server_added",
            format!("{} joins, {} keys move", server, moves.len()),
            json!({ "server": server, "moves": moves }),
        );
        moves
    }

    pub fn remove_server(&mut self, server: &NodeId) -> Vec<KeyMove> {
        if !self.servers.contains(server) {
            self.log(
                "remove_server_failed",
                format!("{} is not on the ring", server),
                json!({ "server": server }),
            );
            return Vec::new();
        }
        let before = self.ownership();
        self.ring.retain(|_, vnode| &vnode.server != server);
        self.servers.retain(|s| s != server);
        let moves = self.diff(before);
        tracing::info!(server = %server, moved = moves.len(), "server removed");
        self.log(
            "server_removed",
            format!("{} leaves, {} keys move", server, moves.len()),
            json!({ "server": server, "moves": moves }),
        );
        moves
    }

    /// Rebuild the whole ring with a new virtual node count.
    pub fn set_virtual_nodes(&mut self, virtual_nodes: usize) -> Vec<KeyMove> {
        let before = self.ownership();
        self.virtual_nodes = virtual_nodes;
        self.ring.clear();
        let servers = self.servers.clone();
        for server in &servers {
            self.place_server(server);
        }
        let moves = self.diff(before);
        self.log(
            "ring_rebuilt",
            format!("{} virtual nodes per server, {} keys move", virtual_nodes, moves.len()),
            json!({ "virtual_nodes": virtual_nodes, "moves": moves.len() }),
        );
        moves
    }

    /// Stored keys per server, including servers that own none.
    pub fn distribution(&self) -> BTreeMap<NodeId, usize> {
        let mut counts: BTreeMap<NodeId, usize> = self.servers.iter().map(|s| (s.clone(), 0)).collect();
        for key in &self.keys {
            if let Some(owner) = self.owner_of(key) {
                *counts.entry(owner.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn stats(&self) -> HashRingStats {
        HashRingStats {
            servers: self.servers.len(),
            virtual_nodes_per_server: self.virtual_nodes,
            ring_points: self.ring.len(),
            keys: self.keys.len(),
            distribution: self.distribution(),
            keys_moved: self.keys_moved,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone()).with_clock(self.clock.clone());
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(servers: usize, virtual_nodes: usize) -> HashRing {
        HashRing::new(HashRingConfig {
            servers,
            virtual_nodes,
            ring_size: 0,
        })
    }

    #[test]
    fn test_ring_layout() {
        let ring = HashRing::new(HashRingConfig::default());
        assert_eq!(ring.servers().len(), 3);
        assert_eq!(ring.ring_points().len(), 9);
        assert!(ring.ring_points().iter().all(|v| v.position < 360));
        let positions: Vec<u64> = ring.ring_points().iter().map(|v| v.position).collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
    }

    #[test]
    fn test_owner_is_stable() {
        let mut ring = ring(3, 10);
        let owner = ring.add_key("user:1").unwrap();
        assert_eq!(ring.owner_of("user:1"), Some(&owner));
        assert_eq!(ring.distribution().values().sum::<usize>(), 1);
    }

    #[test]
    fn test_wraps_past_last_point() {
        let ring = HashRing::new(HashRingConfig {
            servers: 2,
            virtual_nodes: 1,
            ring_size: 360,
        });
        let last = ring.ring_points().last().map(|v| v.position).unwrap();
        let first = ring.ring_points()[0].server.clone();
        assert_eq!(ring.owner_at(last + 1), Some(&first));
    }

    #[test]
    fn test_add_server_moves_keys_only_to_it() {
        let mut ring = ring(3, 20);
        for i in 0..200 {
            ring.add_key(&format!("key-{}", i));
        }
        let moves = ring.add_server(&NodeId::new("S3"));
        assert!(!moves.is_empty());
        assert!(moves.iter().all(|m| m.to == Some(NodeId::new("S3"))));
        assert_eq!(ring.distribution()[&NodeId::new("S3")], moves.len());
        assert!(ring.add_server(&NodeId::new("S3")).is_empty());
    }

    #[test]
    fn test_remove_server_moves_only_its_keys() {
        let mut ring = ring(4, 20);
        for i in 0..200 {
            ring.add_key(&format!("key-{}", i));
        }
        let owned = ring.distribution()[&NodeId::new("S1")];
        let moves = ring.remove_server(&NodeId::new("S1"));
        assert_eq!(moves.len(), owned);
        assert!(moves.iter().all(|m| m.from == Some(NodeId::new("S1"))));
        assert!(!ring.distribution().contains_key(&NodeId::new("S1")));
    }

    #[test]
    fn test_more_virtual_nodes_balance_better() {
        let mut ring = ring(3, 1);
        for i in 0..3000 {
            ring.add_key(&format!("key-{}", i));
        }
        ring.set_virtual_nodes(200);
        assert_eq!(ring.ring_points().len(), 600);
        for count in ring.distribution().values() {
            assert!(*count > 600, "uneven: {:?}", ring.distribution());
            assert!(*count < 1400, "uneven: {:?}", ring.distribution());
        }
    }

    #[test]
    fn test_preference_list_distinct() {
        let ring = ring(3, 50);
        let list = ring.preference_list("key", 2);
        assert_eq!(list.len(), 2);
        assert_ne!(list[0], list[1]);
        assert_eq!(Some(&list[0]), ring.owner_of("key"));
        assert_eq!(ring.preference_list("key", 9).len(), 3);
    }
}
