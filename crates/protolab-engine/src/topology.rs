//! Protolab Topology
//!
//! Arena of simulated nodes addressed by stable identifiers, plus the quorum
//! arithmetic every protocol shares.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::node::{NodeId, NodeStatus};
use std::collections::HashMap;

// =============================================================================
// Node Trait
// =============================================================================

/// Anything the topology can hold.
pub trait SimNode {
    fn id(&self) -> &NodeId;
    fn status(&self) -> NodeStatus;
    fn set_status(&mut self, status: NodeStatus);
}

// =============================================================================
// Topology
// =============================================================================

/// Nodes in creation order with an id index.
#[derive(Debug, Clone)]
pub struct Topology<N> {
    nodes: Vec<N>,
    index: HashMap<NodeId, usize>,
}

impl<N> Default for Topology<N> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<N: SimNode> Topology<N> {
    pub fn new(nodes: Vec<N>) -> Self {
        let mut topology = Self::default();
        for node in nodes {
            topology.insert(node);
        }
        topology
    }

    /// Add a node; a node with an existing id replaces the old one in place.
    pub fn insert(&mut self, node: N) {
        match self.index.get(node.id()) {
            Some(&i) => self.nodes[i] = node,
            None => {
                self.index.insert(node.id().clone(), self.nodes.len());
                self.nodes.push(node);
            }
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&N> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut N> {
        match self.index.get(id) {
            Some(&i) => self.nodes.get_mut(i),
            None => None,
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &N> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut N> {
        self.nodes.iter_mut()
    }

    pub fn as_slice(&self) -> &[N] {
        &self.nodes
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id().clone()).collect()
    }

    /// Position of a node in creation order.
    pub fn position(&self, id: &NodeId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True for known nodes that have not failed.
    pub fn is_healthy(&self, id: &NodeId) -> bool {
        self.get(id).map(|n| n.status().is_available()).unwrap_or(false)
    }

    pub fn healthy_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.status().is_available())
            .map(|n| n.id().clone())
            .collect()
    }

    pub fn healthy_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.status().is_available()).count()
    }

    /// Every id except `id`, in creation order.
    pub fn peers_of(&self, id: &NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.id() != id)
            .map(|n| n.id().clone())
            .collect()
    }

    /// Returns false for unknown ids.
    pub fn set_status(&mut self, id: &NodeId, status: NodeStatus) -> bool {
        match self.get_mut(id) {
            Some(node) => {
                node.set_status(status);
                true
            }
            None => false,
        }
    }
}

// =============================================================================
// Quorum Arithmetic
// =============================================================================

/// Strict majority of `n`.
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// Byzantine faults tolerated by `n` replicas.
pub fn byzantine_faults(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// Byzantine agreement quorum, `2f + 1`.
pub fn byzantine_quorum(n: usize) -> usize {
    2 * byzantine_faults(n) + 1
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Plain {
        id: NodeId,
        status: NodeStatus,
    }

    impl SimNode for Plain {
        fn id(&self) -> &NodeId {
            &self.id
        }
        fn status(&self) -> NodeStatus {
            self.status
        }
        fn set_status(&mut self, status: NodeStatus) {
            self.status = status;
        }
    }

    fn plain(id: &str) -> Plain {
        Plain {
            id: NodeId::new(id),
            status: NodeStatus::Healthy,
        }
    }

    #[test]
    fn test_lookup_and_status() {
        let mut topo = Topology::new(vec![plain("a"), plain("b"), plain("c")]);
        assert_eq!(topo.len(), 3);
        assert_eq!(topo.position(&NodeId::new("b")), Some(1));

        assert!(topo.set_status(&NodeId::new("b"), NodeStatus::Failed));
        assert!(!topo.set_status(&NodeId::new("zz"), NodeStatus::Failed));
        assert!(!topo.is_healthy(&NodeId::new("b")));
        assert!(!topo.is_healthy(&NodeId::new("zz")));
        assert_eq!(topo.healthy_ids(), vec![NodeId::new("a"), NodeId::new("c")]);
        assert_eq!(topo.peers_of(&NodeId::new("a")).len(), 2);
    }

    #[test]
    fn test_insert_replaces() {
        let mut topo = Topology::new(vec![plain("a")]);
        topo.insert(Plain {
            id: NodeId::new("a"),
            status: NodeStatus::Failed,
        });
        assert_eq!(topo.len(), 1);
        assert_eq!(topo.healthy_count(), 0);
    }

    #[test]
    fn test_quorum_math() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(4), 3);
        assert_eq!(majority(5), 3);
        assert_eq!(byzantine_faults(4), 1);
        assert_eq!(byzantine_faults(7), 2);
        assert_eq!(byzantine_faults(3), 0);
        assert_eq!(byzantine_quorum(4), 3);
        assert_eq!(byzantine_quorum(7), 5);
    }
}
