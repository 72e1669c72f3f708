//! Protolab Node
//!
//! Node identification and liveness status shared by every simulator.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use serde::{Deserialize, Serialize};

// =============================================================================
// Node ID
// =============================================================================

/// Unique identifier for a simulated node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier built from a role prefix and an index, e.g. `A2`.
    pub fn indexed(prefix: &str, index: usize) -> Self {
        Self(format!("{}{}", prefix, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Build `count` identifiers sharing a prefix, numbered from zero.
pub fn node_ids(prefix: &str, count: usize) -> Vec<NodeId> {
    (0..count).map(|i| NodeId::indexed(prefix, i)).collect()
}

// =============================================================================
// Node Status
// =============================================================================

/// Liveness of a simulated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeStatus {
    /// Node is up and handles messages.
    #[default]
    Healthy,
    /// Node has crashed; it neither sends nor processes messages.
    Failed,
    /// Node is up and busy handling a message.
    Processing,
}

impl NodeStatus {
    /// Failed is the only status that stops a node from taking part.
    pub fn is_available(&self) -> bool {
        !matches!(self, NodeStatus::Failed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id() {
        let id = NodeId::new("node1");
        assert_eq!(id.as_str(), "node1");
        assert_eq!(id.to_string(), "node1");
        assert_eq!(NodeId::from("node1"), id);
        assert_eq!(NodeId::indexed("A", 2).as_str(), "A2");
    }

    #[test]
    fn test_node_ids() {
        let ids = node_ids("S", 3);
        assert_eq!(ids, vec![NodeId::new("S0"), NodeId::new("S1"), NodeId::new("S2")]);
    }

    #[test]
    fn test_status_availability() {
        assert!(NodeStatus::Healthy.is_available());
        assert!(NodeStatus::Processing.is_available());
        assert!(!NodeStatus::Failed.is_available());
        assert_eq!(NodeStatus::default(), NodeStatus::Healthy);
    }
}
