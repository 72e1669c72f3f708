//! Protolab Vector Clocks
//!
//! Vector clocks for tracking causality, a message-driven tracker that stamps
//! every local, send and receive event, and the versioned value wrapper used
//! by the eventually consistent store.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::SharedClock;
use crate::engine::{SimContext, Simulation};
use crate::message::{Delivery, MessageCounts, MessageId, Payload};
use crate::node::{node_ids, NodeId, NodeStatus};
use crate::topology::{SimNode, Topology};
use protolab_common::config::{CausalityConfig, DeliveryConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::BTreeMap;

// =============================================================================
// Vector Clock
// =============================================================================

/// A vector clock for tracking causality between events. Missing entries
/// read as zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorClock {
    clocks: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the clock for a node.
    pub fn increment(&mut self, node_id: &NodeId) {
        *self.clocks.entry(node_id.clone()).or_insert(0) += 1;
    }

    /// Get the clock value for a node.
    pub fn get(&self, node_id: &NodeId) -> u64 {
        self.clocks.get(node_id).copied().unwrap_or(0)
    }

    /// Merge with another vector clock (take maximum of each component).
    pub fn merge(&mut self, other: &VectorClock) {
        for (node, &value) in &other.clocks {
            let current = self.clocks.entry(node.clone()).or_insert(0);
            *current = (*current).max(value);
        }
    }

    /// Create a merged clock without modifying self.
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Check if this clock happened before another.
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == VectorClockOrdering::Before
    }

    /// Check if this clock happened after another.
    pub fn happened_after(&self, other: &VectorClock) -> bool {
        other.happened_before(self)
    }

    /// Check if two clocks are concurrent (neither happened before the other).
    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == VectorClockOrdering::Concurrent
    }

    /// Compare two vector clocks.
    pub fn compare(&self, other: &VectorClock) -> VectorClockOrdering {
        let mut less = false;
        let mut greater = false;
        for node in self.clocks.keys().chain(other.clocks.keys()) {
            match self.get(node).cmp(&other.get(node)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
        }
        match (less, greater) {
            (false, false) => VectorClockOrdering::Equal,
            (true, false) => VectorClockOrdering::Before,
            (false, true) => VectorClockOrdering::After,
            (true, true) => VectorClockOrdering::Concurrent,
        }
    }

    /// Get the sum of all clock values.
    pub fn sum(&self) -> u64 {
        self.clocks.values().sum()
    }

    pub fn entries(&self) -> &BTreeMap<NodeId, u64> {
        &self.clocks
    }
}

impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == VectorClockOrdering::Equal
    }
}

impl Eq for VectorClock {}

impl PartialOrd for VectorClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.compare(other) {
            VectorClockOrdering::Equal => Some(Ordering::Equal),
            VectorClockOrdering::Before => Some(Ordering::Less),
            VectorClockOrdering::After => Some(Ordering::Greater),
            VectorClockOrdering::Concurrent => None,
        }
    }
}

// =============================================================================
// Vector Clock Ordering
// =============================================================================

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorClockOrdering {
    /// First clock happened before second.
    Before,
    /// First clock happened after second.
    After,
    /// Clocks are equal.
    Equal,
    /// Clocks are concurrent (incomparable).
    Concurrent,
}

// =============================================================================
// Versioned Value
// =============================================================================

/// A value with an associated vector clock version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue<T> {
    pub value: T,
    pub clock: VectorClock,
    pub timestamp: u64,
}

impl<T> VersionedValue<T> {
    pub fn new(value: T, clock: VectorClock, timestamp: u64) -> Self {
        Self {
            value,
            clock,
            timestamp,
        }
    }

    /// Check if this version happened before another.
    pub fn happened_before(&self, other: &VersionedValue<T>) -> bool {
        self.clock.happened_before(&other.clock)
    }

    /// Check if this version is concurrent with another.
    pub fn is_concurrent(&self, other: &VersionedValue<T>) -> bool {
        self.clock.is_concurrent(&other.clock)
    }
}

// =============================================================================
// Causality Tracker
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CausalEventKind {
    Local,
    Send,
    Receive,
}

/// One event stamped with the clock of its process right after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalEvent {
    pub id: usize,
    pub process: NodeId,
    pub kind: CausalEventKind,
    pub label: String,
    pub clock: VectorClock,
}

#[derive(Debug, Clone, Serialize)]
pub struct Process {
    pub id: NodeId,
    pub status: NodeStatus,
    pub clock: VectorClock,
}

impl SimNode for Process {
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

/// Every message the causality tracker sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CausalMessage {
    App { label: String, clock: VectorClock },
}

impl Payload for CausalMessage {
    fn kind(&self) -> &'static str {
        match self {
            CausalMessage::App { .. } => "App",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalityStats {
    pub processes: usize,
    pub events: usize,
    pub clocks: BTreeMap<NodeId, VectorClock>,
    pub concurrent_pairs: usize,
    pub messages: MessageCounts,
}

/// Processes `P0..` exchanging messages that carry vector clocks.
#[derive(Debug, Clone)]
pub struct CausalityTracker {
    config: CausalityConfig,
    nodes: Topology<Process>,
    history: Vec<CausalEvent>,
    ctx: SimContext<CausalMessage>,
}

impl CausalityTracker {
    pub fn new(config: CausalityConfig) -> Self {
        Self {
            nodes: Self::build_nodes(&config),
            config,
            history: Vec::new(),
            ctx: SimContext::default(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.ctx.set_clock(clock);
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.ctx.set_delivery(delivery);
        self
    }

    fn build_nodes(config: &CausalityConfig) -> Topology<Process> {
        Topology::new(
            node_ids("P", config.process_count)
                .into_iter()
                .map(|id| Process {
                    id,
                    status: NodeStatus::Healthy,
                    clock: VectorClock::new(),
                })
                .collect(),
        )
    }

    pub fn processes(&self) -> &[Process] {
        self.nodes.as_slice()
    }

    pub fn history(&self) -> &[CausalEvent] {
        &self.history
    }

    pub fn clock_of(&self, process: &NodeId) -> Option<&VectorClock> {
        self.nodes.get(process).map(|p| &p.clock)
    }

    fn record(&mut self, process: &NodeId, kind: CausalEventKind, label: &str, clock: VectorClock) -> usize {
        let id = self.history.len() + 1;
        self.ctx.log(
            "causal_event",
            format!("{} {:?} '{}'", process, kind, label),
            json!({ "event": id, "process": process, "kind": kind, "clock": clock }),
        );
        self.history.push(CausalEvent {
            id,
            process: process.clone(),
            kind,
            label: label.to_string(),
            clock,
        });
        id
    }

    fn tick(&mut self, process: &NodeId) -> Option<VectorClock> {
        let healthy = self.nodes.is_healthy(process);
        let node = self.nodes.get_mut(process).filter(|_| healthy)?;
        node.clock.increment(process);
        Some(node.clock.clone())
    }

    /// Record an internal event; returns its event id.
    pub fn local_event(&mut self, process: &NodeId, label: &str) -> Option<usize> {
        let clock = self.tick(process)?;
        Some(self.record(process, CausalEventKind::Local, label, clock))
    }

    /// Increment the sender's clock and attach it to a message.
    pub fn send(&mut self, from: &NodeId, to: &NodeId, label: &str) -> Option<usize> {
        if !self.nodes.contains(to) {
            return None;
        }
        let clock = self.tick(from)?;
        let event = self.record(from, CausalEventKind::Send, label, clock.clone());
        self.ctx.send(
            from,
            to,
            CausalMessage::App {
                label: label.to_string(),
                clock,
            },
        );
        Some(event)
    }

    /// Order of two recorded events by their clocks.
    pub fn compare_events(&self, a: usize, b: usize) -> Option<VectorClockOrdering> {
        let first = self.history.get(a.checked_sub(1)?)?;
        let second = self.history.get(b.checked_sub(1)?)?;
        Some(first.clock.compare(&second.clock))
    }

    fn concurrent_pairs(&self) -> usize {
        let mut count = 0;
        for (i, a) in self.history.iter().enumerate() {
            for b in &self.history[i + 1..] {
                if a.clock.is_concurrent(&b.clock) {
                    count += 1;
                }
            }
        }
        count
    }
}

impl Simulation for CausalityTracker {
    type Payload = CausalMessage;
    type Stats = CausalityStats;

    fn context(&self) -> &SimContext<CausalMessage> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SimContext<CausalMessage> {
        &mut self.ctx
    }

    fn deliver(&mut self, id: MessageId) {
        let nodes = &self.nodes;
        let message = match self.ctx.begin_delivery(id, |to| nodes.is_healthy(to)) {
            Delivery::Delivered(message) => message,
            Delivery::Failed | Delivery::Skipped => return,
        };
        let CausalMessage::App { label, clock } = message.payload;
        let Some(node) = self.nodes.get_mut(&message.to) else {
            return;
        };
        node.clock.merge(&clock);
        node.clock.increment(&message.to);
        let stamped = node.clock.clone();
        self.record(&message.to, CausalEventKind::Receive, &label, stamped);
    }

    fn stats(&self) -> CausalityStats {
        CausalityStats {
            processes: self.nodes.len(),
            events: self.history.len(),
            clocks: self.nodes.iter().map(|p| (p.id.clone(), p.clock.clone())).collect(),
            concurrent_pairs: self.concurrent_pairs(),
            messages: self.ctx.network.status_counts(),
        }
    }

    fn reset(&mut self) {
        self.nodes = Self::build_nodes(&self.config);
        self.history.clear();
        self.ctx.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        let mut c = VectorClock::new();
        for (node, n) in entries {
            for _ in 0..*n {
                c.increment(&id(node));
            }
        }
        c
    }

    #[test]
    fn test_compare() {
        let a = clock(&[("A", 1)]);
        let b = clock(&[("A", 2), ("B", 1)]);
        let c = clock(&[("B", 2)]);
        assert_eq!(a.compare(&b), VectorClockOrdering::Before);
        assert_eq!(b.compare(&a), VectorClockOrdering::After);
        assert_eq!(b.compare(&c), VectorClockOrdering::Concurrent);
        assert_eq!(a.compare(&a.clone()), VectorClockOrdering::Equal);
        // Explicit zero entries equal missing ones.
        let mut zero = VectorClock::new();
        zero.merge(&clock(&[("C", 0)]));
        assert_eq!(zero, VectorClock::new());
    }

    #[test]
    fn test_merge_and_partial_order() {
        let a = clock(&[("A", 3)]);
        let b = clock(&[("B", 1)]);
        let m = a.merged(&b);
        assert_eq!(m.get(&id("A")), 3);
        assert_eq!(m.sum(), 4);
        assert!(a < m);
        assert!(a.partial_cmp(&b).is_none());
    }

    #[test]
    fn test_message_creates_happened_before() {
        let mut tracker = CausalityTracker::new(CausalityConfig::default());
        let send = tracker.send(&id("P0"), &id("P1"), "hello").unwrap();
        let local = tracker.local_event(&id("P2"), "work").unwrap();
        tracker.deliver_all();
        let recv = tracker.history().last().unwrap().id;

        assert_eq!(tracker.compare_events(send, recv), Some(VectorClockOrdering::Before));
        assert_eq!(tracker.compare_events(send, local), Some(VectorClockOrdering::Concurrent));
        assert_eq!(tracker.compare_events(recv, 99), None);

        let p1 = tracker.clock_of(&id("P1")).unwrap();
        assert_eq!(p1.get(&id("P0")), 1);
        assert_eq!(p1.get(&id("P1")), 1);
    }

    #[test]
    fn test_failed_process_records_nothing() {
        let mut tracker = CausalityTracker::new(CausalityConfig::default());
        tracker.nodes.set_status(&id("P1"), NodeStatus::Failed);
        assert!(tracker.local_event(&id("P1"), "x").is_none());
        tracker.send(&id("P0"), &id("P1"), "lost");
        tracker.deliver_all();
        assert_eq!(tracker.history().len(), 1);
        assert_eq!(tracker.message_counts().failed, 1);

        tracker.reset();
        assert!(tracker.history().is_empty());
    }
}
