//! Protolab CRDTs (Conflict-free Replicated Data Types)
//!
//! State-based replicated types whose merge is commutative, associative and
//! idempotent, plus a small cluster harness that mutates replicas
//! independently and synchronizes them pairwise.
//!
//! Key Features:
//! - G-Counter and PN-Counter
//! - OR-Set with unique add tags and a removed-tag set
//! - RGA sequence with tombstones
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::{SharedClock, SystemClock};
use crate::event::{Event, EventLog};
use crate::node::{node_ids, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

// =============================================================================
// CRDT Trait
// =============================================================================

/// A state-based replicated data type.
pub trait Crdt: Clone + Debug + Default {
    /// Local operation applied at one replica.
    type Op: Debug + Serialize;
    /// Observable value.
    type Value: Clone + PartialEq + Debug + Serialize;

    /// Apply a local operation issued by `replica`.
    fn apply(&mut self, replica: &NodeId, op: Self::Op);

    /// Merge with another instance.
    fn merge(&mut self, other: &Self);

    fn value(&self) -> Self::Value;

    /// Create a merged instance without modifying self.
    fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }
}

// =============================================================================
// G-Counter (Grow-only Counter)
// =============================================================================

/// A grow-only counter: one slot per replica, merged by pointwise max.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GCounter {
    counts: BTreeMap<NodeId, u64>,
}

impl GCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_by(&mut self, replica: &NodeId, amount: u64) {
        *self.counts.entry(replica.clone()).or_insert(0) += amount;
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Get the value for a specific replica.
    pub fn node_value(&self, replica: &NodeId) -> u64 {
        self.counts.get(replica).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CounterOp {
    Increment(u64),
    Decrement(u64),
}

impl Crdt for GCounter {
    type Op = u64;
    type Value = u64;

    fn apply(&mut self, replica: &NodeId, amount: u64) {
        self.increment_by(replica, amount);
    }

    fn merge(&mut self, other: &Self) {
        for (replica, &value) in &other.counts {
            let current = self.counts.entry(replica.clone()).or_insert(0);
            *current = (*current).max(value);
        }
    }

    fn value(&self) -> u64 {
        self.total()
    }
}

// =============================================================================
// PN-Counter (Positive-Negative Counter)
// =============================================================================

/// A counter that supports both increment and decrement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PNCounter {
    positive: GCounter,
    negative: GCounter,
}

impl PNCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Crdt for PNCounter {
    type Op = CounterOp;
    type Value = i64;

    fn apply(&mut self, replica: &NodeId, op: CounterOp) {
        match op {
            CounterOp::Increment(n) => self.positive.increment_by(replica, n),
            CounterOp::Decrement(n) => self.negative.increment_by(replica, n),
        }
    }

    fn merge(&mut self, other: &Self) {
        self.positive.merge(&other.positive);
        self.negative.merge(&other.negative);
    }

    fn value(&self) -> i64 {
        self.positive.total() as i64 - self.negative.total() as i64
    }
}

// =============================================================================
// OR-Set (Observed-Remove Set)
// =============================================================================

/// Tag making every add unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UniqueTag {
    pub replica: NodeId,
    pub counter: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SetOp<T> {
    Add(T),
    Remove(T),
}

/// Add-wins set: an element is present while any of its add tags has not
/// been removed. A remove only covers the tags its replica has observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ORSet<T: Ord> {
    adds: BTreeMap<T, BTreeSet<UniqueTag>>,
    removed: BTreeSet<UniqueTag>,
    counters: BTreeMap<NodeId, u64>,
}

impl<T: Ord> Default for ORSet<T> {
    fn default() -> Self {
        Self {
            adds: BTreeMap::new(),
            removed: BTreeSet::new(),
            counters: BTreeMap::new(),
        }
    }
}

impl<T: Clone + Ord> ORSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, element: T, replica: &NodeId) -> UniqueTag {
        let counter = self.counters.entry(replica.clone()).or_insert(0);
        *counter += 1;
        let tag = UniqueTag {
            replica: replica.clone(),
            counter: *counter,
        };
        self.adds.entry(element).or_default().insert(tag.clone());
        tag
    }

    pub fn remove(&mut self, element: &T) {
        if let Some(tags) = self.adds.get(element) {
            self.removed.extend(tags.iter().cloned());
        }
    }

    pub fn contains(&self, element: &T) -> bool {
        self.adds
            .get(element)
            .map(|tags| tags.iter().any(|t| !self.removed.contains(t)))
            .unwrap_or(false)
    }

    pub fn elements(&self) -> BTreeSet<T> {
        self.adds
            .keys()
            .filter(|e| self.contains(e))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.elements().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Ord + Debug + Serialize> Crdt for ORSet<T> {
    type Op = SetOp<T>;
    type Value = BTreeSet<T>;

    fn apply(&mut self, replica: &NodeId, op: SetOp<T>) {
        match op {
            SetOp::Add(element) => {
                self.add(element, replica);
            }
            SetOp::Remove(element) => self.remove(&element),
        }
    }

    fn merge(&mut self, other: &Self) {
        for (element, tags) in &other.adds {
            self.adds
                .entry(element.clone())
                .or_default()
                .extend(tags.iter().cloned());
        }
        self.removed.extend(other.removed.iter().cloned());
        for (replica, &counter) in &other.counters {
            let ours = self.counters.entry(replica.clone()).or_insert(0);
            *ours = (*ours).max(counter);
        }
    }

    fn value(&self) -> BTreeSet<T> {
        self.elements()
    }
}

// =============================================================================
// RGA (Replicated Growable Array)
// =============================================================================

/// Identifier of one inserted character. Ordered by counter, then replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RgaId {
    pub counter: u64,
    pub replica: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RgaElement {
    pub id: RgaId,
    pub value: char,
    /// Element this one was inserted after; `None` for the head.
    pub origin: Option<RgaId>,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RgaOp {
    Insert { position: usize, value: char },
    Delete { position: usize },
}

/// Sequence CRDT. Concurrent inserts after the same element are ordered by
/// descending id, so every replica reads the same text after merging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rga {
    elements: BTreeMap<RgaId, RgaElement>,
    counter: u64,
}

impl Rga {
    pub fn new() -> Self {
        Self::default()
    }

    /// Elements in document order, tombstones included.
    pub fn ordered(&self) -> Vec<&RgaElement> {
        let mut children: BTreeMap<Option<&RgaId>, Vec<&RgaElement>> = BTreeMap::new();
        for element in self.elements.values() {
            children.entry(element.origin.as_ref()).or_default().push(element);
        }
        for siblings in children.values_mut() {
            siblings.sort_by(|a, b| b.id.cmp(&a.id));
        }

        let mut out = Vec::with_capacity(self.elements.len());
        let mut stack: Vec<&RgaElement> = children.get(&None).map(|s| s.iter().rev().copied().collect()).unwrap_or_default();
        while let Some(element) = stack.pop() {
            out.push(element);
            if let Some(kids) = children.get(&Some(&element.id)) {
                stack.extend(kids.iter().rev().copied());
            }
        }
        out
    }

    fn visible(&self) -> Vec<&RgaElement> {
        self.ordered().into_iter().filter(|e| !e.deleted).collect()
    }

    /// Insert before the visible element at `position` (append when past the
    /// end). Returns the new element's id.
    pub fn insert(&mut self, replica: &NodeId, position: usize, value: char) -> RgaId {
        let origin = match position {
            0 => None,
            p => {
                let visible = self.visible();
                visible.get(p.min(visible.len()).saturating_sub(1)).map(|e| e.id.clone())
            }
        };
        self.counter += 1;
        let id = RgaId {
            counter: self.counter,
            replica: replica.clone(),
        };
        self.elements.insert(
            id.clone(),
            RgaElement {
                id: id.clone(),
                value,
                origin,
                deleted: false,
            },
        );
        id
    }

    /// Tombstone the visible element at `position`.
    pub fn delete(&mut self, position: usize) -> Option<RgaId> {
        let id = self.visible().get(position).map(|e| e.id.clone())?;
        if let Some(element) = self.elements.get_mut(&id) {
            element.deleted = true;
        }
        Some(id)
    }

    pub fn text(&self) -> String {
        self.visible().iter().map(|e| e.value).collect()
    }

    pub fn tombstones(&self) -> usize {
        self.elements.values().filter(|e| e.deleted).count()
    }
}

impl Crdt for Rga {
    type Op = RgaOp;
    type Value = String;

    fn apply(&mut self, replica: &NodeId, op: RgaOp) {
        match op {
            RgaOp::Insert { position, value } => {
                self.insert(replica, position, value);
            }
            RgaOp::Delete { position } => {
                self.delete(position);
            }
        }
    }

    fn merge(&mut self, other: &Self) {
        for (id, theirs) in &other.elements {
            match self.elements.get_mut(id) {
                Some(ours) => ours.deleted |= theirs.deleted,
                None => {
                    self.elements.insert(id.clone(), theirs.clone());
                }
            }
        }
        self.counter = self.counter.max(other.counter);
    }

    fn value(&self) -> String {
        self.text()
    }
}

// =============================================================================
// CRDT Cluster
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrdtStats<V> {
    pub replicas: usize,
    pub converged: bool,
    pub values: BTreeMap<NodeId, V>,
    pub operations: usize,
    pub syncs: usize,
}

/// Replicas of one CRDT that are mutated independently and synchronized
/// pairwise by the caller.
#[derive(Debug, Clone)]
pub struct CrdtCluster<C: Crdt> {
    replica_count: usize,
    replicas: BTreeMap<NodeId, C>,
    events: EventLog,
    clock: SharedClock,
}

impl<C: Crdt> CrdtCluster<C> {
    pub fn new(replica_count: usize) -> Self {
        Self {
            replica_count,
            replicas: Self::build_replicas(replica_count),
            events: EventLog::new(),
            clock: SystemClock::shared(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn build_replicas(count: usize) -> BTreeMap<NodeId, C> {
        node_ids("R", count).into_iter().map(|id| (id, C::default())).collect()
    }

    pub fn replica(&self, id: &NodeId) -> Option<&C> {
        self.replicas.get(id)
    }

    pub fn replica_ids(&self) -> Vec<NodeId> {
        self.replicas.keys().cloned().collect()
    }

    pub fn events(&self) -> &[Event] {
        self.events.events()
    }

    pub fn mutate_replica(&mut self, id: &NodeId, op: C::Op) -> bool {
        let Some(replica) = self.replicas.get_mut(id) else {
            let now = self.clock.now_millis();
            self.events.record(
                now,
                "mutate_failed",
                format!("unknown replica {}", id),
                json!({ "replica": id, "op": op }),
            );
            return false;
        };
        let description = format!("{} applies {:?}", id, op);
        let data = json!({ "replica": id, "op": op });
        replica.apply(id, op);
        let value = replica.value();
        let now = self.clock.now_millis();
        self.events.record(now, "crdt_update", description, json!({ "update": data, "value": value }));
        true
    }

    /// Merge `a` into `b` and `b` into `a`.
    pub fn sync(&mut self, a: &NodeId, b: &NodeId) -> bool {
        let (Some(left), Some(right)) = (self.replicas.get(a).cloned(), self.replicas.get(b).cloned()) else {
            return false;
        };
        let merged = left.merged(&right);
        let value = merged.value();
        self.replicas.insert(a.clone(), merged.clone());
        self.replicas.insert(b.clone(), merged);
        let now = self.clock.now_millis();
        self.events.record(
            now,
            "crdt_sync",
            format!("{} <-> {}", a, b),
            json!({ "a": a, "b": b, "value": value }),
        );
        true
    }

    /// Synchronize every pair once, in id order.
    pub fn sync_all(&mut self) {
        let ids = self.replica_ids();
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                self.sync(a, b);
            }
        }
    }

    pub fn values(&self) -> BTreeMap<NodeId, C::Value> {
        self.replicas
            .iter()
            .map(|(id, c)| (id.clone(), c.value()))
            .collect()
    }

    pub fn is_converged(&self) -> bool {
        let mut values = self.replicas.values().map(|c| c.value());
        match values.next() {
            Some(first) => values.all(|v| v == first),
            None => true,
        }
    }

    pub fn stats(&self) -> CrdtStats<C::Value> {
        CrdtStats {
            replicas: self.replicas.len(),
            converged: self.is_converged(),
            values: self.values(),
            operations: self.events.count_of("crdt_update"),
            syncs: self.events.count_of("crdt_sync"),
        }
    }

    pub fn reset(&mut self) {
        self.replicas = Self::build_replicas(self.replica_count);
        self.events.clear();
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

    #[test]
    fn test_gcounter_merge() {
        let mut a = GCounter::new();
        let mut b = GCounter::new();
        a.apply(&id("A"), 2);
        b.apply(&id("B"), 3);
        b.apply(&id("A"), 1);

        let ab = a.merged(&b);
        assert_eq!(ab.value(), 5);
        assert_eq!(ab, b.merged(&a));
        assert_eq!(ab.merged(&ab), ab);
        assert_eq!(ab.node_value(&id("A")), 2);
    }

    #[test]
    fn test_pncounter_negative() {
        let mut counter = PNCounter::new();
        counter.apply(&id("A"), CounterOp::Increment(1));
        counter.apply(&id("A"), CounterOp::Decrement(3));
        assert_eq!(counter.value(), -2);
    }

    #[test]
    fn test_orset_add_wins_over_concurrent_remove() {
        let mut a: ORSet<String> = ORSet::new();
        a.add("x".to_string(), &id("A"));
        let mut b = a.clone();

        // A removes the tag it observed while B adds again concurrently.
        a.remove(&"x".to_string());
        b.add("x".to_string(), &id("B"));
        assert!(!a.contains(&"x".to_string()));

        let merged = a.merged(&b);
        assert!(merged.contains(&"x".to_string()));
        assert_eq!(merged, b.merged(&a));
    }

    #[test]
    fn test_orset_observed_remove() {
        let mut a: ORSet<&str> = ORSet::new();
        a.add("x", &id("A"));
        let mut b = a.clone();
        b.remove(&"x");
        a.merge(&b);
        assert!(a.is_empty());
    }

    #[test]
    fn test_rga_local_edits() {
        let mut doc = Rga::new();
        let r = id("A");
        doc.insert(&r, 0, 'h');
        doc.insert(&r, 1, 'i');
        doc.insert(&r, 0, '>');
        assert_eq!(doc.text(), ">hi");
        doc.insert(&r, 2, '-');
        assert_eq!(doc.text(), ">h-i");
        assert!(doc.delete(0).is_some());
        assert_eq!(doc.text(), "h-i");
        assert!(doc.delete(9).is_none());
        assert_eq!(doc.tombstones(), 1);
    }

    #[test]
    fn test_rga_concurrent_inserts_converge() {
        let mut base = Rga::new();
        base.insert(&id("A"), 0, 'a');
        let mut left = base.clone();
        let mut right = base.clone();

        left.insert(&id("A"), 1, 'x');
        right.insert(&id("B"), 1, 'y');
        right.delete(0);

        let lr = left.merged(&right);
        let rl = right.merged(&left);
        assert_eq!(lr.text(), rl.text());
        // Equal counters: the higher replica id sorts first.
        assert_eq!(lr.text(), "yx");
    }

    #[test]
    fn test_cluster_converges_after_sync_all() {
        let mut cluster: CrdtCluster<GCounter> = CrdtCluster::new(3);
        cluster.mutate_replica(&id("R0"), 2);
        cluster.mutate_replica(&id("R1"), 5);
        assert!(!cluster.mutate_replica(&id("R9"), 1));
        assert!(!cluster.is_converged());

        assert!(cluster.sync(&id("R0"), &id("R1")));
        assert_eq!(cluster.values()[&id("R0")], 7);
        assert!(!cluster.is_converged());

        cluster.sync_all();
        assert!(cluster.is_converged());
        let stats = cluster.stats();
        assert_eq!(stats.operations, 2);
        assert_eq!(stats.syncs, 4);

        cluster.reset();
        assert!(cluster.events().is_empty());
    }
}
