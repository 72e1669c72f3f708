//! Protolab Messages
//!
//! Simulated network shared by every engine. A send appends an in-flight
//! message to the history; a delivery resolves it exactly once to success or
//! failure. Delivery is always driven by the caller, either directly or
//! through the deferred delivery scheduler.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Message Identity
// =============================================================================

/// Monotonic message identifier, unique within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Lifecycle of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    InFlight,
    Success,
    Failure,
}

// =============================================================================
// Payload
// =============================================================================

/// Protocol-specific message body.
pub trait Payload: Clone + fmt::Debug + Serialize {
    /// Short tag naming the message kind, e.g. `RequestVote`.
    fn kind(&self) -> &'static str;
}

// =============================================================================
// Message
// =============================================================================

/// A message in the simulated network.
#[derive(Debug, Clone, Serialize)]
pub struct Message<P> {
    pub id: MessageId,
    pub from: NodeId,
    pub to: NodeId,
    pub payload: P,
    pub status: MessageStatus,
    pub timestamp: u64,
}

impl<P: Payload> Message<P> {
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    pub fn is_in_flight(&self) -> bool {
        self.status == MessageStatus::InFlight
    }
}

/// Outcome of resolving one message.
#[derive(Debug, Clone)]
pub enum Delivery<P> {
    /// Unknown id, or the message was already resolved.
    Skipped,
    /// Target failed or unknown; the message is now a failure.
    Failed,
    /// Target is up; the caller runs the protocol handler on this copy.
    Delivered(Message<P>),
}

// =============================================================================
// Delivery Scheduler
// =============================================================================

/// Handle for a scheduled delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle(pub u64);

#[derive(Debug, Clone)]
struct ScheduledDelivery {
    handle: TaskHandle,
    message: MessageId,
    due_at: u64,
}

/// Deferred deliveries keyed by due time. Tasks are dropped, never run, when
/// the scheduler is cleared.
#[derive(Debug, Clone, Default)]
pub struct DeliveryScheduler {
    tasks: Vec<ScheduledDelivery>,
    next_handle: u64,
}

impl DeliveryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, message: MessageId, due_at: u64) -> TaskHandle {
        self.next_handle += 1;
        let handle = TaskHandle(self.next_handle);
        self.tasks.push(ScheduledDelivery {
            handle,
            message,
            due_at,
        });
        handle
    }

    /// Cancel a task; false if it already ran or never existed.
    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|t| t.handle != handle);
        self.tasks.len() != before
    }

    /// Remove and return every task due at or before `now`, in message order.
    pub fn take_due(&mut self, now: u64) -> Vec<MessageId> {
        let mut due: Vec<MessageId> = self
            .tasks
            .iter()
            .filter(|t| t.due_at <= now)
            .map(|t| t.message)
            .collect();
        self.tasks.retain(|t| t.due_at > now);
        due.sort();
        due.dedup();
        due
    }

    /// Earliest pending due time.
    pub fn next_due(&self) -> Option<u64> {
        self.tasks.iter().map(|t| t.due_at).min()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
    }
}

// =============================================================================
// Network
// =============================================================================

/// Append-only message history plus the deferred delivery queue.
#[derive(Debug, Clone)]
pub struct Network<P> {
    messages: Vec<Message<P>>,
    scheduler: DeliveryScheduler,
    auto_delivery_delay: Option<u64>,
}

impl<P> Default for Network<P> {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            scheduler: DeliveryScheduler::new(),
            auto_delivery_delay: None,
        }
    }
}

impl<P: Payload> Network<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule every future send for delivery `delay` milliseconds later.
    pub fn with_auto_delivery(mut self, delay: Option<u64>) -> Self {
        self.auto_delivery_delay = delay;
        self
    }

    pub fn set_auto_delivery(&mut self, delay: Option<u64>) {
        self.auto_delivery_delay = delay;
    }

    pub fn auto_delivery_delay(&self) -> Option<u64> {
        self.auto_delivery_delay
    }

    /// Append an in-flight message.
    pub fn send(&mut self, from: NodeId, to: NodeId, payload: P, now: u64) -> MessageId {
        let id = MessageId(self.messages.len() as u64 + 1);
        tracing::trace!(message = %id, kind = payload.kind(), from = %from, to = %to, "send");
        self.messages.push(Message {
            id,
            from,
            to,
            payload,
            status: MessageStatus::InFlight,
            timestamp: now,
        });
        if let Some(delay) = self.auto_delivery_delay {
            self.scheduler.schedule(id, now + delay);
        }
        id
    }

    /// Append an in-flight message that is delivered `delay` milliseconds
    /// from `now` regardless of the auto-delivery setting.
    pub fn send_delayed(
        &mut self,
        from: NodeId,
        to: NodeId,
        payload: P,
        now: u64,
        delay: u64,
    ) -> (MessageId, TaskHandle) {
        let saved = self.auto_delivery_delay.take();
        let id = self.send(from, to, payload, now);
        self.auto_delivery_delay = saved;
        let handle = self.scheduler.schedule(id, now + delay);
        (id, handle)
    }

    /// Resolve a message. `target_up` decides whether the recipient can
    /// process it.
    pub fn begin_delivery(
        &mut self,
        id: MessageId,
        target_up: impl FnOnce(&NodeId) -> bool,
    ) -> Delivery<P> {
        let Some(message) = self.get_mut(id) else {
            return Delivery::Skipped;
        };
        if message.status != MessageStatus::InFlight {
            return Delivery::Skipped;
        }
        if target_up(&message.to) {
            message.status = MessageStatus::Success;
            Delivery::Delivered(message.clone())
        } else {
            message.status = MessageStatus::Failure;
            tracing::warn!(message = %id, kind = message.payload.kind(), to = %message.to, "delivery failed");
            Delivery::Failed
        }
    }

    pub fn get(&self, id: MessageId) -> Option<&Message<P>> {
        let index = id.0.checked_sub(1)? as usize;
        self.messages.get(index)
    }

    fn get_mut(&mut self, id: MessageId) -> Option<&mut Message<P>> {
        let index = id.0.checked_sub(1)? as usize;
        self.messages.get_mut(index)
    }

    pub fn messages(&self) -> &[Message<P>] {
        &self.messages
    }

    /// Ids of every unresolved message, oldest first.
    pub fn in_flight(&self) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|m| m.is_in_flight())
            .map(|m| m.id)
            .collect()
    }

    pub fn scheduler(&self) -> &DeliveryScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut DeliveryScheduler {
        &mut self.scheduler
    }

    /// Count of messages in each status.
    pub fn status_counts(&self) -> MessageCounts {
        let mut counts = MessageCounts::default();
        for m in &self.messages {
            match m.status {
                MessageStatus::InFlight => counts.in_flight += 1,
                MessageStatus::Success => counts.delivered += 1,
                MessageStatus::Failure => counts.failed += 1,
            }
        }
        counts
    }

    /// Forget every message and scheduled delivery.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.scheduler.clear();
    }
}

/// Message totals by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCounts {
    pub in_flight: usize,
    pub delivered: usize,
    pub failed: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize)]
    enum Ping {
        Ping,
    }

    impl Payload for Ping {
        fn kind(&self) -> &'static str {
            "Ping"
        }
    }

    fn n(s: &str) -> NodeId {
        NodeId::new(s)
    }

    #[test]
    fn test_send_and_deliver() {
        let mut net = Network::new();
        let id = net.send(n("a"), n("b"), Ping::Ping, 10);
        assert_eq!(id, MessageId(1));
        assert_eq!(net.in_flight(), vec![id]);

        match net.begin_delivery(id, |_| true) {
            Delivery::Delivered(m) => {
                assert_eq!(m.kind(), "Ping");
                assert_eq!(m.timestamp, 10);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(net.get(id).unwrap().status, MessageStatus::Success);

        // A resolved message is never delivered twice.
        assert!(matches!(net.begin_delivery(id, |_| true), Delivery::Skipped));
    }

    #[test]
    fn test_failed_target() {
        let mut net = Network::new();
        let id = net.send(n("a"), n("b"), Ping::Ping, 0);
        assert!(matches!(net.begin_delivery(id, |_| false), Delivery::Failed));
        assert_eq!(net.get(id).unwrap().status, MessageStatus::Failure);
        assert_eq!(net.status_counts().failed, 1);
    }

    #[test]
    fn test_unknown_id() {
        let mut net: Network<Ping> = Network::new();
        assert!(matches!(net.begin_delivery(MessageId(0), |_| true), Delivery::Skipped));
        assert!(matches!(net.begin_delivery(MessageId(7), |_| true), Delivery::Skipped));
    }

    #[test]
    fn test_auto_delivery_schedule() {
        let mut net = Network::new().with_auto_delivery(Some(100));
        let a = net.send(n("a"), n("b"), Ping::Ping, 0);
        let b = net.send(n("a"), n("c"), Ping::Ping, 50);
        assert_eq!(net.scheduler().len(), 2);
        assert_eq!(net.scheduler().next_due(), Some(100));

        assert_eq!(net.scheduler_mut().take_due(99), vec![]);
        assert_eq!(net.scheduler_mut().take_due(120), vec![a]);
        assert_eq!(net.scheduler_mut().take_due(200), vec![b]);
        assert!(net.scheduler().is_empty());
    }

    #[test]
    fn test_cancel_and_clear() {
        let mut net = Network::new();
        let (_, handle) = net.send_delayed(n("a"), n("b"), Ping::Ping, 0, 500);
        assert!(net.auto_delivery_delay().is_none());
        assert!(net.scheduler_mut().cancel(handle));
        assert!(!net.scheduler_mut().cancel(handle));

        net.send_delayed(n("a"), n("b"), Ping::Ping, 0, 500);
        net.clear();
        assert!(net.scheduler().is_empty());
        assert!(net.messages().is_empty());
        assert_eq!(net.scheduler_mut().take_due(10_000), vec![]);
    }
}
