//! Protolab Simulation Engine
//!
//! The substrate every protocol engine is built on: a simulated network, an
//! audit log and a clock bundled into a context, and the `Simulation` trait
//! that gives every engine the same delivery, settling and reset surface.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::{SharedClock, SystemClock};
use crate::event::{Event, EventLog};
use crate::message::{Delivery, Message, MessageCounts, MessageId, Network, Payload, TaskHandle};
use crate::node::NodeId;
use protolab_common::config::DeliveryConfig;
use serde::Serialize;
use serde_json::Value;

// =============================================================================
// Simulation Context
// =============================================================================

/// Network, audit log and clock owned by one engine.
#[derive(Debug, Clone)]
pub struct SimContext<P> {
    pub network: Network<P>,
    pub events: EventLog,
    clock: SharedClock,
    delivery: DeliveryConfig,
}

impl<P: Payload> Default for SimContext<P> {
    fn default() -> Self {
        Self::new(DeliveryConfig::default())
    }
}

impl<P: Payload> SimContext<P> {
    pub fn new(delivery: DeliveryConfig) -> Self {
        Self {
            network: Network::new().with_auto_delivery(delivery.auto_delivery_delay_ms),
            events: EventLog::new(),
            clock: SystemClock::shared(),
            delivery,
        }
    }

    pub fn set_clock(&mut self, clock: SharedClock) {
        self.clock = clock;
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Replace the delivery settings; already scheduled deliveries stay.
    pub fn set_delivery(&mut self, delivery: DeliveryConfig) {
        self.network.set_auto_delivery(delivery.auto_delivery_delay_ms);
        self.delivery = delivery;
    }

    pub fn max_passes(&self) -> usize {
        self.delivery.max_passes
    }

    /// Send a message stamped with the current time.
    pub fn send(&mut self, from: &NodeId, to: &NodeId, payload: P) -> MessageId {
        let now = self.now();
        self.network.send(from.clone(), to.clone(), payload, now)
    }

    /// Send a message delivered `delay` milliseconds from now by `tick`.
    pub fn send_later(
        &mut self,
        from: &NodeId,
        to: &NodeId,
        payload: P,
        delay: u64,
    ) -> (MessageId, TaskHandle) {
        let now = self.now();
        self.network.send_delayed(from.clone(), to.clone(), payload, now, delay)
    }

    /// Send one copy of `payload` to each target.
    pub fn broadcast<'a>(
        &mut self,
        from: &NodeId,
        targets: impl IntoIterator<Item = &'a NodeId>,
        payload: P,
    ) -> Vec<MessageId> {
        targets
            .into_iter()
            .map(|to| self.send(from, to, payload.clone()))
            .collect()
    }

    pub fn log(&mut self, kind: &str, description: impl Into<String>, data: Value) {
        let now = self.now();
        self.events.record(now, kind, description, data);
    }

    pub fn begin_delivery(
        &mut self,
        id: MessageId,
        target_up: impl FnOnce(&NodeId) -> bool,
    ) -> Delivery<P> {
        self.network.begin_delivery(id, target_up)
    }

    /// Drop messages, scheduled deliveries and events.
    pub fn clear(&mut self) {
        self.network.clear();
        self.events.clear();
    }
}

// =============================================================================
// Simulation Trait
// =============================================================================

/// Common surface of every message-driven engine.
pub trait Simulation {
    type Payload: Payload;
    type Stats: Serialize;

    fn context(&self) -> &SimContext<Self::Payload>;

    fn context_mut(&mut self) -> &mut SimContext<Self::Payload>;

    /// Resolve one message and run the protocol handler for it.
    fn deliver(&mut self, id: MessageId);

    fn stats(&self) -> Self::Stats;

    /// Restore the constructor configuration.
    fn reset(&mut self);

    fn network(&self) -> &Network<Self::Payload> {
        &self.context().network
    }

    fn messages(&self) -> &[Message<Self::Payload>] {
        self.context().network.messages()
    }

    fn events(&self) -> &[Event] {
        self.context().events.events()
    }

    fn in_flight(&self) -> Vec<MessageId> {
        self.context().network.in_flight()
    }

    fn message_counts(&self) -> MessageCounts {
        self.context().network.status_counts()
    }

    /// Deliver every in-flight message, including ones sent by handlers,
    /// until the network is quiet. Returns the number of messages resolved.
    fn deliver_all(&mut self) -> usize {
        let max_passes = self.context().max_passes();
        let mut resolved = 0;
        for _ in 0..max_passes {
            let pending = self.in_flight();
            if pending.is_empty() {
                return resolved;
            }
            for id in pending {
                self.deliver(id);
                resolved += 1;
            }
        }
        tracing::warn!(max_passes, "network did not settle");
        resolved
    }

    /// Run every scheduled delivery due at or before `now`.
    fn tick(&mut self, now: u64) -> usize {
        let due = self.context_mut().network.scheduler_mut().take_due(now);
        let count = due.len();
        for id in due {
            self.deliver(id);
        }
        count
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize)]
    enum Relay {
        Hop(u32),
    }

    impl Payload for Relay {
        fn kind(&self) -> &'static str {
            "Hop"
        }
    }

    /// Forwards each hop to the next node until the counter runs out.
    struct Chain {
        ctx: SimContext<Relay>,
        nodes: Vec<NodeId>,
        down: Option<NodeId>,
        handled: u32,
    }

    impl Simulation for Chain {
        type Payload = Relay;
        type Stats = u32;

        fn context(&self) -> &SimContext<Relay> {
            &self.ctx
        }

        fn context_mut(&mut self) -> &mut SimContext<Relay> {
            &mut self.ctx
        }

        fn deliver(&mut self, id: MessageId) {
            let down = self.down.clone();
            let msg = match self.ctx.begin_delivery(id, |to| Some(to) != down.as_ref()) {
                Delivery::Delivered(m) => m,
                _ => return,
            };
            self.handled += 1;
            let Relay::Hop(left) = msg.payload;
            if left > 0 {
                let pos = self.nodes.iter().position(|n| *n == msg.to).unwrap_or(0);
                let next = self.nodes[(pos + 1) % self.nodes.len()].clone();
                self.ctx.send(&msg.to, &next, Relay::Hop(left - 1));
            }
            self.ctx.log("hop", format!("{} handled hop", msg.to), json!({ "left": left }));
        }

        fn stats(&self) -> u32 {
            self.handled
        }

        fn reset(&mut self) {
            self.ctx.clear();
            self.handled = 0;
        }
    }

    fn chain(delivery: DeliveryConfig, clock: &ManualClock) -> Chain {
        let mut ctx = SimContext::new(delivery);
        ctx.set_clock(clock.shared());
        Chain {
            ctx,
            nodes: vec![NodeId::new("a"), NodeId::new("b"), NodeId::new("c")],
            down: None,
            handled: 0,
        }
    }

    #[test]
    fn test_deliver_all_follows_chain() {
        let clock = ManualClock::new(0);
        let mut sim = chain(DeliveryConfig::default(), &clock);
        sim.ctx.send(&NodeId::new("a"), &NodeId::new("b"), Relay::Hop(4));

        assert_eq!(sim.deliver_all(), 5);
        assert_eq!(sim.stats(), 5);
        assert!(sim.in_flight().is_empty());
        assert_eq!(sim.events().len(), 5);
    }

    #[test]
    fn test_deliver_all_respects_pass_limit() {
        let clock = ManualClock::new(0);
        let delivery = DeliveryConfig {
            max_passes: 2,
            ..Default::default()
        };
        let mut sim = chain(delivery, &clock);
        sim.ctx.send(&NodeId::new("a"), &NodeId::new("b"), Relay::Hop(10));
        assert_eq!(sim.deliver_all(), 2);
        assert_eq!(sim.in_flight().len(), 1);
    }

    #[test]
    fn test_failed_target_has_no_side_effects() {
        let clock = ManualClock::new(0);
        let mut sim = chain(DeliveryConfig::default(), &clock);
        sim.down = Some(NodeId::new("b"));
        let id = sim.ctx.send(&NodeId::new("a"), &NodeId::new("b"), Relay::Hop(3));
        sim.deliver(id);
        assert_eq!(sim.stats(), 0);
        assert_eq!(sim.message_counts().failed, 1);
        assert!(sim.events().is_empty());
    }

    #[test]
    fn test_tick_runs_due_deliveries() {
        let clock = ManualClock::new(1000);
        let delivery = DeliveryConfig {
            auto_delivery_delay_ms: Some(200),
            ..Default::default()
        };
        let mut sim = chain(delivery, &clock);
        sim.ctx.send(&NodeId::new("a"), &NodeId::new("b"), Relay::Hop(1));

        assert_eq!(sim.tick(clock.now_millis()), 0);
        clock.advance(200);
        assert_eq!(sim.tick(clock.now_millis()), 1);
        // The forwarded hop was scheduled relative to the delivery time.
        assert_eq!(sim.tick(clock.now_millis()), 0);
        clock.advance(200);
        assert_eq!(sim.tick(clock.now_millis()), 1);
        assert_eq!(sim.stats(), 2);
    }

    #[test]
    fn test_reset_drops_scheduled_work() {
        let clock = ManualClock::new(0);
        let delivery = DeliveryConfig {
            auto_delivery_delay_ms: Some(10),
            ..Default::default()
        };
        let mut sim = chain(delivery, &clock);
        sim.ctx.send(&NodeId::new("a"), &NodeId::new("b"), Relay::Hop(1));
        sim.reset();
        clock.advance(100);
        assert_eq!(sim.tick(clock.now_millis()), 0);
        assert!(sim.messages().is_empty());
    }
}
