//! Protolab Lease Locks
//!
//! A single lock manager handing out time-bounded leases with fencing
//! tokens. Holders keep a lease alive with heartbeats; waiting clients queue
//! in FIFO order. Leases only expire when `check_timeouts` runs.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::SharedClock;
use crate::engine::{SimContext, Simulation};
use crate::message::{Delivery, MessageCounts, MessageId, Payload};
use crate::node::{node_ids, NodeId, NodeStatus};
use crate::topology::{SimNode, Topology};
use protolab_common::config::{DeliveryConfig, LeaseConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;

/// Identifier of the lock manager.
pub const MANAGER_ID: &str = "M";

// =============================================================================
// Lease Types
// =============================================================================

/// Monotonic token issued with every grant.
pub type FencingToken = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: NodeId,
    pub token: FencingToken,
    pub granted_at: u64,
    pub expires_at: u64,
}

impl Lease {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Manager's answer to a lock request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockResponse {
    Granted { token: FencingToken, expires_at: u64 },
    /// One-based position in the wait queue.
    Queued { position: usize },
    AlreadyHeld { token: FencingToken },
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaseClient {
    pub id: NodeId,
    pub status: NodeStatus,
    /// Token of the lease this client believes it holds.
    pub token: Option<FencingToken>,
    pub queue_position: Option<usize>,
}

impl SimNode for LeaseClient {
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

/// Every message the lock manager sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LeaseMessage {
    Granted { token: FencingToken, expires_at: u64 },
    Queued { position: usize },
    Expired { token: FencingToken },
}

impl Payload for LeaseMessage {
    fn kind(&self) -> &'static str {
        match self {
            LeaseMessage::Granted { .. } => "Granted",
            LeaseMessage::Queued { .. } => "Queued",
            LeaseMessage::Expired { .. } => "Expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseStats {
    pub clients: usize,
    pub holder: Option<NodeId>,
    pub token: Option<FencingToken>,
    pub queue: Vec<NodeId>,
    pub grants: usize,
    pub expirations: usize,
    pub fenced_writes_rejected: usize,
    pub messages: MessageCounts,
}

// =============================================================================
// Lease Manager
// =============================================================================

#[derive(Debug, Clone)]
pub struct LeaseManager {
    config: LeaseConfig,
    manager: NodeId,
    nodes: Topology<LeaseClient>,
    lease: Option<Lease>,
    queue: VecDeque<NodeId>,
    next_token: FencingToken,
    /// Highest token the protected resource has accepted.
    highest_seen: FencingToken,
    ctx: SimContext<LeaseMessage>,
}

impl LeaseManager {
    pub fn new(config: LeaseConfig) -> Self {
        Self {
            nodes: Self::build_nodes(&config),
            config,
            manager: NodeId::new(MANAGER_ID),
            lease: None,
            queue: VecDeque::new(),
            next_token: 1,
            highest_seen: 0,
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

    fn build_nodes(config: &LeaseConfig) -> Topology<LeaseClient> {
        Topology::new(
            node_ids("C", config.clients)
                .into_iter()
                .map(|id| LeaseClient {
                    id,
                    status: NodeStatus::Healthy,
                    token: None,
                    queue_position: None,
                })
                .collect(),
        )
    }

    pub fn clients(&self) -> &[LeaseClient] {
        self.nodes.as_slice()
    }

    pub fn client(&self, id: &NodeId) -> Option<&LeaseClient> {
        self.nodes.get(id)
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    pub fn queue(&self) -> Vec<NodeId> {
        self.queue.iter().cloned().collect()
    }

    pub fn holder(&self) -> Option<&NodeId> {
        self.lease.as_ref().map(|l| &l.holder)
    }

    fn grant(&mut self, client: &NodeId) -> (FencingToken, u64) {
        let now = self.ctx.now();
        let token = self.next_token;
        self.next_token += 1;
        let expires_at = now + self.config.ttl_ms;
        self.lease = Some(Lease {
            holder: client.clone(),
            token,
            granted_at: now,
            expires_at,
        });
        tracing::info!(client = %client, token, expires_at, "lease granted");
        self.ctx.log(
            "lease_granted",
            format!("{} holds the lock with token {} until {}", client, token, expires_at),
            json!({ "client": client, "token": token, "expires_at": expires_at }),
        );
        let manager = self.manager.clone();
        self.ctx.send(&manager, client, LeaseMessage::Granted { token, expires_at });
        (token, expires_at)
    }

    /// Grant to the first healthy queued client, dropping failed ones.
    fn grant_next(&mut self) -> Option<NodeId> {
        while let Some(next) = self.queue.pop_front() {
            if self.nodes.is_healthy(&next) {
                self.grant(&next);
                self.renumber_queue();
                return Some(next);
            }
            self.ctx.log(
                "queue_skipped",
                format!("{} left the queue while down", next),
                json!({ "client": next }),
            );
        }
        self.renumber_queue();
        None
    }

    fn renumber_queue(&mut self) {
        for client in self.nodes.iter_mut() {
            client.queue_position = self.queue.iter().position(|q| q == &client.id).map(|p| p + 1);
        }
    }

    pub fn request_lock(&mut self, client: &NodeId) -> LockResponse {
        if !self.nodes.is_healthy(client) {
            self.ctx.log(
                "request_failed",
                format!("{} cannot request the lock", client),
                json!({ "client": client }),
            );
            return LockResponse::Rejected;
        }
        let now = self.ctx.now();
        if self.lease.as_ref().map(|l| l.is_expired(now)).unwrap_or(false) {
            self.check_timeouts();
        }

        let current = self.lease.as_ref().map(|l| (l.holder.clone(), l.token));
        match current {
            None => {
                self.queue.retain(|q| q != client);
                let (token, expires_at) = self.grant(client);
                self.renumber_queue();
                LockResponse::Granted { token, expires_at }
            }
            Some((holder, token)) if &holder == client => LockResponse::AlreadyHeld { token },
            Some(_) => {
                let position = match self.queue.iter().position(|q| q == client) {
                    Some(index) => index + 1,
                    None => {
                        self.queue.push_back(client.clone());
                        self.queue.len()
                    }
                };
                self.renumber_queue();
                self.ctx.log(
                    "lock_queued",
                    format!("{} waits at position {}", client, position),
                    json!({ "client": client, "position": position }),
                );
                let manager = self.manager.clone();
                self.ctx.send(&manager, client, LeaseMessage::Queued { position });
                LockResponse::Queued { position }
            }
        }
    }

    /// Extend the holder's lease to now + TTL.
    pub fn heartbeat(&mut self, client: &NodeId) -> Option<u64> {
        let now = self.ctx.now();
        let healthy = self.nodes.is_healthy(client);
        let ttl = self.config.ttl_ms;
        let Some(lease) = self.lease.as_mut().filter(|l| healthy && &l.holder == client) else {
            self.ctx.log(
                "heartbeat_failed",
                format!("{} does not hold the lock", client),
                json!({ "client": client }),
            );
            return None;
        };
        lease.expires_at = now + ttl;
        let expires_at = lease.expires_at;
        self.ctx.log(
            "heartbeat",
            format!("{} extends its lease to {}", client, expires_at),
            json!({ "client": client, "expires_at": expires_at }),
        );
        Some(expires_at)
    }

    pub fn release_lock(&mut self, client: &NodeId) -> bool {
        if self.holder() == Some(client) {
            self.lease = None;
            if let Some(node) = self.nodes.get_mut(client) {
                node.token = None;
            }
            self.ctx.log("lock_released", format!("{} releases the lock", client), json!({ "client": client }));
            self.grant_next();
            return true;
        }
        if self.queue.contains(client) {
            self.queue.retain(|q| q != client);
            self.renumber_queue();
            self.ctx.log("request_withdrawn", format!("{} leaves the queue", client), json!({ "client": client }));
            return true;
        }
        self.ctx.log(
            "release_failed",
            format!("{} holds nothing to release", client),
            json!({ "client": client }),
        );
        false
    }

    /// Expire the current lease if its time is up. Returns the expired holder.
    pub fn check_timeouts(&mut self) -> Option<NodeId> {
        let now = self.ctx.now();
        if !self.lease.as_ref().map(|l| l.is_expired(now)).unwrap_or(false) {
            return None;
        }
        let lease = self.lease.take()?;
        tracing::info!(client = %lease.holder, token = lease.token, "lease expired");
        self.ctx.log(
            "lease_expired",
            format!("{}'s lease (token {}) expired", lease.holder, lease.token),
            json!({ "client": lease.holder, "token": lease.token, "expired_at": lease.expires_at }),
        );
        let manager = self.manager.clone();
        self.ctx.send(&manager, &lease.holder, LeaseMessage::Expired { token: lease.token });
        self.grant_next();
        Some(lease.holder)
    }

    /// Write to the protected resource. Tokens older than the highest one
    /// already seen are rejected.
    pub fn fenced_write(&mut self, client: &NodeId, token: FencingToken) -> bool {
        let highest = self.highest_seen;
        if token < highest || token == 0 {
            self.ctx.log(
                "fenced_write_rejected",
                format!("{} used stale token {}", client, token),
                json!({ "client": client, "token": token, "highest": highest }),
            );
            return false;
        }
        self.highest_seen = token;
        self.ctx.log(
            "fenced_write",
            format!("{} writes with token {}", client, token),
            json!({ "client": client, "token": token }),
        );
        true
    }

    pub fn fail_client(&mut self, id: &NodeId) -> bool {
        if !self.nodes.set_status(id, NodeStatus::Failed) {
            return false;
        }
        self.ctx.log("node_failed", format!("{} fails", id), json!({ "node": id }));
        true
    }

    pub fn recover_client(&mut self, id: &NodeId) -> bool {
        if !self.nodes.set_status(id, NodeStatus::Healthy) {
            return false;
        }
        self.ctx.log("node_recovered", format!("{} recovers", id), json!({ "node": id }));
        true
    }
}

impl Simulation for LeaseManager {
    type Payload = LeaseMessage;
    type Stats = LeaseStats;

    fn context(&self) -> &SimContext<LeaseMessage> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SimContext<LeaseMessage> {
        &mut self.ctx
    }

    fn deliver(&mut self, id: MessageId) {
        let nodes = &self.nodes;
        let message = match self.ctx.begin_delivery(id, |to| nodes.is_healthy(to)) {
            Delivery::Delivered(message) => message,
            Delivery::Failed | Delivery::Skipped => return,
        };
        let Some(client) = self.nodes.get_mut(&message.to) else {
            return;
        };
        match message.payload {
            LeaseMessage::Granted { token, .. } => client.token = Some(token),
            LeaseMessage::Queued { .. } => {}
            LeaseMessage::Expired { token } => {
                if client.token == Some(token) {
                    client.token = None;
                }
            }
        }
    }

    fn stats(&self) -> LeaseStats {
        LeaseStats {
            clients: self.nodes.len(),
            holder: self.holder().cloned(),
            token: self.lease.as_ref().map(|l| l.token),
            queue: self.queue(),
            grants: self.ctx.events.count_of("lease_granted"),
            expirations: self.ctx.events.count_of("lease_expired"),
            fenced_writes_rejected: self.ctx.events.count_of("fenced_write_rejected"),
            messages: self.ctx.network.status_counts(),
        }
    }

    fn reset(&mut self) {
        self.nodes = Self::build_nodes(&self.config);
        self.lease = None;
        self.queue.clear();
        self.next_token = 1;
        self.highest_seen = 0;
        self.ctx.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    fn manager(clock: &ManualClock) -> LeaseManager {
        LeaseManager::new(LeaseConfig::default()).with_clock(clock.shared())
    }

    #[test]
    fn test_grant_then_queue() {
        let clock = ManualClock::new(0);
        let mut sim = manager(&clock);
        assert_eq!(
            sim.request_lock(&id("C0")),
            LockResponse::Granted {
                token: 1,
                expires_at: 4000
            }
        );
        assert_eq!(sim.request_lock(&id("C1")), LockResponse::Queued { position: 1 });
        assert_eq!(sim.request_lock(&id("C2")), LockResponse::Queued { position: 2 });
        assert_eq!(sim.request_lock(&id("C1")), LockResponse::Queued { position: 1 });
        assert_eq!(sim.request_lock(&id("C0")), LockResponse::AlreadyHeld { token: 1 });
        sim.deliver_all();
        assert_eq!(sim.client(&id("C0")).unwrap().token, Some(1));
        assert_eq!(sim.client(&id("C2")).unwrap().queue_position, Some(2));
    }

    #[test]
    fn test_expiry_only_on_check() {
        let clock = ManualClock::new(0);
        let mut sim = manager(&clock);
        sim.request_lock(&id("C0"));
        sim.request_lock(&id("C1"));

        clock.set(5000);
        assert_eq!(sim.holder(), Some(&id("C0")));
        assert_eq!(sim.check_timeouts(), Some(id("C0")));
        assert_eq!(sim.holder(), Some(&id("C1")));
        assert_eq!(sim.lease().unwrap().token, 2);
        assert_eq!(sim.lease().unwrap().expires_at, 9000);
        assert!(sim.check_timeouts().is_none());

        sim.deliver_all();
        assert_eq!(sim.client(&id("C0")).unwrap().token, None);
        assert_eq!(sim.client(&id("C1")).unwrap().token, Some(2));
    }

    #[test]
    fn test_heartbeat_extends() {
        let clock = ManualClock::new(0);
        let mut sim = manager(&clock);
        sim.request_lock(&id("C0"));
        clock.set(3000);
        assert_eq!(sim.heartbeat(&id("C0")), Some(7000));
        assert_eq!(sim.heartbeat(&id("C1")), None);
        clock.set(5000);
        assert!(sim.check_timeouts().is_none());
    }

    #[test]
    fn test_release_hands_over_and_skips_failed() {
        let clock = ManualClock::new(0);
        let mut sim = manager(&clock);
        sim.request_lock(&id("C0"));
        sim.request_lock(&id("C1"));
        sim.request_lock(&id("C2"));
        sim.fail_client(&id("C1"));

        assert!(sim.release_lock(&id("C0")));
        assert_eq!(sim.holder(), Some(&id("C2")));
        assert!(sim.queue().is_empty());
        assert!(!sim.release_lock(&id("C0")));
    }

    #[test]
    fn test_request_on_expired_lease_serves_queue_first() {
        let clock = ManualClock::new(0);
        let mut sim = manager(&clock);
        sim.request_lock(&id("C0"));
        sim.request_lock(&id("C1"));
        clock.set(4000);
        assert_eq!(sim.request_lock(&id("C2")), LockResponse::Queued { position: 1 });
        assert_eq!(sim.holder(), Some(&id("C1")));
    }

    #[test]
    fn test_fencing_rejects_stale_token() {
        let clock = ManualClock::new(0);
        let mut sim = manager(&clock);
        sim.request_lock(&id("C0"));
        clock.set(4000);
        sim.check_timeouts();
        let LockResponse::Granted { token, .. } = sim.request_lock(&id("C1")) else {
            panic!("expected a grant");
        };
        assert!(sim.fenced_write(&id("C1"), token));
        // C0 wakes up believing it still holds token 1.
        assert!(!sim.fenced_write(&id("C0"), 1));
        assert_eq!(sim.stats().fenced_writes_rejected, 1);
    }
}
