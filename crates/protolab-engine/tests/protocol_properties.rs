//! Property tests for the protocol engines
//!
//! Randomized operation sequences driven by seeded generators, checking the
//! safety properties each protocol promises.

use protolab_common::config::{
    CausalityConfig, EventualConfig, HashRingConfig, PaxosConfig, RaftConfig, SagaConfig,
};
use protolab_common::ConsistencyLevel;
use protolab_engine::crdt::{CounterOp, SetOp};
use protolab_engine::{
    CrdtCluster, EventualStore, HashRing, ManualClock, NodeId, ORSet, PNCounter, PaxosSimulation,
    RaftSimulation, Saga, SagaStatus, Simulation, SnapshotSimulation, StepStatus, TotalOrderBroadcast,
    VectorClock, VectorClockOrdering,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;

fn id(s: &str) -> NodeId {
    NodeId::new(s)
}

/// Deliver one randomly chosen in-flight message, if any.
fn deliver_random<S: Simulation>(sim: &mut S, rng: &mut StdRng) -> bool {
    let pending = sim.in_flight();
    match pending.choose(rng) {
        Some(&message) => {
            sim.deliver(message);
            true
        }
        None => false,
    }
}

// =============================================================================
// Consensus
// =============================================================================

#[test]
fn test_paxos_never_decides_two_values() {
    for seed in 0..25 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sim = PaxosSimulation::new(PaxosConfig {
            proposers: 2,
            acceptors: 3,
            learners: 2,
        });
        let acceptors = ["A0", "A1", "A2"];
        let mut decided: Option<String> = None;

        for step in 0..300 {
            match rng.gen_range(0..12) {
                0 | 1 => {
                    let proposer = if rng.gen_bool(0.5) { "P0" } else { "P1" };
                    sim.start_proposal(&id(proposer), format!("value-{}-{}", seed, step));
                }
                2 => {
                    let target = acceptors[rng.gen_range(0..acceptors.len())];
                    sim.fail_node(&id(target));
                }
                3 => {
                    let target = acceptors[rng.gen_range(0..acceptors.len())];
                    sim.recover_node(&id(target));
                }
                _ => {
                    deliver_random(&mut sim, &mut rng);
                }
            }
            sim.check_for_decision();

            if let Some(value) = sim.decided_value() {
                match &decided {
                    Some(previous) => assert_eq!(previous, value, "seed {} changed its decision", seed),
                    None => decided = Some(value.to_string()),
                }
            }

            let learned: BTreeSet<String> = sim
                .learners()
                .iter()
                .filter_map(|l| l.as_learner().and_then(|s| s.learned.clone()))
                .collect();
            assert!(learned.len() <= 1, "seed {}: learners disagree: {:?}", seed, learned);
        }
    }
}

#[test]
fn test_raft_at_most_one_leader_per_term() {
    for seed in 0..25 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sim = RaftSimulation::new(RaftConfig { node_count: 5 });
        let nodes: Vec<NodeId> = sim.nodes().iter().map(|n| n.id.clone()).collect();

        for step in 0..300 {
            let node = nodes[rng.gen_range(0..nodes.len())].clone();
            match rng.gen_range(0..14) {
                0 | 1 => {
                    sim.start_election(&node);
                }
                2 => {
                    sim.fail_node(&node);
                }
                3 => {
                    sim.recover_node(&node);
                }
                4 => {
                    sim.client_request(format!("cmd-{}", step));
                }
                5 => {
                    sim.heartbeat();
                }
                _ => {
                    deliver_random(&mut sim, &mut rng);
                }
            }
        }

        for (term, leaders) in sim.leaders_by_term() {
            let distinct: BTreeSet<NodeId> = leaders.into_iter().collect();
            assert!(distinct.len() <= 1, "seed {}: term {} had leaders {:?}", seed, term, distinct);
        }
    }
}

// =============================================================================
// Commitment
// =============================================================================

#[test]
fn test_saga_steps_follow_their_own_transitions() {
    for seed in 0..20 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut saga = Saga::new(SagaConfig::default());
        let mut model = vec![StepStatus::Pending; saga.steps().len()];

        for _ in 0..30 {
            let index = rng.gen_range(0..model.len() + 1);
            let current = model.get(index).copied();
            let (accepted, next) = match rng.gen_range(0..3) {
                0 => (saga.complete_step(index), StepStatus::Completed),
                1 => (saga.fail_step(index), StepStatus::Failed),
                _ => (saga.compensate_step(index), StepStatus::Compensated),
            };
            let allowed = match (current, next) {
                (Some(StepStatus::Pending), StepStatus::Completed | StepStatus::Failed) => true,
                (Some(StepStatus::Completed), StepStatus::Compensated) => true,
                _ => false,
            };
            assert_eq!(accepted, allowed, "seed {}: {:?} -> {:?} on step {}", seed, current, next, index);
            if allowed {
                model[index] = next;
            }

            let statuses: Vec<StepStatus> = saga.steps().iter().map(|s| s.status).collect();
            assert_eq!(statuses, model, "seed {}", seed);
            let completed: Vec<usize> = (0..model.len()).rev().filter(|&i| model[i] == StepStatus::Completed).collect();
            assert_eq!(saga.compensation_plan(), completed);
            assert_eq!(
                saga.status() == SagaStatus::Completed,
                model.iter().all(|s| *s == StepStatus::Completed)
            );
        }
    }
}

// =============================================================================
// Replication
// =============================================================================

#[test]
fn test_crdts_converge_in_either_sync_order() {
    for seed in 0..20 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sets: CrdtCluster<ORSet<u32>> = CrdtCluster::new(3);
        let mut counters: CrdtCluster<PNCounter> = CrdtCluster::new(3);
        let replicas = sets.replica_ids();

        for _ in 0..40 {
            let replica = &replicas[rng.gen_range(0..replicas.len())];
            let element = rng.gen_range(0..6);
            let op = if rng.gen_bool(0.7) {
                SetOp::Add(element)
            } else {
                SetOp::Remove(element)
            };
            sets.mutate_replica(replica, op);

            let amount = rng.gen_range(1..5);
            let op = if rng.gen_bool(0.6) {
                CounterOp::Increment(amount)
            } else {
                CounterOp::Decrement(amount)
            };
            counters.mutate_replica(replica, op);
        }

        let (r0, r1, r2) = (&replicas[0], &replicas[1], &replicas[2]);

        let mut forward = sets.clone();
        forward.sync(r0, r1);
        forward.sync(r1, r2);
        forward.sync(r0, r1);
        let mut backward = sets.clone();
        backward.sync(r2, r1);
        backward.sync(r1, r0);
        backward.sync(r2, r1);
        assert!(forward.is_converged());
        assert!(backward.is_converged());
        assert_eq!(forward.values(), backward.values(), "seed {}", seed);

        let mut forward = counters.clone();
        forward.sync_all();
        let mut backward = counters.clone();
        backward.sync(r2, r0);
        backward.sync(r1, r0);
        backward.sync(r2, r0);
        backward.sync(r1, r2);
        assert!(forward.is_converged());
        assert!(backward.is_converged());
        assert_eq!(forward.values(), backward.values(), "seed {}", seed);
    }
}

#[test]
fn test_failed_eventual_writes_leave_replicas_untouched() {
    let levels = [ConsistencyLevel::One, ConsistencyLevel::Quorum, ConsistencyLevel::All];
    let mut failures = 0;
    for seed in 0..20 {
        let mut rng = StdRng::seed_from_u64(seed);
        let clock = ManualClock::new(0);
        let mut sim = EventualStore::new(EventualConfig {
            node_count: 5,
            background_delay_ms: 100,
        })
        .with_clock(clock.shared());
        let nodes: Vec<NodeId> = sim.nodes().iter().map(|n| n.id.clone()).collect();

        for step in 0..60 {
            let node = nodes[rng.gen_range(0..nodes.len())].clone();
            match rng.gen_range(0..6) {
                0 => {
                    sim.fail_node(&node);
                }
                1 => {
                    sim.recover_node(&node);
                }
                2 => {
                    let now = clock.advance(rng.gen_range(0..200));
                    sim.tick(now);
                }
                _ => {
                    let level = levels[rng.gen_range(0..levels.len())];
                    let healthy = sim.nodes().iter().filter(|n| n.status.is_available()).count();
                    let coordinator_up = sim.node(&node).map(|n| n.status.is_available()).unwrap_or(false);
                    let stores: Vec<_> = sim.nodes().iter().map(|n| n.store.clone()).collect();
                    let pending = sim.stats().pending_background;

                    let write = sim.write(&node, "k", &format!("v{}", step), level);
                    assert_eq!(
                        write.success,
                        coordinator_up && healthy >= level.replica_count(nodes.len()),
                        "seed {} step {}",
                        seed,
                        step
                    );
                    if !write.success {
                        failures += 1;
                        let after: Vec<_> = sim.nodes().iter().map(|n| n.store.clone()).collect();
                        assert_eq!(after, stores, "seed {} step {}", seed, step);
                        assert_eq!(sim.stats().pending_background, pending);
                        assert!(write.synchronous.is_empty() && write.background.is_empty());
                    }
                }
            }
        }
    }
    assert!(failures > 0);
}

// =============================================================================
// Causality
// =============================================================================

#[test]
fn test_total_order_broadcast_under_shuffled_delivery() {
    for seed in 0..30 {
        let mut rng = StdRng::seed_from_u64(seed);
        let processes = rng.gen_range(2..5);
        let mut sim = TotalOrderBroadcast::new(CausalityConfig {
            process_count: processes,
        });
        let ids: Vec<NodeId> = (0..processes).map(|i| NodeId::indexed("P", i)).collect();
        let mut sent = 0;

        for step in 0..80 {
            match rng.gen_range(0..5) {
                0 if sent < 10 => {
                    let sender = &ids[rng.gen_range(0..ids.len())];
                    assert!(sim.broadcast(sender, &format!("m{}", step)).is_some());
                    sent += 1;
                }
                1 => {
                    sim.local_event(&ids[rng.gen_range(0..ids.len())]);
                }
                _ => {
                    deliver_random(&mut sim, &mut rng);
                }
            }
            assert!(sim.is_order_consistent(), "seed {} step {}", seed, step);
        }
        sim.deliver_all();

        let reference = sim.delivery_order(&ids[0]);
        assert_eq!(reference.len(), sent, "seed {}", seed);
        for id in &ids {
            assert_eq!(sim.delivery_order(id), reference, "seed {}: {} diverged", seed, id);
            let keys: Vec<_> = sim.node(id).unwrap().delivered.iter().map(|d| d.key.clone()).collect();
            assert!(keys.windows(2).all(|w| w[0] < w[1]), "seed {}", seed);
        }
    }
}

fn random_clock(rng: &mut StdRng) -> VectorClock {
    let mut clock = VectorClock::new();
    for node in ["A", "B", "C"] {
        for _ in 0..rng.gen_range(0..3) {
            clock.increment(&id(node));
        }
    }
    clock
}

#[test]
fn test_vector_clock_ordering_is_exclusive_and_transitive() {
    let mut rng = StdRng::seed_from_u64(7);
    let clocks: Vec<VectorClock> = (0..40).map(|_| random_clock(&mut rng)).collect();

    for a in &clocks {
        for b in &clocks {
            let flags = [
                a.happened_before(b),
                a.happened_after(b),
                a.is_concurrent(b),
                a.compare(b) == VectorClockOrdering::Equal,
            ];
            assert_eq!(flags.iter().filter(|f| **f).count(), 1, "{:?} vs {:?}", a, b);

            let mirrored = match a.compare(b) {
                VectorClockOrdering::Before => VectorClockOrdering::After,
                VectorClockOrdering::After => VectorClockOrdering::Before,
                other => other,
            };
            assert_eq!(b.compare(a), mirrored);

            for c in &clocks {
                if a.happened_before(b) && b.happened_before(c) {
                    assert!(a.happened_before(c));
                }
            }
        }
    }
}

#[test]
fn test_snapshots_complete_and_balance_channels() {
    for seed in 0..20 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sim = SnapshotSimulation::new(CausalityConfig { process_count: 3 });
        let processes = [id("P0"), id("P1"), id("P2")];
        let mut snapshot = None;

        for step in 0..60 {
            if step == 20 {
                let initiator = &processes[rng.gen_range(0..processes.len())];
                snapshot = sim.initiate_snapshot(initiator);
            }
            match rng.gen_range(0..4) {
                0 => {
                    let from = &processes[rng.gen_range(0..3)];
                    let to = &processes[rng.gen_range(0..3)];
                    if from != to {
                        sim.send_app_message(from, to);
                    }
                }
                1 => {
                    sim.local_event(&processes[rng.gen_range(0..3)]);
                }
                _ => {
                    deliver_random(&mut sim, &mut rng);
                }
            }
        }
        sim.deliver_all();

        let snapshot = snapshot.expect("initiator is healthy");
        let global = sim
            .global_snapshot(snapshot)
            .unwrap_or_else(|| panic!("seed {}: snapshot did not complete", seed));
        assert_eq!(global.states.len(), 3);
        assert!(global.is_consistent(), "seed {}: {:?}", seed, global);
    }
}

// =============================================================================
// Partitioning
// =============================================================================

#[test]
fn test_consistent_hashing_moves_minimal_keys() {
    for seed in 0..10 {
        let mut rng = StdRng::seed_from_u64(seed);
        let servers = rng.gen_range(2..6);
        let mut ring = HashRing::new(HashRingConfig {
            servers,
            virtual_nodes: rng.gen_range(1..40),
            ring_size: 0,
        });
        for i in 0..300 {
            ring.add_key(&format!("seed-{}-key-{}", seed, i));
        }

        let before = ring.distribution();
        let newcomer = NodeId::indexed("S", servers);
        let moves = ring.add_server(&newcomer);
        assert!(moves.iter().all(|m| m.to.as_ref() == Some(&newcomer)));
        let after = ring.distribution();
        for (server, count) in &before {
            let lost = moves.iter().filter(|m| m.from.as_ref() == Some(server)).count();
            assert_eq!(after.get(server).copied().unwrap_or(0), count - lost);
        }

        let victim = NodeId::indexed("S", rng.gen_range(0..servers));
        let owned = ring.distribution().get(&victim).copied().unwrap_or(0);
        let moves = ring.remove_server(&victim);
        assert_eq!(moves.len(), owned);
        assert!(moves.iter().all(|m| m.from.as_ref() == Some(&victim)));
        assert_eq!(ring.distribution().values().sum::<usize>(), 300);
    }
}
