//! End-to-end scenario tests
//!
//! Replays scripted scenarios through the public runner and drives the
//! engines directly for the canonical commit and lease walkthroughs.

use protolab_common::config::{CommitConfig, LeaseConfig};
use protolab_common::{ProtocolKind, ProtolabError, SimulationConfig};
use protolab_engine::transaction::{CoordinatorState, ParticipantState};
use protolab_engine::{
    run_scenario, Decision, LeaseManager, LockResponse, ManualClock, NodeId, Simulation,
    TwoPhaseCommit,
};
use serde_json::{json, Value};
use std::io::Write;

fn id(s: &str) -> NodeId {
    NodeId::new(s)
}

fn two_phase_script(votes: &[bool]) -> String {
    let mut steps = vec![json!({ "type": "start_transaction" }), json!({ "type": "deliver_all" })];
    for (i, commit) in votes.iter().enumerate() {
        steps.push(json!({
            "type": "participant_vote",
            "data": { "participant": format!("P{}", i), "commit": commit }
        }));
    }
    steps.extend([
        json!({ "type": "deliver_all" }),
        json!({ "type": "coordinator_decide" }),
        json!({ "type": "deliver_all" }),
        json!({ "type": "coordinator_complete" }),
    ]);
    Value::Array(steps).to_string()
}

// =============================================================================
// Two-Phase Commit
// =============================================================================

#[test]
fn test_two_phase_commit_unanimous_yes_commits() {
    let report = run_scenario(
        ProtocolKind::TwoPhaseCommit,
        &SimulationConfig::default(),
        &two_phase_script(&[true, true, true]),
    )
    .unwrap();

    assert_eq!(report.stats["coordinator"], json!("Committed"));
    for participant in ["P0", "P1", "P2"] {
        assert_eq!(report.stats["participants"][participant], json!("Committed"));
    }
}

#[test]
fn test_two_phase_commit_single_no_aborts_everyone() {
    let report = run_scenario(
        ProtocolKind::TwoPhaseCommit,
        &SimulationConfig::default(),
        &two_phase_script(&[true, false, true]),
    )
    .unwrap();

    assert_eq!(report.stats["coordinator"], json!("Aborted"));
    assert_eq!(report.stats["no_votes"], json!(1));
    for participant in ["P0", "P1", "P2"] {
        assert_eq!(report.stats["participants"][participant], json!("Aborted"));
    }
}

#[test]
fn test_two_phase_commit_direct_api() {
    let clock = ManualClock::new(0);
    let mut sim = TwoPhaseCommit::new(CommitConfig::default()).with_clock(clock.shared());
    sim.start_transaction();
    sim.deliver_all();
    sim.participant_vote(&id("P0"), true);
    sim.participant_vote(&id("P1"), false);
    sim.participant_vote(&id("P2"), true);
    sim.deliver_all();

    assert_eq!(sim.coordinator_decide(), Decision::Abort);
    sim.deliver_all();
    assert!(sim.coordinator_complete());
    assert_eq!(sim.coordinator().state, CoordinatorState::Aborted);
    assert!(sim.participants().iter().all(|p| p.state == ParticipantState::Aborted));
}

// =============================================================================
// Lease Locking
// =============================================================================

#[test]
fn test_lease_expiry_hands_lock_to_queued_client() {
    let clock = ManualClock::new(0);
    let mut leases = LeaseManager::new(LeaseConfig::default().with_ttl_ms(4000)).with_clock(clock.shared());

    assert_eq!(
        leases.request_lock(&id("C0")),
        LockResponse::Granted {
            token: 1,
            expires_at: 4000
        }
    );
    assert_eq!(leases.request_lock(&id("C1")), LockResponse::Queued { position: 1 });

    clock.advance(3999);
    assert!(leases.check_timeouts().is_none());
    clock.advance(1);
    assert_eq!(leases.check_timeouts(), Some(id("C0")));
    assert_eq!(leases.holder(), Some(&id("C1")));

    leases.deliver_all();
    assert!(leases.fenced_write(&id("C1"), 2));
    assert!(!leases.fenced_write(&id("C0"), 1));
    assert_eq!(leases.client(&id("C1")).unwrap().token, Some(2));
}

// =============================================================================
// Configuration and Errors
// =============================================================================

#[test]
fn test_scenario_with_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[raft]\nnode_count = 3").unwrap();
    let config = SimulationConfig::from_file(file.path()).unwrap();
    assert_eq!(config.raft.node_count, 3);

    let script = json!([
        { "type": "start_election", "data": { "candidate": "N1" } },
        { "type": "deliver_all" },
        { "type": "client_request", "data": { "command": "set x 1" } },
        { "type": "deliver_all" }
    ]);
    let report = run_scenario(ProtocolKind::Raft, &config, &script.to_string()).unwrap();

    assert_eq!(report.stats["nodes"], json!(3));
    assert_eq!(report.stats["leader"], json!("N1"));
    assert_eq!(report.stats["log_length"], json!(1));
}

#[test]
fn test_every_protocol_accepts_an_empty_scenario() {
    let config = SimulationConfig::default();
    for protocol in ProtocolKind::ALL {
        let report = run_scenario(protocol, &config, "[]").unwrap();
        assert_eq!(report.steps, 0);
        assert!(report.stats.is_object(), "{} stats", protocol.name());
    }
}

#[test]
fn test_malformed_scenarios_are_user_errors() {
    let config = SimulationConfig::default();
    let err = run_scenario(
        ProtocolKind::Lease,
        &config,
        r#"[{"type": "request_lock", "data": {"client": 7}}]"#,
    )
    .unwrap_err();
    assert!(matches!(err, ProtolabError::Instruction { step: 0, .. }));
    assert!(err.is_user_error());

    let err = run_scenario(ProtocolKind::Lease, &config, r#"[{"data": {}}]"#).unwrap_err();
    assert!(matches!(err, ProtolabError::Instruction { step: 0, .. }));
}
