//! Write Coordinator integration tests
//!
//! Drives the saga end to end through the engine facade over the in-memory
//! stores, with the document store behind a fault switchboard.

use chrono::Utc;
use labmix_store::audit::{AuditOutcome, AuditQuery, OperationKind};
use labmix_store::config::EngineConfig;
use labmix_store::entity::{EntityKind, EntityRef, ExperimentStatus, PlateType, UserRole, WellStatus};
use labmix_store::error::ErrorClass;
use labmix_store::engine::{MemoryEngine, NewAnalysis};
use labmix_store::store::{DocumentStore, StructuredStore};
use labmix_store::{Command, Engine, Operation};
use serde_json::json;

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 4;
    config.retry.call_timeout_ms = 500;
    config
}

fn engine() -> MemoryEngine {
    Engine::builder()
        .config(fast_config())
        .with_fault_injection()
        .build()
        .expect("valid config")
}

async fn seed(engine: &MemoryEngine) {
    let outcome = engine
        .register_user("seed-user", "admin", "alice", "alice@lab.org", UserRole::Researcher, 10)
        .await;
    assert!(outcome.is_ok(), "{outcome:?}");
    let outcome = engine
        .register_plate_type("seed-plate", "admin", PlateType::new("p96", "96-well", 8, 12))
        .await;
    assert!(outcome.is_ok(), "{outcome:?}");
}

async fn create_e1(engine: &MemoryEngine) {
    let outcome = engine
        .create_experiment("create-e1", "alice", "E1", "alice", "p96", json!({"red": 40, "blue": 60}))
        .await;
    assert!(outcome.is_ok(), "{outcome:?}");
}

// =============================================================================
// Creation
// =============================================================================

#[tokio::test]
async fn test_create_experiment_with_96_wells() {
    let engine = engine();
    seed(&engine).await;
    create_e1(&engine).await;

    let view = engine.get_experiment("E1").await.unwrap().expect("E1 exists");
    assert_eq!(view.status(), ExperimentStatus::Pending);
    assert_eq!(view.protocol, Some(json!({"red": 40, "blue": 60})));
    assert_eq!(view.wells.len(), 96);
    assert!(view.wells.iter().all(|w| w.well.status() == WellStatus::Pending));
    assert_eq!(view.wells[0].well.well_id(), "E1:A1");
    assert_eq!(view.wells[95].well.well_id(), "E1:H12");
}

#[tokio::test]
async fn test_create_consumes_quota() {
    let engine = engine();
    seed(&engine).await;
    create_e1(&engine).await;

    let user = engine.structured_store().user("alice").await.unwrap().unwrap();
    assert_eq!(user.quota_remaining(), 9);
}

#[tokio::test]
async fn test_unknown_plate_rejected_before_any_write() {
    let engine = engine();
    seed(&engine).await;
    let outcome = engine
        .create_experiment("bad", "alice", "E9", "alice", "p384", json!({}))
        .await;
    assert_eq!(outcome.failure().unwrap().class, ErrorClass::Validation);
    assert!(engine.document_store().is_empty());
    assert!(engine.get_audit_trail("E9").await.unwrap().is_empty());
}

// =============================================================================
// Idempotency
// =============================================================================

#[tokio::test]
async fn test_measurement_replay_returns_same_result() {
    let engine = engine();
    seed(&engine).await;
    create_e1(&engine).await;

    let payload = json!({"od600": 0.42, "temp_c": 37.0});
    let first = engine.record_measurement("E1:A1", payload.clone(), "K").await;
    let second = engine.record_measurement("E1:A1", payload, "K").await;
    assert!(first.is_ok(), "{first:?}");
    assert_eq!(first, second);

    // Exactly one write: one audit entry, document stamped by the first op
    let trail = engine.get_audit_trail("E1:A1").await.unwrap();
    assert_eq!(trail.len(), 1);
    let key = EntityRef::new(EntityKind::Well, "E1:A1");
    let doc = engine.document_store().get(&key).await.unwrap().unwrap();
    assert_eq!(doc.operation_id, first.ids().unwrap().operation_id);
    assert_eq!(trail[0].action, OperationKind::RecordMeasurement);
}

#[tokio::test]
async fn test_key_reuse_with_other_payload_rejected() {
    let engine = engine();
    seed(&engine).await;
    create_e1(&engine).await;

    assert!(engine.record_measurement("E1:A1", json!({"od600": 0.1}), "K").await.is_ok());
    let outcome = engine.record_measurement("E1:A1", json!({"od600": 0.9}), "K").await;
    assert_eq!(outcome.failure().unwrap().class, ErrorClass::Validation);
}

#[tokio::test]
async fn test_measurement_after_analysis_rejected() {
    let engine = engine();
    seed(&engine).await;
    create_e1(&engine).await;

    assert!(engine.record_measurement("E1:B2", json!({"od600": 0.1}), "m1").await.is_ok());
    assert!(engine
        .record_well_result("r1", "alice", "E1:B2", json!({"hit": false}), false)
        .await
        .is_ok());
    let outcome = engine.record_measurement("E1:B2", json!({"od600": 0.2}), "m2").await;
    assert_eq!(outcome.failure().unwrap().class, ErrorClass::Validation);
}

// =============================================================================
// Partial failure
// =============================================================================

#[tokio::test]
async fn test_document_outage_yields_divergent_and_queues_repair() {
    let engine = engine();
    seed(&engine).await;
    create_e1(&engine).await;

    engine.faults().unwrap().set_outage(true);
    let outcome = engine
        .record_analysis(
            "an-1",
            "alice",
            NewAnalysis {
                analysis_id: "A1".into(),
                experiment_id: "E1".into(),
                model_version: "mix-model-2.1".into(),
                source_wells: Vec::new(),
                input: json!({"wells": 96}),
                output: json!({"ratio": 0.4}),
                duration_ms: 120,
            },
        )
        .await;
    assert!(outcome.is_divergent(), "{outcome:?}");
    // first attempt + 3 retries
    assert_eq!(engine.faults().unwrap().injected(), 4);

    // Structured side is the anchor and stays committed
    assert!(engine.structured_store().analysis("A1").await.unwrap().is_some());
    assert_eq!(engine.coordinator().pending_repairs(), 1);

    let trail = engine.get_audit_trail("A1").await.unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].outcome, AuditOutcome::Divergent);
}

#[tokio::test]
async fn test_structured_failure_leaves_documents_untouched() {
    let engine = engine();
    seed(&engine).await;

    engine.structured_store().fail_next_commits(4);
    let outcome = engine
        .create_experiment("create-e1", "alice", "E1", "alice", "p96", json!({"red": 40}))
        .await;
    assert_eq!(outcome.failure().unwrap().class, ErrorClass::Transient);
    assert!(engine.document_store().is_empty());
    assert!(engine.get_experiment("E1").await.unwrap().is_none());

    // Failed outcome is not cached: the same key succeeds once the store recovers
    let outcome = engine
        .create_experiment("create-e1", "alice", "E1", "alice", "p96", json!({"red": 40}))
        .await;
    assert!(outcome.is_ok(), "{outcome:?}");
}

#[tokio::test]
async fn test_transient_structured_failure_absorbed_by_retry() {
    let engine = engine();
    seed(&engine).await;

    engine.structured_store().fail_next_commits(2);
    create_e1(&engine).await;
    assert_eq!(engine.structured_store().experiment_count().await, 1);
}

#[tokio::test]
async fn test_audit_failure_halts_experiment() {
    let engine = engine();
    seed(&engine).await;
    create_e1(&engine).await;

    engine.coordinator().audit().sink().fail_next_appends(1);
    let outcome = engine
        .update_status("run-e1", "workflow", "E1", ExperimentStatus::Running, None, None)
        .await;
    assert_eq!(outcome.failure().unwrap().class, ErrorClass::Corruption);
    assert!(engine.coordinator().halt_reason("E1").is_some());

    let outcome = engine.record_measurement("E1:A1", json!({"od600": 0.3}), "m1").await;
    assert_eq!(outcome.failure().unwrap().class, ErrorClass::Corruption);

    assert!(engine.resume("E1"));
    assert!(engine.record_measurement("E1:A1", json!({"od600": 0.3}), "m1").await.is_ok());
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_status_transitions_are_monotonic() {
    let engine = engine();
    seed(&engine).await;
    create_e1(&engine).await;

    let run = engine
        .update_status("s1", "workflow", "E1", ExperimentStatus::Running, None, None)
        .await;
    assert!(run.is_ok(), "{run:?}");
    let done = engine
        .update_status("s2", "workflow", "E1", ExperimentStatus::Completed, None, Some(json!({"yield": 0.93})))
        .await;
    assert!(done.is_ok(), "{done:?}");
    let back = engine
        .update_status("s3", "workflow", "E1", ExperimentStatus::Running, None, None)
        .await;
    assert_eq!(back.failure().unwrap().class, ErrorClass::Validation);

    let view = engine.get_experiment("E1").await.unwrap().unwrap();
    assert_eq!(view.status(), ExperimentStatus::Completed);
    assert_eq!(view.result, Some(json!({"yield": 0.93})));
    assert_eq!(view.protocol, Some(json!({"red": 40, "blue": 60})));
}

#[tokio::test]
async fn test_cancelled_submission_touches_nothing() {
    let engine = engine();
    seed(&engine).await;

    let handle = engine.submit(Operation::new(
        "create-e1",
        "alice",
        Command::CreateExperiment {
            experiment_id: "E1".into(),
            user_id: "alice".into(),
            plate_type_id: "p96".into(),
            protocol: json!({}),
        },
    ));
    handle.cancel();
    let outcome = handle.outcome().await;

    // Cancellation raced the worker; either way nothing is half-applied
    match outcome.failure() {
        Some(reason) => {
            assert_eq!(reason.class, ErrorClass::Cancelled);
            assert!(engine.get_experiment("E1").await.unwrap().is_none());
            assert!(engine.document_store().is_empty());
        }
        None => assert!(outcome.is_ok()),
    }
}

#[tokio::test]
async fn test_concurrent_measurements_across_wells() {
    let engine = engine();
    seed(&engine).await;
    create_e1(&engine).await;

    let handles: Vec<_> = (1..=12)
        .map(|column| {
            engine.submit(Operation::new(
                format!("m-{column}"),
                "system:telemetry",
                Command::RecordMeasurement {
                    well_id: format!("E1:C{column}"),
                    payload: json!({"od600": f64::from(column) / 100.0}),
                },
            ))
        })
        .collect();
    for handle in handles {
        let outcome = handle.outcome().await;
        assert!(outcome.is_ok(), "{outcome:?}");
    }

    let view = engine.get_experiment("E1").await.unwrap().unwrap();
    let measured = view.wells.iter().filter(|w| w.measurement.is_some()).count();
    assert_eq!(measured, 12);
}

#[tokio::test]
async fn test_same_experiment_writes_serialize() {
    let engine = engine();
    seed(&engine).await;
    create_e1(&engine).await;
    let started = Utc::now();

    // Slow document writes widen the window in which writes could interleave
    engine.faults().unwrap().set_latency(std::time::Duration::from_millis(20));
    let mut handles: Vec<_> = (1..=10)
        .map(|column| {
            engine.submit(Operation::new(
                format!("m-{column}"),
                "system:telemetry",
                Command::RecordMeasurement {
                    well_id: format!("E1:D{column}"),
                    payload: json!({"od600": f64::from(column) / 10.0}),
                },
            ))
        })
        .collect();
    handles.insert(
        5,
        engine.submit(Operation::new(
            "run-e1",
            "workflow",
            Command::UpdateStatus {
                experiment_id: "E1".into(),
                status: ExperimentStatus::Running,
                error_message: None,
                result: None,
            },
        )),
    );
    for handle in handles {
        let outcome = handle.outcome().await;
        assert!(outcome.is_ok(), "{outcome:?}");
    }
    engine.faults().unwrap().set_latency(std::time::Duration::ZERO);

    // A measurement writing back a stale header would undo the status change
    let view = engine.get_experiment("E1").await.unwrap().unwrap();
    assert_eq!(view.status(), ExperimentStatus::Running);
    let measured = view.wells.iter().filter(|w| w.well.status() == WellStatus::Measured).count();
    assert_eq!(measured, 10);

    let trail = engine.get_audit_trail("E1").await.unwrap();
    let sequences: Vec<u64> = trail.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2]);
    assert_eq!(trail[1].action, OperationKind::UpdateStatus);

    let entries = engine
        .coordinator()
        .audit()
        .query(&AuditQuery::new().between(started, Utc::now()))
        .await
        .unwrap();
    assert_eq!(entries.len(), 11);
    assert!(entries.iter().all(|e| e.outcome == AuditOutcome::Complete));
}

#[tokio::test]
async fn test_quota_holds_under_concurrent_creates() {
    let mut config = fast_config();
    config.retry.base_delay_ms = 50;
    config.retry.max_delay_ms = 100;
    let engine = Engine::builder().config(config).build().expect("valid config");
    assert!(engine
        .register_user("seed-user", "admin", "bob", "bob@lab.org", UserRole::Researcher, 1)
        .await
        .is_ok());
    assert!(engine
        .register_plate_type("seed-plate", "admin", PlateType::new("p6", "6-well", 2, 3))
        .await
        .is_ok());

    // First create fails its commit once and retries after the second has committed
    engine.structured_store().fail_next_commits(1);
    let first = engine.create_experiment("c-e1", "bob", "E1", "bob", "p6", json!({}));
    let second = async {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        engine.create_experiment("c-e2", "bob", "E2", "bob", "p6", json!({})).await
    };
    let (first, second) = tokio::join!(first, second);

    let succeeded = [&first, &second].iter().filter(|o| o.is_ok()).count();
    assert_eq!(succeeded, 1, "first={first:?} second={second:?}");
    assert_eq!(engine.structured_store().experiment_count().await, 1);
    let user = engine.structured_store().user("bob").await.unwrap().unwrap();
    assert_eq!(user.quota_remaining(), 0);
}

// =============================================================================
// Audit completeness
// =============================================================================

#[tokio::test]
async fn test_one_audit_entry_per_terminal_operation() {
    let engine = engine();
    seed(&engine).await;
    create_e1(&engine).await;
    let started = Utc::now();

    assert!(engine.record_measurement("E1:A1", json!({"od600": 0.2}), "m1").await.is_ok());
    assert!(engine.record_measurement("E1:A1", json!({"od600": 0.2}), "m1").await.is_ok());
    assert!(engine.record_well_result("r1", "alice", "E1:A1", json!({"hit": true}), false).await.is_ok());
    engine.faults().unwrap().fail_next_puts(4);
    assert!(engine.record_measurement("E1:A2", json!({"od600": 0.5}), "m2").await.is_divergent());

    let entries = engine
        .coordinator()
        .audit()
        .query(&AuditQuery::new().between(started, Utc::now()))
        .await
        .unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(
        entries.iter().filter(|e| e.outcome == AuditOutcome::Divergent).count(),
        1
    );

    let trail = engine.get_audit_trail("E1:A1").await.unwrap();
    let sequences: Vec<u64> = trail.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2]);
    assert_eq!(trail[0].actor, "system:telemetry");
    assert!(trail[1].before.is_some() && trail[1].after.is_some());
}
