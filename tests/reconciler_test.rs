//! Consistency Reconciler integration tests
//!
//! Genchi Genbutsu: every scenario injects a real fault into one store and
//! checks that a scan re-reading both stores finds and handles it.

use chrono::Utc;
use labmix_store::audit::{AuditOutcome, OperationKind, Severity};
use labmix_store::config::EngineConfig;
use labmix_store::engine::{MemoryEngine, NewAnalysis};
use labmix_store::entity::{EntityKind, EntityRef, PlateType, UserRole};
use labmix_store::error::ErrorClass;
use labmix_store::reconciler::DivergenceKind;
use labmix_store::store::{Document, DocumentStore};
use labmix_store::Engine;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 4;
    config.retry.call_timeout_ms = 500;
    config
}

fn engine_with(config: EngineConfig) -> MemoryEngine {
    Engine::builder()
        .config(config)
        .with_fault_injection()
        .build()
        .expect("valid config")
}

async fn seeded(config: EngineConfig) -> MemoryEngine {
    let engine = engine_with(config);
    assert!(engine
        .register_user("seed-user", "admin", "alice", "alice@lab.org", UserRole::Researcher, 10)
        .await
        .is_ok());
    assert!(engine
        .register_plate_type("seed-plate", "admin", PlateType::new("p96", "96-well", 8, 12))
        .await
        .is_ok());
    let outcome = engine
        .create_experiment("create-e1", "alice", "E1", "alice", "p96", json!({"red": 40, "blue": 60}))
        .await;
    assert!(outcome.is_ok(), "{outcome:?}");
    engine
}

fn analysis(id: &str) -> NewAnalysis {
    NewAnalysis {
        analysis_id: id.into(),
        experiment_id: "E1".into(),
        model_version: "mix-model-2.1".into(),
        source_wells: Vec::new(),
        input: json!({"wells": 96}),
        output: json!({"ratio": 0.4}),
        duration_ms: 120,
    }
}

// =============================================================================
// Clean state
// =============================================================================

#[tokio::test]
async fn test_clean_stores_match() {
    let engine = seeded(config()).await;
    let report = engine.reconcile_now().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.matched, 1);
    assert!(report.divergent.is_empty());
    assert!(engine.get_consistency_report(Utc::now() - chrono::TimeDelta::minutes(1)).await.is_consistent());
}

// =============================================================================
// Outage during record_analysis, then repair
// =============================================================================

#[tokio::test]
async fn test_outage_divergence_repaired_on_next_scan() {
    let engine = seeded(config()).await;
    let since = Utc::now();

    engine.faults().unwrap().set_outage(true);
    let outcome = engine.record_analysis("an-1", "alice", analysis("A1")).await;
    assert!(outcome.is_divergent(), "{outcome:?}");
    engine.faults().unwrap().set_outage(false);

    let report = engine.reconcile_now().await.unwrap();
    assert_eq!(report.divergent.len(), 1);
    let detail = &report.divergent[0];
    assert_eq!(detail.key, EntityRef::new(EntityKind::Analysis, "A1"));
    assert_eq!(detail.kind, DivergenceKind::MissingInDocument);
    assert!(detail.repaired);

    let consistency = engine.get_consistency_report(since).await;
    assert!(consistency.is_consistent());
    assert_eq!(consistency.detected, 1);
    assert_eq!(consistency.repaired, 1);

    let view = engine.get_experiment("E1").await.unwrap().unwrap();
    assert_eq!(view.analyses.len(), 1);
    assert_eq!(view.analyses[0].output, Some(json!({"ratio": 0.4})));

    let trail = engine.get_audit_trail("A1").await.unwrap();
    assert_eq!(trail.len(), 2);
    assert_eq!(trail[0].outcome, AuditOutcome::Divergent);
    assert_eq!(trail[1].action, OperationKind::RepairDocument);
    assert_eq!(trail[1].outcome, AuditOutcome::Complete);

    let metrics = engine.metrics();
    assert_eq!(metrics.repairs_attempted, 1);
    assert_eq!(metrics.repairs_succeeded, 1);
    assert!((metrics.repair_success_rate() - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_unreadable_keys_are_deferred() {
    let engine = seeded(config()).await;

    engine.faults().unwrap().set_outage(true);
    let report = engine.reconcile_now().await.unwrap();
    assert_eq!(report.checked, 0);
    assert_eq!(report.deferred, 1);

    engine.faults().unwrap().set_outage(false);
    let report = engine.reconcile_now().await.unwrap();
    assert_eq!(report.matched, 1);
    assert_eq!(report.deferred, 0);
}

#[tokio::test]
async fn test_in_flight_write_reported_stale_not_repaired() {
    let engine = seeded(config()).await;
    let key = EntityRef::new(EntityKind::Well, "E1:A1");

    // The put sleeps 400 ms; the scan runs while it is still pending
    engine.faults().unwrap().set_latency(Duration::from_millis(400));
    let write = engine.record_measurement("E1:A1", json!({"od600": 0.2}), "m1");
    let scan = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.faults().unwrap().set_latency(Duration::ZERO);
        engine.reconcile_now().await
    };
    let (outcome, report) = tokio::join!(write, scan);
    assert!(outcome.is_ok(), "{outcome:?}");

    let report = report.unwrap();
    let detail = report
        .divergent
        .iter()
        .find(|d| d.key == key)
        .expect("in-flight key reported");
    assert_eq!(detail.kind, DivergenceKind::StalePendingRetry);
    assert!(!detail.repaired);
    assert!(!detail.escalated);
    assert_eq!(report.detected, 0);

    assert!(engine.take_alerts().await.is_empty());
    let metrics = engine.metrics();
    assert_eq!(metrics.repairs_attempted, 0);
    assert!(metrics.divergences.is_empty());

    // Once the write lands the key matches
    let report = engine.reconcile_now().await.unwrap();
    assert!(report.divergent.is_empty());
}

// =============================================================================
// Tampering
// =============================================================================

#[tokio::test]
async fn test_tampered_document_detected_and_restored() {
    let engine = seeded(config()).await;
    let key = EntityRef::new(EntityKind::Experiment, "E1");
    assert!(engine
        .document_store()
        .overwrite_body(&key, json!({"protocol": {"red": 99}, "result": null})));

    let report = engine.reconcile_now().await.unwrap();
    assert_eq!(report.divergent.len(), 1);
    assert_eq!(report.divergent[0].kind, DivergenceKind::ContentMismatch);
    assert_ne!(
        report.divergent[0].expected_fingerprint,
        report.divergent[0].actual_fingerprint
    );
    assert!(report.divergent[0].repaired);

    let doc = engine.document_store().get(&key).await.unwrap().unwrap();
    assert!(doc.is_intact());
    assert_eq!(doc.body["protocol"], json!({"red": 40, "blue": 60}));
    assert_eq!(engine.metrics().divergences.get("content_mismatch"), Some(&1));
}

#[tokio::test]
async fn test_deleted_document_detected_and_restored() {
    let engine = seeded(config()).await;
    let key = EntityRef::new(EntityKind::Experiment, "E1");
    assert!(engine.document_store().remove_document(&key).is_some());

    let report = engine.reconcile_now().await.unwrap();
    assert_eq!(report.divergent[0].kind, DivergenceKind::MissingInDocument);
    assert!(engine.document_store().get(&key).await.unwrap().is_some());
}

// =============================================================================
// Corruption
// =============================================================================

#[tokio::test]
async fn test_orphan_document_halts_experiment() {
    let engine = seeded(config()).await;
    let orphan = Document::new(
        EntityRef::new(EntityKind::Well, "E1:Z99"),
        json!({"measurement": {"od600": 1.0}, "analysis": null}),
        Uuid::new_v4(),
    );
    engine.document_store().insert_orphan(orphan);

    let report = engine.reconcile_now().await.unwrap();
    assert_eq!(report.divergent.len(), 1);
    assert_eq!(report.divergent[0].kind, DivergenceKind::MissingInStructured);
    assert!(report.divergent[0].escalated);
    assert!(!report.divergent[0].repaired);

    let alerts = engine.take_alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert_eq!(alerts[0].class, DivergenceKind::MissingInStructured);

    let outcome = engine.record_measurement("E1:A1", json!({"od600": 0.2}), "m1").await;
    assert_eq!(outcome.failure().unwrap().class, ErrorClass::Corruption);

    // Already escalated: a second scan keeps tracking without a new alert
    let report = engine.reconcile_now().await.unwrap();
    assert_eq!(report.divergent.len(), 1);
    assert!(engine.take_alerts().await.is_empty());
    assert!(!engine.get_consistency_report(Utc::now()).await.is_consistent());
}

// =============================================================================
// Escalation
// =============================================================================

#[tokio::test]
async fn test_failed_repairs_escalate_then_converge() {
    let mut config = config();
    config.reconciler.repair_attempts_before_escalation = 1;
    let engine = seeded(config).await;

    engine.faults().unwrap().fail_next_puts(1_000);
    let outcome = engine.record_measurement("E1:A1", json!({"od600": 0.2}), "m1").await;
    assert!(outcome.is_divergent(), "{outcome:?}");

    let report = engine.reconcile_now().await.unwrap();
    let detail = report
        .divergent
        .iter()
        .find(|d| d.key.id == "E1:A1")
        .expect("well divergence reported");
    assert!(!detail.repaired);
    assert!(detail.escalated);
    assert_eq!(detail.repair_attempts, 1);

    let alerts = engine.take_alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, Severity::Error);
    assert_eq!(engine.metrics().escalations, 1);

    engine.faults().unwrap().fail_next_puts(0);
    let report = engine.reconcile_now().await.unwrap();
    assert_eq!(report.repaired(), 1);
    assert!(engine.get_consistency_report(Utc::now()).await.is_consistent());
    assert!(engine.take_alerts().await.is_empty());
}

// =============================================================================
// Background loop
// =============================================================================

#[tokio::test]
async fn test_background_loop_repairs_without_caller() {
    let mut config = config();
    config.reconciler.interval_secs = 1;
    let engine = seeded(config).await;
    engine.start().await.unwrap();

    let key = EntityRef::new(EntityKind::Experiment, "E1");
    engine.document_store().remove_document(&key);
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert!(engine.document_store().get(&key).await.unwrap().is_some());
    engine.shutdown().await;
}
