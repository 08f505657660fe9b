//! Dual-Write Example
//!
//! Walks one liquid-mixing experiment through both stores, forces a document
//! outage mid-analysis, then lets the reconciler converge the stores.
//!
//! Run with: cargo run --example dual_write

use anyhow::Context;
use chrono::Utc;
use labmix_store::engine::NewAnalysis;
use labmix_store::entity::{ExperimentStatus, PlateType, ReviewStatus, UserRole};
use labmix_store::lineage::{ArtifactId, Direction};
use labmix_store::telemetry::init_tracing;
use labmix_store::{Engine, EngineConfig, Outcome};
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("labmix_store=info")?;
    println!("=== labmix-store Dual-Write Demo ===\n");

    let mut config = EngineConfig::default();
    config.retry.base_delay_ms = 5;
    config.retry.max_delay_ms = 20;
    let engine = Engine::builder().config(config).with_fault_injection().build()?;
    let started_at = Utc::now();

    // -------------------------------------------------------------------------
    // 1. Seed reference data
    // -------------------------------------------------------------------------
    println!("1. Registering user and plate type...");
    ensure(
        engine
            .register_user("seed-alice", "admin", "alice", "alice@lab.org", UserRole::Researcher, 5)
            .await,
    )?;
    let plate = PlateType::builder("p96", "96-well flat bottom", 8, 12)
        .well_volume_ul(360.0)
        .material("polystyrene")
        .build();
    ensure(engine.register_plate_type("seed-p96", "admin", plate).await)?;

    // -------------------------------------------------------------------------
    // 2. Create and run an experiment
    // -------------------------------------------------------------------------
    println!("\n2. Creating experiment E-001...");
    let protocol = json!({"dyes": {"red": 40, "blue": 60}, "volume_ul": 200});
    ensure(
        engine
            .create_experiment("create-e001", "alice", "E-001", "alice", "p96", protocol)
            .await,
    )?;
    ensure(
        engine
            .update_status("run-e001", "alice", "E-001", ExperimentStatus::Running, None, None)
            .await,
    )?;

    for (i, well) in ["E-001:A1", "E-001:A2", "E-001:B1"].into_iter().enumerate() {
        let reading = json!({"od600": 0.25 + 0.05 * i as f64, "temp_c": 37.0});
        let outcome = engine.record_measurement(well, reading, format!("measure-{well}")).await;
        println!("   {well}: {outcome:?}");
    }

    // Replays return the first outcome without writing again
    let replay = engine
        .record_measurement("E-001:A1", json!({"od600": 0.25, "temp_c": 37.0}), "measure-E-001:A1")
        .await;
    println!("   replay of E-001:A1: {replay:?}");

    // -------------------------------------------------------------------------
    // 3. Document store outage during analysis
    // -------------------------------------------------------------------------
    println!("\n3. Recording analysis during a document store outage...");
    let faults = engine.faults().context("fault injection enabled")?;
    faults.set_outage(true);
    let outcome = engine
        .record_analysis(
            "analysis-001",
            "alice",
            NewAnalysis {
                analysis_id: "AN-001".into(),
                experiment_id: "E-001".into(),
                model_version: "mix-model-2.1".into(),
                source_wells: Vec::new(),
                input: json!({"wells": 3}),
                output: json!({"red_ratio": 0.41, "blue_ratio": 0.59}),
                duration_ms: 180,
            },
        )
        .await;
    faults.set_outage(false);
    println!("   outcome: {outcome:?}");

    // -------------------------------------------------------------------------
    // 4. Reconcile
    // -------------------------------------------------------------------------
    println!("\n4. Running a reconciliation scan...");
    let scan = engine.reconcile_now().await?;
    println!(
        "   checked={} matched={} detected={} repaired={}",
        scan.checked,
        scan.matched,
        scan.detected,
        scan.repaired()
    );
    for detail in &scan.divergent {
        println!("   {} -> {:?} (repaired: {})", detail.key, detail.kind, detail.repaired);
    }

    ensure(
        engine
            .review_analysis("review-001", "bob", "AN-001", ReviewStatus::Approved)
            .await,
    )?;

    // -------------------------------------------------------------------------
    // 5. Read back
    // -------------------------------------------------------------------------
    println!("\n5. Reading back...");
    if let Some(view) = engine.get_experiment("E-001").await? {
        println!("   status: {:?}", view.status());
        println!("   wells: {}", view.wells.len());
        println!("   analyses: {}", view.analyses.len());
    }

    let upstream: Vec<_> = engine
        .get_lineage(&ArtifactId::review("AN-001"), Direction::Backward, None)
        .await
        .collect();
    println!("   lineage edges behind review: {}", upstream.len());

    for entry in engine.get_audit_trail("AN-001").await? {
        println!("   audit #{}: {:?} {:?}", entry.sequence, entry.action, entry.outcome);
    }

    let report = engine.get_consistency_report(started_at).await;
    println!("\n   consistent: {}", report.is_consistent());
    println!("   metrics: {}", serde_json::to_string_pretty(&engine.metrics())?);

    engine.shutdown().await;
    println!("\n=== Demo Complete ===");
    Ok(())
}

/// Stop the demo on a failed write; divergent writes are left to the reconciler.
fn ensure(outcome: Outcome) -> anyhow::Result<()> {
    match outcome.failure() {
        Some(reason) => anyhow::bail!("{:?}: {}", reason.class, reason.message),
        None => Ok(()),
    }
}
