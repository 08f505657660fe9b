//! Lineage Tracker integration tests
//!
//! Poka-Yoke: a cycle-closing edge is rejected and leaves the graph as it was.

use labmix_store::engine::{MemoryEngine, NewAnalysis};
use labmix_store::entity::{PlateType, ReviewStatus, UserRole};
use labmix_store::lineage::{
    ArtifactId, Direction, EdgeSpec, LineageTracker, RelationshipKind, Transformation, TransformationKind,
};
use labmix_store::store::StructuredStore;
use labmix_store::{Engine, Error};
use serde_json::json;

// =============================================================================
// Tracker
// =============================================================================

#[tokio::test]
async fn test_reverse_edge_rejected_as_cycle() {
    let tracker = LineageTracker::new();
    let a = ArtifactId::new("A");
    let b = ArtifactId::new("B");

    assert!(tracker
        .record_edge(a.clone(), b.clone(), RelationshipKind::DerivedFrom, None)
        .await
        .unwrap());
    let err = tracker
        .record_edge(b.clone(), a.clone(), RelationshipKind::DerivedFrom, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CycleDetected { .. }));

    let edges: Vec<_> = tracker.query(&a, Direction::Forward, None).await.collect();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].source, a);
    assert_eq!(edges[0].target, b);
    assert_eq!(tracker.edge_count().await, 1);
}

#[tokio::test]
async fn test_self_loop_rejected() {
    let tracker = LineageTracker::new();
    let a = ArtifactId::new("A");
    assert!(tracker
        .record_edge(a.clone(), a, RelationshipKind::MergedWith, None)
        .await
        .is_err());
    assert_eq!(tracker.edge_count().await, 0);
}

#[tokio::test]
async fn test_duplicate_edge_is_noop() {
    let tracker = LineageTracker::new();
    let a = ArtifactId::new("A");
    let b = ArtifactId::new("B");
    assert!(tracker
        .record_edge(a.clone(), b.clone(), RelationshipKind::FilteredFrom, None)
        .await
        .unwrap());
    assert!(!tracker
        .record_edge(a, b, RelationshipKind::FilteredFrom, None)
        .await
        .unwrap());
    assert_eq!(tracker.edge_count().await, 1);
}

#[tokio::test]
async fn test_batch_with_cycle_is_all_or_nothing() {
    let tracker = LineageTracker::new();
    let (a, b, c) = (ArtifactId::new("A"), ArtifactId::new("B"), ArtifactId::new("C"));
    let batch = vec![
        EdgeSpec::new(a.clone(), b.clone(), RelationshipKind::DerivedFrom),
        EdgeSpec::new(b.clone(), c.clone(), RelationshipKind::DerivedFrom),
        EdgeSpec::new(c, a, RelationshipKind::DerivedFrom),
    ];
    assert!(tracker.record_batch(batch).await.is_err());
    assert_eq!(tracker.edge_count().await, 0);
}

#[tokio::test]
async fn test_depth_bound_and_restart() {
    let tracker = LineageTracker::new();
    let chain: Vec<ArtifactId> = (0..5).map(|i| ArtifactId::new(format!("n{i}"))).collect();
    for pair in chain.windows(2) {
        tracker
            .record_edge(pair[0].clone(), pair[1].clone(), RelationshipKind::TransformedBy, None)
            .await
            .unwrap();
    }

    let mut walk = tracker.query(&chain[0], Direction::Forward, Some(2)).await;
    let first: Vec<_> = walk.by_ref().collect();
    assert_eq!(first.len(), 2);

    walk.restart();
    let again: Vec<_> = walk.collect();
    assert_eq!(first, again);

    let all = tracker.query(&chain[4], Direction::Backward, None).await.count();
    assert_eq!(all, 4);
    assert_eq!(tracker.roots_of(&chain[4]).await, vec![chain[0].clone()]);
}

#[tokio::test]
async fn test_transformation_recorded_with_edge() {
    let tracker = LineageTracker::new();
    let step = Transformation::new("normalize", TransformationKind::Transform, "v3")
        .with_parameters(json!({"blank": 0.05}));
    let id = step.id;
    tracker
        .record_edge(
            ArtifactId::new("raw"),
            ArtifactId::new("clean"),
            RelationshipKind::TransformedBy,
            Some(step),
        )
        .await
        .unwrap();

    let stored = tracker.transformation(&id).await.expect("transformation stored");
    assert_eq!(stored.name, "normalize");
    let edges: Vec<_> = tracker
        .query(&ArtifactId::new("clean"), Direction::Backward, None)
        .await
        .collect();
    assert_eq!(edges[0].transformation_id, Some(id));
}

// =============================================================================
// Lineage recorded by the coordinator
// =============================================================================

async fn engine_with_measured_wells() -> MemoryEngine {
    let engine = Engine::builder().build().unwrap();
    assert!(engine
        .register_user("u", "admin", "alice", "alice@lab.org", UserRole::Researcher, 5)
        .await
        .is_ok());
    assert!(engine
        .register_plate_type("p", "admin", PlateType::new("p6", "6-well", 2, 3))
        .await
        .is_ok());
    assert!(engine
        .create_experiment("c", "alice", "E1", "alice", "p6", json!({"red": 40}))
        .await
        .is_ok());
    for well in ["E1:A1", "E1:A2"] {
        let outcome = engine
            .record_measurement(well, json!({"od600": 0.3}), format!("m-{well}"))
            .await;
        assert!(outcome.is_ok(), "{outcome:?}");
    }
    engine
}

#[tokio::test]
async fn test_analysis_traces_back_to_protocol() {
    let engine = engine_with_measured_wells().await;
    let outcome = engine
        .record_analysis(
            "an",
            "alice",
            NewAnalysis {
                analysis_id: "AN1".into(),
                experiment_id: "E1".into(),
                model_version: "mix-model-2.1".into(),
                source_wells: Vec::new(),
                input: json!({"wells": 2}),
                output: json!({"ratio": 0.5}),
                duration_ms: 40,
            },
        )
        .await;
    assert!(outcome.is_ok(), "{outcome:?}");
    assert!(engine
        .review_analysis("rv", "bob", "AN1", ReviewStatus::Approved)
        .await
        .is_ok());

    let review = ArtifactId::review("AN1");
    let upstream: Vec<_> = engine.get_lineage(&review, Direction::Backward, None).await.collect();
    // review <- analysis <- 2 measurements <- protocol (reached twice, edges distinct)
    assert_eq!(upstream.len(), 5);
    let roots = engine.coordinator().lineage().roots_of(&review).await;
    assert_eq!(roots, vec![ArtifactId::protocol("E1")]);

    let direct: Vec<_> = engine
        .get_lineage(&ArtifactId::analysis("AN1"), Direction::Backward, Some(1))
        .await
        .collect();
    assert_eq!(direct.len(), 2);
    assert!(direct.iter().all(|e| e.kind == RelationshipKind::AggregatedFrom));
}

#[tokio::test]
async fn test_analysis_over_unknown_well_rejected() {
    let engine = engine_with_measured_wells().await;
    let outcome = engine
        .record_analysis(
            "an",
            "alice",
            NewAnalysis {
                analysis_id: "AN2".into(),
                experiment_id: "E1".into(),
                model_version: "v1".into(),
                source_wells: vec!["E2:A1".into()],
                input: json!({}),
                output: json!({"ratio": 0.1}),
                duration_ms: 1,
            },
        )
        .await;
    assert!(outcome.is_failed());
    assert!(engine.structured_store().analysis("AN2").await.unwrap().is_none());
}
