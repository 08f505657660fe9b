//! Lineage Tracker
//!
//! Provenance links between raw and derived artifacts, kept as an
//! append-only DAG. An edge whose target already reaches its source is
//! rejected, so the graph never contains a cycle (Poka-Yoke: the invalid
//! state cannot be written).
//!
//! Readers take an `Arc` snapshot of the graph and walk it lazily; writers
//! copy-on-write only while a snapshot is still held, so a slow walk never
//! blocks a writer.
//!
//! # Example
//!
//! ```rust
//! use labmix_store::lineage::{ArtifactId, Direction, LineageTracker, RelationshipKind};
//!
//! # async fn example() -> labmix_store::Result<()> {
//! let tracker = LineageTracker::new();
//! let raw = ArtifactId::measurement("exp-1:A1");
//! let derived = ArtifactId::well_result("exp-1:A1");
//!
//! tracker.record_edge(raw.clone(), derived.clone(), RelationshipKind::TransformedBy, None).await?;
//! assert!(tracker.record_edge(derived.clone(), raw, RelationshipKind::DerivedFrom, None).await.is_err());
//!
//! let origins: Vec<_> = tracker.query(&derived, Direction::Backward, None).await.collect();
//! assert_eq!(origins.len(), 1);
//! # Ok(())
//! # }
//! ```

mod graph;
mod model;

pub use graph::{Direction, LineageGraph, LineageWalk};
pub use model::{
    ArtifactId, EdgeSpec, LineageEdge, RelationshipKind, Transformation, TransformationKind,
};

use chrono::Utc;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{Error, Result};

/// Concurrent lineage store.
#[derive(Debug, Default)]
pub struct LineageTracker {
    graph: RwLock<Arc<LineageGraph>>,
}

impl LineageTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one edge. Returns `false` if the identical edge already existed.
    ///
    /// # Errors
    ///
    /// `Error::CycleDetected` for self-loops and edges closing a cycle.
    pub async fn record_edge(
        &self,
        source: ArtifactId,
        target: ArtifactId,
        kind: RelationshipKind,
        transformation: Option<Transformation>,
    ) -> Result<bool> {
        let spec = EdgeSpec {
            source,
            target,
            kind,
            transformation,
        };
        Ok(self.record_batch(vec![spec]).await? == 1)
    }

    /// Record several edges atomically: all are added, or none.
    /// Returns how many were new.
    ///
    /// # Errors
    ///
    /// `Error::CycleDetected` if any edge (given the ones before it) would
    /// close a cycle.
    pub async fn record_batch(&self, specs: Vec<EdgeSpec>) -> Result<usize> {
        let mut guard = self.graph.write().await;
        let graph = Arc::make_mut(&mut *guard);
        let rollback_to = graph.edge_count();
        let mut transformations = Vec::new();
        let mut added = 0;

        for spec in specs {
            if graph.contains(&spec.source, &spec.target, spec.kind) {
                continue;
            }
            if graph.reaches(&spec.target, &spec.source) {
                graph.truncate(rollback_to);
                warn!(source = %spec.source, target = %spec.target, "Rejected lineage edge: cycle");
                return Err(Error::CycleDetected {
                    from_artifact: spec.source.to_string(),
                    to_artifact: spec.target.to_string(),
                });
            }
            let transformation_id = spec.transformation.as_ref().map(|t| t.id);
            graph.push(LineageEdge {
                source: spec.source,
                target: spec.target,
                kind: spec.kind,
                transformation_id,
                created_at: Utc::now(),
            });
            transformations.extend(spec.transformation);
            added += 1;
        }

        for transformation in transformations {
            graph.put_transformation(transformation);
        }
        debug!(added, total = graph.edge_count(), "Recorded lineage edges");
        Ok(added)
    }

    /// Whether adding `source -> target` would be rejected.
    pub async fn would_cycle(&self, source: &ArtifactId, target: &ArtifactId) -> bool {
        self.graph.read().await.reaches(target, source)
    }

    /// Lazy breadth-first walk from `artifact`, optionally depth-bounded.
    pub async fn query(
        &self,
        artifact: &ArtifactId,
        direction: Direction,
        depth: Option<usize>,
    ) -> LineageWalk {
        let snapshot = self.snapshot().await;
        LineageWalk::new(snapshot, artifact.clone(), direction, depth)
    }

    /// Look up a transformation record.
    pub async fn transformation(&self, id: &Uuid) -> Option<Transformation> {
        self.graph.read().await.transformation(id).cloned()
    }

    /// Raw origins of an artifact: upstream artifacts with no inbound edges.
    pub async fn roots_of(&self, artifact: &ArtifactId) -> Vec<ArtifactId> {
        let walk = self.query(artifact, Direction::Backward, None).await;
        let mut sources = Vec::new();
        let mut targets = FxHashSet::default();
        for edge in walk {
            targets.insert(edge.target.clone());
            sources.push(edge.source);
        }
        let mut roots: Vec<ArtifactId> = sources
            .into_iter()
            .filter(|s| !targets.contains(s))
            .collect::<FxHashSet<_>>()
            .into_iter()
            .collect();
        roots.sort();
        roots
    }

    /// Number of edges.
    pub async fn edge_count(&self) -> usize {
        self.graph.read().await.edge_count()
    }

    /// Current graph snapshot.
    pub async fn snapshot(&self) -> Arc<LineageGraph> {
        Arc::clone(&*self.graph.read().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ArtifactId {
        ArtifactId::new(s)
    }

    #[tokio::test]
    async fn test_reverse_edge_rejected() {
        let tracker = LineageTracker::new();
        tracker
            .record_edge(id("A"), id("B"), RelationshipKind::DerivedFrom, None)
            .await
            .unwrap();
        let err = tracker
            .record_edge(id("B"), id("A"), RelationshipKind::DerivedFrom, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CycleDetected { .. }));
        assert_eq!(tracker.edge_count().await, 1);
    }

    #[tokio::test]
    async fn test_self_loop_rejected() {
        let tracker = LineageTracker::new();
        assert!(tracker
            .record_edge(id("A"), id("A"), RelationshipKind::MergedWith, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_duplicate_is_noop() {
        let tracker = LineageTracker::new();
        assert!(tracker
            .record_edge(id("A"), id("B"), RelationshipKind::DerivedFrom, None)
            .await
            .unwrap());
        assert!(!tracker
            .record_edge(id("A"), id("B"), RelationshipKind::DerivedFrom, None)
            .await
            .unwrap());
        assert_eq!(tracker.edge_count().await, 1);
    }

    #[tokio::test]
    async fn test_batch_is_atomic() {
        let tracker = LineageTracker::new();
        tracker
            .record_edge(id("A"), id("B"), RelationshipKind::DerivedFrom, None)
            .await
            .unwrap();

        let batch = vec![
            EdgeSpec::new(id("B"), id("C"), RelationshipKind::DerivedFrom),
            EdgeSpec::new(id("C"), id("A"), RelationshipKind::DerivedFrom),
        ];
        assert!(tracker.record_batch(batch).await.is_err());
        assert_eq!(tracker.edge_count().await, 1);
    }

    #[tokio::test]
    async fn test_transformation_stored() {
        let tracker = LineageTracker::new();
        let step = Transformation::new("normalize", TransformationKind::Transform, "v2");
        let step_id = step.id;
        tracker
            .record_edge(id("A"), id("B"), RelationshipKind::TransformedBy, Some(step))
            .await
            .unwrap();

        let stored = tracker.transformation(&step_id).await.unwrap();
        assert_eq!(stored.version, "v2");
        let edge = tracker.query(&id("A"), Direction::Forward, None).await.next().unwrap();
        assert_eq!(edge.transformation_id, Some(step_id));
    }

    #[tokio::test]
    async fn test_roots_of() {
        let tracker = LineageTracker::new();
        for (a, b) in [("raw1", "mid"), ("raw2", "mid"), ("mid", "out")] {
            tracker
                .record_edge(id(a), id(b), RelationshipKind::AggregatedFrom, None)
                .await
                .unwrap();
        }
        assert_eq!(tracker.roots_of(&id("out")).await, vec![id("raw1"), id("raw2")]);
    }

    #[tokio::test]
    async fn test_walk_survives_concurrent_write() {
        let tracker = LineageTracker::new();
        tracker
            .record_edge(id("A"), id("B"), RelationshipKind::DerivedFrom, None)
            .await
            .unwrap();
        let walk = tracker.query(&id("A"), Direction::Forward, None).await;
        tracker
            .record_edge(id("B"), id("C"), RelationshipKind::DerivedFrom, None)
            .await
            .unwrap();
        // Walk reads the snapshot taken before the second edge
        assert_eq!(walk.count(), 1);
        assert_eq!(tracker.edge_count().await, 2);
    }
}
