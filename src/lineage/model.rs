//! Lineage vocabulary: artifacts, edges, transformations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Identifier of a data artifact (`"{kind}:{id}"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    /// Wrap a raw id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Protocol parameters of an experiment.
    #[must_use]
    pub fn protocol(experiment_id: &str) -> Self {
        Self(format!("protocol:{experiment_id}"))
    }

    /// Raw measurement of a well.
    #[must_use]
    pub fn measurement(well_id: &str) -> Self {
        Self(format!("measurement:{well_id}"))
    }

    /// Per-well analysis result.
    #[must_use]
    pub fn well_result(well_id: &str) -> Self {
        Self(format!("well-result:{well_id}"))
    }

    /// Model analysis output.
    #[must_use]
    pub fn analysis(analysis_id: &str) -> Self {
        Self(format!("analysis:{analysis_id}"))
    }

    /// Review decision on an analysis.
    #[must_use]
    pub fn review(analysis_id: &str) -> Self {
        Self(format!("review:{analysis_id}"))
    }

    /// Raw string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// How a target relates to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    /// Target computed from source
    DerivedFrom,
    /// Target is source after a transformation
    TransformedBy,
    /// Target validates source
    ValidatedBy,
    /// Target summarizes many sources
    AggregatedFrom,
    /// Target is a subset of source
    FilteredFrom,
    /// Target combines source with others
    MergedWith,
}

impl RelationshipKind {
    /// Stable label
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DerivedFrom => "derived_from",
            Self::TransformedBy => "transformed_by",
            Self::ValidatedBy => "validated_by",
            Self::AggregatedFrom => "aggregated_from",
            Self::FilteredFrom => "filtered_from",
            Self::MergedWith => "merged_with",
        }
    }
}

/// Provenance link `source -> target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageEdge {
    /// Upstream artifact
    pub source: ArtifactId,
    /// Downstream artifact
    pub target: ArtifactId,
    /// Relationship
    pub kind: RelationshipKind,
    /// Transformation that produced the target
    pub transformation_id: Option<Uuid>,
    /// When the edge was recorded
    pub created_at: DateTime<Utc>,
}

/// Category of a transformation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformationKind {
    /// Ingest from an instrument
    Extract,
    /// Compute derived values
    Transform,
    /// Persist into a store
    Load,
    /// Human review
    Review,
}

/// Immutable record of a processing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    /// Unique id
    pub id: Uuid,
    /// Human-readable name
    pub name: String,
    /// Category
    pub kind: TransformationKind,
    /// Parameters the step ran with
    pub parameters: Value,
    /// Code or model version
    pub version: String,
    /// Execution time (ms)
    pub duration_ms: u64,
    /// Fingerprint of the input
    pub input_checksum: Option<String>,
    /// Fingerprint of the output
    pub output_checksum: Option<String>,
    /// When the step ran
    pub created_at: DateTime<Utc>,
}

impl Transformation {
    /// New transformation with a fresh id.
    pub fn new(name: impl Into<String>, kind: TransformationKind, version: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            parameters: Value::Null,
            version: version.into(),
            duration_ms: 0,
            input_checksum: None,
            output_checksum: None,
            created_at: Utc::now(),
        }
    }

    /// Attach parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Attach execution time.
    #[must_use]
    pub const fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Attach input/output fingerprints.
    #[must_use]
    pub fn with_checksums(mut self, input: Option<String>, output: Option<String>) -> Self {
        self.input_checksum = input;
        self.output_checksum = output;
        self
    }
}

/// Proposed edge, before it is checked against the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSpec {
    /// Upstream artifact
    pub source: ArtifactId,
    /// Downstream artifact
    pub target: ArtifactId,
    /// Relationship
    pub kind: RelationshipKind,
    /// Producing step, stored alongside the edge
    pub transformation: Option<Transformation>,
}

impl EdgeSpec {
    /// Edge without a transformation record.
    #[must_use]
    pub const fn new(source: ArtifactId, target: ArtifactId, kind: RelationshipKind) -> Self {
        Self {
            source,
            target,
            kind,
            transformation: None,
        }
    }

    /// Attach the producing transformation.
    #[must_use]
    pub fn with_transformation(mut self, transformation: Transformation) -> Self {
        self.transformation = Some(transformation);
        self
    }
}
