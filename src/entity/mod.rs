//! Entity Schema
//!
//! Typed headers for the structured (relational) half of every record. The
//! variable-shape payloads (protocol parameters, measurements, model outputs)
//! live in the document store keyed by the same entity id.
//!
//! ## Schema Overview
//!
//! ```text
//! UserRecord (1) ──< ExperimentRecord (N) >── (1) PlateType
//!                          │
//!                          ├──< WellRecord (plate wells_count)
//!                          └──< AnalysisRecord (N)
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use labmix_store::entity::{ExperimentRecord, ExperimentStatus, PlateType};
//!
//! let plate = PlateType::new("plate-96", "96-well-plate", 8, 12);
//! assert_eq!(plate.wells_count(), 96);
//!
//! let mut experiment = ExperimentRecord::new("exp-001", "user-1", plate.plate_type_id());
//! experiment.transition(ExperimentStatus::Running, None).unwrap();
//! assert!(experiment.started_at().is_some());
//! ```

mod analysis;
mod experiment;
mod plate;
mod user;
mod well;

pub use analysis::{AnalysisRecord, ReviewStatus};
pub use experiment::{ExperimentRecord, ExperimentRecordBuilder, ExperimentStatus};
pub use plate::{PlateType, PlateTypeBuilder};
pub use user::{UserRecord, UserRole};
pub use well::{WellPosition, WellRecord, WellStatus};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of entity an id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Experiment header + protocol/result document
    Experiment,
    /// Well header + measurement/analysis document
    Well,
    /// Analysis header + input/output document
    Analysis,
    /// Registered user (structured only)
    User,
    /// Plate geometry (structured only)
    PlateType,
}

impl EntityKind {
    /// Stable name used in keys, logs and metrics
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Experiment => "experiment",
            Self::Well => "well",
            Self::Analysis => "analysis",
            Self::User => "user",
            Self::PlateType => "plate_type",
        }
    }

    /// Whether entities of this kind carry a document fragment.
    #[must_use]
    pub const fn has_document(&self) -> bool {
        matches!(self, Self::Experiment | Self::Well | Self::Analysis)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to one entity (kind + id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Entity kind
    pub kind: EntityKind,
    /// Entity id
    pub id: String,
}

impl EntityRef {
    /// Create a reference.
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}
