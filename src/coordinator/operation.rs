//! Logical operations and their outcomes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::OperationKind;
use crate::entity::{EntityRef, ExperimentStatus, PlateType, ReviewStatus, UserRole};
use crate::error::ErrorClass;
use crate::store::DocumentKey;
use crate::Error;

/// One logical write, as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Caller-chosen key; replays with the same key return the first outcome
    pub idempotency_key: String,
    /// Acting user id (trusted, from the identity layer)
    pub actor: String,
    /// Shared with every audit entry the operation produces
    pub correlation_id: Uuid,
    /// What to do
    pub command: Command,
}

impl Operation {
    /// New operation with a fresh correlation id.
    pub fn new(idempotency_key: impl Into<String>, actor: impl Into<String>, command: Command) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            actor: actor.into(),
            correlation_id: Uuid::new_v4(),
            command,
        }
    }

    /// Reuse a caller's correlation id.
    #[must_use]
    pub const fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Operation kind
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        self.command.kind()
    }
}

/// Command payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    /// Register or update a user
    RegisterUser {
        /// User id
        user_id: String,
        /// Contact email
        email: String,
        /// Role
        role: UserRole,
        /// Experiments the user may still create
        quota: u32,
        /// Block the user
        #[serde(default)]
        disabled: bool,
    },
    /// Register a plate geometry (immutable afterwards)
    RegisterPlateType {
        /// Plate definition
        plate: PlateType,
    },
    /// Create an experiment and all of its wells
    CreateExperiment {
        /// New experiment id
        experiment_id: String,
        /// Owning user
        user_id: String,
        /// Plate geometry
        plate_type_id: String,
        /// Protocol parameters (JSON object)
        protocol: Value,
    },
    /// Move an experiment along its lifecycle
    UpdateStatus {
        /// Experiment id
        experiment_id: String,
        /// Requested status
        status: ExperimentStatus,
        /// Reason, kept when moving to `failed`
        #[serde(default)]
        error_message: Option<String>,
        /// Result payload to store with the transition
        #[serde(default)]
        result: Option<Value>,
    },
    /// Ingest a raw measurement for a well
    RecordMeasurement {
        /// `"{experiment_id}:{position}"`
        well_id: String,
        /// Sensor payload
        payload: Value,
    },
    /// Attach a per-well analysis result
    RecordWellResult {
        /// Well id
        well_id: String,
        /// Result payload
        result: Value,
        /// Mark the well failed instead of analyzed
        #[serde(default)]
        failed: bool,
    },
    /// Record a model analysis over measured wells
    RecordAnalysis {
        /// New analysis id
        analysis_id: String,
        /// Experiment the analysis belongs to
        experiment_id: String,
        /// Model/version identifier
        model_version: String,
        /// Input wells; empty means every measured well of the experiment
        #[serde(default)]
        source_wells: Vec<String>,
        /// Model input
        input: Value,
        /// Model output
        output: Value,
        /// Inference time
        #[serde(default)]
        duration_ms: u64,
    },
    /// Approve or reject an analysis
    ReviewAnalysis {
        /// Analysis id
        analysis_id: String,
        /// `approved` or `rejected`
        decision: ReviewStatus,
        /// Reviewing user
        reviewer: String,
    },
    /// Replay the structured store's intent for a document key
    RepairDocument {
        /// Document to rewrite
        key: DocumentKey,
    },
}

impl Command {
    /// Operation kind
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::RegisterUser { .. } => OperationKind::RegisterUser,
            Self::RegisterPlateType { .. } => OperationKind::RegisterPlateType,
            Self::CreateExperiment { .. } => OperationKind::CreateExperiment,
            Self::UpdateStatus { .. } => OperationKind::UpdateStatus,
            Self::RecordMeasurement { .. } => OperationKind::RecordMeasurement,
            Self::RecordWellResult { .. } => OperationKind::RecordWellResult,
            Self::RecordAnalysis { .. } => OperationKind::RecordAnalysis,
            Self::ReviewAnalysis { .. } => OperationKind::ReviewAnalysis,
            Self::RepairDocument { .. } => OperationKind::RepairDocument,
        }
    }
}

/// Ids touched by a successful (or divergent) write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteIds {
    /// Operation id (stamped on every document written)
    pub operation_id: Uuid,
    /// Entity the operation targeted
    pub primary: EntityRef,
    /// Entities created by the operation
    pub created: Vec<EntityRef>,
}

/// Structured side committed; some documents still pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergenceNotice {
    /// What was committed
    pub ids: WriteIds,
    /// Documents queued for repair
    pub pending: Vec<DocumentKey>,
    /// Last document-store error
    pub detail: String,
}

/// Why an operation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Error class
    pub class: ErrorClass,
    /// Human-readable message
    pub message: String,
}

impl From<&Error> for FailureReason {
    fn from(error: &Error) -> Self {
        Self {
            class: error.class(),
            message: error.to_string(),
        }
    }
}

impl From<Error> for FailureReason {
    fn from(error: Error) -> Self {
        Self::from(&error)
    }
}

/// Terminal result of `apply`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Both stores hold the write
    Ok(WriteIds),
    /// Structured committed, document queued for repair
    Divergent(DivergenceNotice),
    /// Nothing durable, or a post-commit failure (see audit)
    Failed(FailureReason),
}

impl Outcome {
    /// Failure from an error.
    #[must_use]
    pub fn failed(error: &Error) -> Self {
        Self::Failed(FailureReason::from(error))
    }

    /// Label for metrics: `ok`, `divergent`, `failed`
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Ok(_) => "ok",
            Self::Divergent(_) => "divergent",
            Self::Failed(_) => "failed",
        }
    }

    /// Whether both stores hold the write.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Whether the write is half-applied.
    #[must_use]
    pub const fn is_divergent(&self) -> bool {
        matches!(self, Self::Divergent(_))
    }

    /// Whether the operation failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Written ids, unless failed.
    #[must_use]
    pub const fn ids(&self) -> Option<&WriteIds> {
        match self {
            Self::Ok(ids) => Some(ids),
            Self::Divergent(notice) => Some(&notice.ids),
            Self::Failed(_) => None,
        }
    }

    /// Failure reason, if failed.
    #[must_use]
    pub const fn failure(&self) -> Option<&FailureReason> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Whether the dedup window may replay this outcome.
    #[must_use]
    pub const fn is_cacheable(&self) -> bool {
        !self.is_failed()
    }
}

/// Cooperative cancellation flag, honored before the structured commit.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_format() {
        let command: Command = serde_json::from_value(json!({
            "kind": "record_measurement",
            "well_id": "exp-1:A1",
            "payload": {"od600": 0.42}
        }))
        .unwrap();
        assert_eq!(command.kind(), OperationKind::RecordMeasurement);
    }

    #[test]
    fn test_outcome_labels() {
        let failed = Outcome::failed(&Error::Validation("bad".into()));
        assert_eq!(failed.label(), "failed");
        assert!(!failed.is_cacheable());
        assert_eq!(failed.failure().unwrap().class, ErrorClass::Validation);
        assert!(failed.ids().is_none());
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
