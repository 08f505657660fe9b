//! Error types for labmix-store
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Which side of the dual write an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreSide {
    /// Relational store (system of record)
    Structured,
    /// Document store (payload fragments)
    Document,
    /// Audit trail
    Audit,
}

impl StoreSide {
    /// Label used in logs and metrics
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::Document => "document",
            Self::Audit => "audit",
        }
    }
}

impl fmt::Display for StoreSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// labmix-store error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing fields; rejected before any store is touched
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Timeout, connection refusal, deadlock: retried per policy
    #[error("Transient {store} store error: {message}")]
    TransientStore {
        /// Store that failed
        store: StoreSide,
        /// Underlying failure
        message: String,
    },

    /// One store committed, the other did not after retries
    #[error("Divergence on {key}: {detail}\nQueued for reconciliation.")]
    Divergence {
        /// Document key left half-applied
        key: String,
        /// What went wrong
        detail: String,
    },

    /// Lineage edge would violate the DAG invariant
    #[error("Lineage cycle detected: edge {from_artifact} -> {to_artifact} would close a cycle")]
    CycleDetected {
        /// Proposed edge source
        from_artifact: String,
        /// Proposed edge target
        to_artifact: String,
    },

    /// Anchor store missing data, or audit append failed irrecoverably (fatal)
    #[error("Data corruption on {entity}: {detail}\nProcessing halted. Manual operator intervention required.")]
    Corruption {
        /// Affected entity or root experiment
        entity: String,
        /// What was observed
        detail: String,
    },

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Status change that would move an entity backwards
    #[error("Illegal status transition for {entity}: {from} -> {to}")]
    IllegalTransition {
        /// Entity id
        entity: String,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Caller cancelled before the structured commit
    #[error("Operation cancelled before structured commit")]
    Cancelled,

    /// Storage error (conflicts, constraint violations)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Arrow error (aggregate view)
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Coarse error taxonomy carried in operation outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Rejected at the boundary
    Validation,
    /// Retryable store failure
    Transient,
    /// Half-applied write
    Divergence,
    /// Lineage cycle
    CycleDetected,
    /// Fatal data corruption
    Corruption,
    /// Cancelled by caller
    Cancelled,
    /// Anything else
    Internal,
}

impl Error {
    /// Create a transient error for the given store.
    pub fn transient(store: StoreSide, message: impl Into<String>) -> Self {
        Self::TransientStore {
            store,
            message: message.into(),
        }
    }

    /// Whether the retry policy should try again.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore { .. })
    }

    /// Classify into the outcome taxonomy.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) | Self::NotFound(_) | Self::IllegalTransition { .. } => {
                ErrorClass::Validation
            }
            Self::TransientStore { .. } => ErrorClass::Transient,
            Self::Divergence { .. } => ErrorClass::Divergence,
            Self::CycleDetected { .. } => ErrorClass::CycleDetected,
            Self::Corruption { .. } => ErrorClass::Corruption,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::StorageError(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Arrow(_)
            | Self::Other(_) => ErrorClass::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let err = Error::transient(StoreSide::Document, "connection refused");
        assert!(err.is_transient());
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.to_string().contains("document"));
    }

    #[test]
    fn test_validation_family() {
        assert_eq!(Error::NotFound("x".into()).class(), ErrorClass::Validation);
        let err = Error::IllegalTransition {
            entity: "exp-1".into(),
            from: "completed".into(),
            to: "running".into(),
        };
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(!err.is_transient());
    }
}
