//! Experiment Record - root entity of a liquid-mixing run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Lifecycle of an experiment.
///
/// `pending → running → completed | failed`, plus `pending → failed` for runs
/// aborted before the device started. Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// Created, waiting for the workflow engine.
    Pending,
    /// Device is executing the protocol.
    Running,
    /// Run finished successfully.
    Completed,
    /// Run failed with an error.
    Failed,
}

impl ExperimentStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [Self; 4] = [Self::Pending, Self::Running, Self::Completed, Self::Failed];

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Failed)
                | (Self::Running, Self::Completed | Self::Failed)
        )
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured header of an experiment.
///
/// Protocol parameters and the result payload are document fragments and are
/// not part of this record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExperimentRecord {
    experiment_id: String,
    user_id: String,
    plate_type_id: String,
    status: ExperimentStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    error_message: Option<String>,
}

impl ExperimentRecord {
    /// Create a new experiment header in `Pending` status.
    #[must_use]
    pub fn new(
        experiment_id: impl Into<String>,
        user_id: impl Into<String>,
        plate_type_id: impl Into<String>,
    ) -> Self {
        ExperimentRecordBuilder::new(experiment_id, user_id, plate_type_id).build()
    }

    /// Create a builder for constructing a header with optional fields.
    #[must_use]
    pub fn builder(
        experiment_id: impl Into<String>,
        user_id: impl Into<String>,
        plate_type_id: impl Into<String>,
    ) -> ExperimentRecordBuilder {
        ExperimentRecordBuilder::new(experiment_id, user_id, plate_type_id)
    }

    /// Get the experiment ID.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Get the owning user ID.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Get the plate type ID.
    #[must_use]
    pub fn plate_type_id(&self) -> &str {
        &self.plate_type_id
    }

    /// Get the current status.
    #[must_use]
    pub const fn status(&self) -> ExperimentStatus {
        self.status
    }

    /// Get the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Get the start timestamp, if the run has started.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Get the completion timestamp, if the run reached a terminal state.
    #[must_use]
    pub const fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Get the last-modified timestamp.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Get the error message of a failed run.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Move to `next`, stamping `started_at` / `completed_at`.
    ///
    /// # Errors
    ///
    /// Returns `IllegalTransition` if the move is not monotonic
    pub fn transition(&mut self, next: ExperimentStatus, error_message: Option<String>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                entity: self.experiment_id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        if next == ExperimentStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        if next == ExperimentStatus::Failed {
            self.error_message = error_message;
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Bump `updated_at` after a payload-only change.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Builder for `ExperimentRecord`.
#[derive(Debug)]
pub struct ExperimentRecordBuilder {
    experiment_id: String,
    user_id: String,
    plate_type_id: String,
    created_at: DateTime<Utc>,
}

impl ExperimentRecordBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(
        experiment_id: impl Into<String>,
        user_id: impl Into<String>,
        plate_type_id: impl Into<String>,
    ) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            user_id: user_id.into(),
            plate_type_id: plate_type_id.into(),
            created_at: Utc::now(),
        }
    }

    /// Set a custom creation timestamp (useful for deserialization/testing).
    #[must_use]
    pub const fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Build the `ExperimentRecord`.
    #[must_use]
    pub fn build(self) -> ExperimentRecord {
        ExperimentRecord {
            experiment_id: self.experiment_id,
            user_id: self.user_id,
            plate_type_id: self.plate_type_id,
            status: ExperimentStatus::Pending,
            created_at: self.created_at,
            started_at: None,
            completed_at: None,
            updated_at: self.created_at,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_experiment_starts_pending() {
        let record = ExperimentRecord::new("exp-1", "user-1", "plate-96");
        assert_eq!(record.status(), ExperimentStatus::Pending);
        assert_eq!(record.created_at(), record.updated_at());
    }

    #[test]
    fn test_lifecycle_stamps_timestamps() {
        let mut record = ExperimentRecord::new("exp-1", "user-1", "plate-96");
        record.transition(ExperimentStatus::Running, None).unwrap();
        assert!(record.started_at().is_some());
        assert!(record.completed_at().is_none());

        record
            .transition(ExperimentStatus::Failed, Some("tip pickup failed".into()))
            .unwrap();
        assert!(record.completed_at().is_some());
        assert_eq!(record.error_message(), Some("tip pickup failed"));
    }

    #[test]
    fn test_no_backwards_transition() {
        let mut record = ExperimentRecord::new("exp-1", "user-1", "plate-96");
        record.transition(ExperimentStatus::Running, None).unwrap();
        record.transition(ExperimentStatus::Completed, None).unwrap();

        for next in ExperimentStatus::ALL {
            assert!(record.transition(next, None).is_err());
        }
        assert_eq!(record.status(), ExperimentStatus::Completed);
    }

    #[test]
    fn test_pending_cannot_complete() {
        assert!(!ExperimentStatus::Pending.can_transition_to(ExperimentStatus::Completed));
        assert!(ExperimentStatus::Pending.can_transition_to(ExperimentStatus::Failed));
        assert!(!ExperimentStatus::Running.can_transition_to(ExperimentStatus::Running));
    }
}
