//! Analysis Record - derived ML output attached to an experiment

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Human review state of an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Awaiting review.
    Pending,
    /// Accepted by a reviewer.
    Approved,
    /// Rejected by a reviewer.
    Rejected,
}

impl ReviewStatus {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured header of an analysis. Model input and output payloads are
/// document fragments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisRecord {
    analysis_id: String,
    experiment_id: String,
    model_version: String,
    review_status: ReviewStatus,
    reviewer: Option<String>,
    created_at: DateTime<Utc>,
    reviewed_at: Option<DateTime<Utc>>,
}

impl AnalysisRecord {
    /// Create a pending analysis.
    #[must_use]
    pub fn new(
        analysis_id: impl Into<String>,
        experiment_id: impl Into<String>,
        model_version: impl Into<String>,
    ) -> Self {
        Self {
            analysis_id: analysis_id.into(),
            experiment_id: experiment_id.into(),
            model_version: model_version.into(),
            review_status: ReviewStatus::Pending,
            reviewer: None,
            created_at: Utc::now(),
            reviewed_at: None,
        }
    }

    /// Get the analysis ID.
    #[must_use]
    pub fn analysis_id(&self) -> &str {
        &self.analysis_id
    }

    /// Get the parent experiment ID.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Get the model/version identifier.
    #[must_use]
    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    /// Get the review status.
    #[must_use]
    pub const fn review_status(&self) -> ReviewStatus {
        self.review_status
    }

    /// Get the reviewer, once reviewed.
    #[must_use]
    pub fn reviewer(&self) -> Option<&str> {
        self.reviewer.as_deref()
    }

    /// Get the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Get the review timestamp.
    #[must_use]
    pub const fn reviewed_at(&self) -> Option<DateTime<Utc>> {
        self.reviewed_at
    }

    /// Record a review decision. Reviewed analyses are immutable.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the decision is `Pending` or the analysis was
    /// already reviewed
    pub fn review(&mut self, decision: ReviewStatus, reviewer: impl Into<String>) -> Result<()> {
        if decision == ReviewStatus::Pending {
            return Err(Error::Validation("review decision must be approved or rejected".into()));
        }
        if self.review_status != ReviewStatus::Pending {
            return Err(Error::Validation(format!(
                "analysis {} already reviewed ({})",
                self.analysis_id, self.review_status
            )));
        }
        self.review_status = decision;
        self.reviewer = Some(reviewer.into());
        self.reviewed_at = Some(Utc::now());
        Ok(())
    }
}
