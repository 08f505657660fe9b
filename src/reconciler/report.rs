//! Scan results and alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::audit::Severity;
use crate::store::DocumentKey;

/// Divergence classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    /// Intent committed, document absent
    MissingInDocument,
    /// Document present, no structured counterpart (corruption)
    MissingInStructured,
    /// Fingerprints disagree
    ContentMismatch,
    /// A coordinator write for the key is still in progress
    StalePendingRetry,
}

impl DivergenceKind {
    /// Stable label
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MissingInDocument => "missing_in_document",
            Self::MissingInStructured => "missing_in_structured",
            Self::ContentMismatch => "content_mismatch",
            Self::StalePendingRetry => "stale_pending_retry",
        }
    }

    /// Whether a repair replay can fix this class.
    #[must_use]
    pub const fn is_repairable(&self) -> bool {
        matches!(self, Self::MissingInDocument | Self::ContentMismatch)
    }
}

impl fmt::Display for DivergenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One divergent key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergenceDetail {
    /// Document key
    pub key: DocumentKey,
    /// Class
    pub kind: DivergenceKind,
    /// Intent fingerprint (structured side)
    pub expected_fingerprint: Option<String>,
    /// Recomputed document fingerprint
    pub actual_fingerprint: Option<String>,
    /// First detection
    pub detected_at: DateTime<Utc>,
    /// Fixed during this scan
    pub repaired: bool,
    /// Raised on the alert channel
    pub escalated: bool,
    /// Failed repairs so far
    pub repair_attempts: u32,
}

/// Result of one scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Scan start
    pub started_at: DateTime<Utc>,
    /// Scan end
    pub finished_at: DateTime<Utc>,
    /// Keys compared
    pub checked: usize,
    /// Keys that matched
    pub matched: usize,
    /// Keys that could not be read this time (retried next scan)
    pub deferred: usize,
    /// Divergences first seen in this scan
    pub detected: usize,
    /// Divergences escalated in this scan
    pub escalated: usize,
    /// Divergences found
    pub divergent: Vec<DivergenceDetail>,
}

impl ScanReport {
    /// Divergences repaired during the scan.
    #[must_use]
    pub fn repaired(&self) -> usize {
        self.divergent.iter().filter(|d| d.repaired).count()
    }

    /// Divergences still open after the scan (excluding in-flight writes).
    #[must_use]
    pub fn unresolved(&self) -> usize {
        self.divergent
            .iter()
            .filter(|d| !d.repaired && d.kind != DivergenceKind::StalePendingRetry)
            .count()
    }
}

/// Totals since a point in time plus the current backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// Lower bound of the summarized scans
    pub since: DateTime<Utc>,
    /// Scans finished since then
    pub scans: usize,
    /// Keys compared
    pub checked: usize,
    /// Keys that matched
    pub matched: usize,
    /// Divergences detected (excluding in-flight)
    pub detected: usize,
    /// Divergences repaired
    pub repaired: usize,
    /// Divergences escalated
    pub escalated: usize,
    /// Divergences not yet resolved
    pub outstanding: Vec<DivergenceDetail>,
}

impl ConsistencyReport {
    /// Whether both stores currently agree on everything scanned.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.outstanding.is_empty()
    }
}

/// Notification for the external alerting consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Severity
    pub severity: Severity,
    /// Affected key
    pub key: DocumentKey,
    /// Divergence class
    pub class: DivergenceKind,
    /// Description
    pub message: String,
    /// Raise time
    pub raised_at: DateTime<Utc>,
}
