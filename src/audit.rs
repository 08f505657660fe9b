//! Append-only audit trail
//!
//! Every operation that reaches a terminal outcome leaves exactly one
//! [`AuditEntry`]. The sink assigns two sequences on append: a per-entity
//! counter (total order per entity) and a global counter.
//!
//! There is no update or delete path.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::entity::EntityRef;
use crate::error::StoreSide;
use crate::{Error, Result};

/// Kind of logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Register or update a user
    RegisterUser,
    /// Register a plate geometry
    RegisterPlateType,
    /// Create an experiment with its wells
    CreateExperiment,
    /// Move an experiment along its lifecycle
    UpdateStatus,
    /// Ingest a raw well measurement
    RecordMeasurement,
    /// Attach a per-well analysis result
    RecordWellResult,
    /// Record a model analysis over wells
    RecordAnalysis,
    /// Approve or reject an analysis
    ReviewAnalysis,
    /// Replay a document intent (reconciler)
    RepairDocument,
}

impl OperationKind {
    /// Stable label for logs and metrics
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RegisterUser => "register_user",
            Self::RegisterPlateType => "register_plate_type",
            Self::CreateExperiment => "create_experiment",
            Self::UpdateStatus => "update_status",
            Self::RecordMeasurement => "record_measurement",
            Self::RecordWellResult => "record_well_result",
            Self::RecordAnalysis => "record_analysis",
            Self::ReviewAnalysis => "review_analysis",
            Self::RepairDocument => "repair_document",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Both stores hold the write
    Complete,
    /// Structured committed, document pending repair
    Divergent,
    /// Operation failed
    Failed,
}

impl AuditOutcome {
    /// Default severity for this outcome
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::Complete => Severity::Info,
            Self::Divergent => Severity::Warning,
            Self::Failed => Severity::Error,
        }
    }
}

/// Entry severity (also used for alerts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Routine
    Info,
    /// Needs attention eventually
    Warning,
    /// Operation failed
    Error,
    /// Data corruption; operator required
    Critical,
}

/// Immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Per-entity sequence (assigned on append, starts at 1)
    pub sequence: u64,
    /// Global sequence (assigned on append, starts at 1)
    pub global_sequence: u64,
    /// Entity the operation targeted
    pub entity: EntityRef,
    /// Operation kind
    pub action: OperationKind,
    /// Terminal outcome
    pub outcome: AuditOutcome,
    /// Severity
    pub severity: Severity,
    /// State before the operation
    pub before: Option<Value>,
    /// State after the operation
    pub after: Option<Value>,
    /// Acting user id
    pub actor: String,
    /// Shared with the originating operation
    pub correlation_id: Uuid,
    /// Free-text detail (failure reason, divergent keys)
    pub detail: Option<String>,
    /// Append time
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Unsequenced entry; severity follows the outcome.
    #[must_use]
    pub fn new(
        entity: EntityRef,
        action: OperationKind,
        outcome: AuditOutcome,
        actor: impl Into<String>,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            sequence: 0,
            global_sequence: 0,
            entity,
            action,
            severity: outcome.severity(),
            outcome,
            before: None,
            after: None,
            actor: actor.into(),
            correlation_id,
            detail: None,
            recorded_at: Utc::now(),
        }
    }

    /// Attach snapshots.
    #[must_use]
    pub fn with_snapshots(mut self, before: Option<Value>, after: Option<Value>) -> Self {
        self.before = before;
        self.after = after;
        self
    }

    /// Attach detail text.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Override severity.
    #[must_use]
    pub const fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// Filter for audit queries. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Entity id
    pub entity_id: Option<String>,
    /// Acting user
    pub actor: Option<String>,
    /// Operation kind
    pub action: Option<OperationKind>,
    /// Outcome
    pub outcome: Option<AuditOutcome>,
    /// Inclusive lower bound
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound
    pub to: Option<DateTime<Utc>>,
}

impl AuditQuery {
    /// Match everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one entity id.
    #[must_use]
    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Restrict to one actor.
    #[must_use]
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Restrict to one action.
    #[must_use]
    pub const fn action(mut self, action: OperationKind) -> Self {
        self.action = Some(action);
        self
    }

    /// Restrict to one outcome.
    #[must_use]
    pub const fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Restrict to `[from, to)`.
    #[must_use]
    pub const fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    /// Whether an entry passes the filter.
    #[must_use]
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.entity_id.as_deref().map_or(true, |id| entry.entity.id == id)
            && self.actor.as_deref().map_or(true, |a| entry.actor == a)
            && self.action.map_or(true, |a| entry.action == a)
            && self.outcome.map_or(true, |o| entry.outcome == o)
            && self.from.map_or(true, |from| entry.recorded_at >= from)
            && self.to.map_or(true, |to| entry.recorded_at < to)
    }
}

/// Durable storage for audit entries.
pub trait AuditSink: Send + Sync {
    /// Persist an entry, assigning its sequences. Returns the stored entry.
    fn append(&self, entry: AuditEntry) -> impl Future<Output = Result<AuditEntry>> + Send;

    /// Entries matching the filter, in global order.
    fn entries(&self, query: &AuditQuery) -> impl Future<Output = Result<Vec<AuditEntry>>> + Send;
}

#[derive(Debug, Default)]
struct AuditTable {
    entries: Vec<AuditEntry>,
    per_entity: FxHashMap<EntityRef, u64>,
}

/// In-memory audit table.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    table: RwLock<AuditTable>,
    fail_next_appends: AtomicU32,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` appends fail (fault injection).
    pub fn fail_next_appends(&self, n: u32) {
        self.fail_next_appends.store(n, Ordering::SeqCst);
    }

    /// Total entries.
    pub async fn len(&self) -> usize {
        self.table.read().await.entries.len()
    }
}

impl AuditSink for MemoryAuditSink {
    async fn append(&self, mut entry: AuditEntry) -> Result<AuditEntry> {
        let injected = self
            .fail_next_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::transient(StoreSide::Audit, "injected append failure"));
        }

        let mut table = self.table.write().await;
        let sequence = {
            let counter = table.per_entity.entry(entry.entity.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        entry.sequence = sequence;
        entry.global_sequence = table.entries.len() as u64 + 1;
        entry.recorded_at = Utc::now();
        table.entries.push(entry.clone());
        Ok(entry)
    }

    async fn entries(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        Ok(self
            .table
            .read()
            .await
            .entries
            .iter()
            .filter(|entry| query.matches(entry))
            .cloned()
            .collect())
    }
}

/// Audit logger over a sink.
#[derive(Debug, Default)]
pub struct AuditLog<A: AuditSink = MemoryAuditSink> {
    sink: A,
}

impl<A: AuditSink> AuditLog<A> {
    /// Wrap a sink.
    pub const fn new(sink: A) -> Self {
        Self { sink }
    }

    /// Underlying sink.
    pub const fn sink(&self) -> &A {
        &self.sink
    }

    /// Append an entry. A failure here is unrecoverable for the operation.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corruption` wrapping the sink failure.
    pub async fn append(&self, entry: AuditEntry) -> Result<AuditEntry> {
        let entity = entry.entity.to_string();
        self.sink.append(entry).await.map_err(|e| Error::Corruption {
            entity,
            detail: format!("audit append failed: {e}"),
        })
    }

    /// Entries matching a filter.
    ///
    /// # Errors
    ///
    /// Propagates sink read failures.
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        self.sink.entries(query).await
    }

    /// Full trail for one entity id, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates sink read failures.
    pub async fn trail(&self, entity_id: &str) -> Result<Vec<AuditEntry>> {
        let mut entries = self.query(&AuditQuery::new().entity(entity_id)).await?;
        entries.sort_by_key(|e| e.global_sequence);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;

    fn entry(id: &str, action: OperationKind, outcome: AuditOutcome) -> AuditEntry {
        AuditEntry::new(
            EntityRef::new(EntityKind::Experiment, id),
            action,
            outcome,
            "user-1",
            Uuid::new_v4(),
        )
    }

    #[tokio::test]
    async fn test_sequences_per_entity() {
        let log = AuditLog::new(MemoryAuditSink::new());
        let a1 = log
            .append(entry("e1", OperationKind::CreateExperiment, AuditOutcome::Complete))
            .await
            .unwrap();
        let b1 = log
            .append(entry("e2", OperationKind::CreateExperiment, AuditOutcome::Complete))
            .await
            .unwrap();
        let a2 = log
            .append(entry("e1", OperationKind::UpdateStatus, AuditOutcome::Complete))
            .await
            .unwrap();

        assert_eq!((a1.sequence, a2.sequence, b1.sequence), (1, 2, 1));
        assert_eq!(a2.global_sequence, 3);

        let trail = log.trail("e1").await.unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[1].action, OperationKind::UpdateStatus);
    }

    #[tokio::test]
    async fn test_query_filters() {
        let log = AuditLog::new(MemoryAuditSink::new());
        log.append(entry("e1", OperationKind::RecordAnalysis, AuditOutcome::Divergent))
            .await
            .unwrap();
        log.append(entry("e1", OperationKind::RecordAnalysis, AuditOutcome::Complete))
            .await
            .unwrap();

        let divergent = log
            .query(&AuditQuery::new().outcome(AuditOutcome::Divergent))
            .await
            .unwrap();
        assert_eq!(divergent.len(), 1);
        assert_eq!(divergent[0].severity, Severity::Warning);

        let none = log.query(&AuditQuery::new().actor("someone-else")).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_append_failure_is_corruption() {
        let sink = MemoryAuditSink::new();
        sink.fail_next_appends(1);
        let log = AuditLog::new(sink);

        let err = log
            .append(entry("e1", OperationKind::UpdateStatus, AuditOutcome::Complete))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
        assert_eq!(log.sink().len().await, 0);
    }
}
