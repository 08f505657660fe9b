//! Write Coordinator
//!
//! Applies one logical write to both stores as a saga:
//!
//! ```text
//! validate ─► dedup ─► lock root ─► plan ─► [cancel?] ─► structured commit
//!                                                            │
//!        audit ◄── lineage ◄── document writes (retry) ◄─────┘
//! ```
//!
//! The structured store is the durable anchor. A document write that still
//! fails after retries is never undone on the structured side: the outcome
//! is `Divergent`, the key goes on the repair queue, and the reconciler
//! replays the intent later.
//!
//! Same-experiment operations serialize on a keyed mutex; different
//! experiments run concurrently.

mod dedup;
mod locks;
mod operation;
mod plan;
mod queue;
mod retry;

pub use dedup::{DedupHit, DedupWindow};
pub use locks::{InFlight, InFlightGuard, KeyedGuard, KeyedLocks};
pub use operation::{
    CancelToken, Command, DivergenceNotice, FailureReason, Operation, Outcome, WriteIds,
};
pub use plan::{experiment_of_well, resolve_root, Plan, Root};
pub use queue::{RepairQueue, RepairTicket};
pub use retry::RetryPolicy;

pub use crate::audit::OperationKind;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLog, AuditOutcome, AuditSink, MemoryAuditSink};
use crate::config::EngineConfig;
use crate::entity::EntityRef;
use crate::error::StoreSide;
use crate::fingerprint::fingerprint_of;
use crate::lineage::LineageTracker;
use crate::metrics::Metrics;
use crate::pool::ConnectionPool;
use crate::store::{Document, DocumentKey, DocumentStore, StructuredBatch, StructuredStore};
use crate::{Error, Result};

/// Published after every structured commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Committing operation
    pub operation_id: Uuid,
    /// Operation kind
    pub kind: OperationKind,
    /// Targeted entity
    pub entity: EntityRef,
    /// Commit time
    pub committed_at: DateTime<Utc>,
}

const CHANGE_FEED_CAPACITY: usize = 1024;

/// Dual-write coordinator.
#[derive(Debug)]
pub struct WriteCoordinator<S, D, A = MemoryAuditSink>
where
    S: StructuredStore,
    D: DocumentStore,
    A: AuditSink,
{
    structured: Arc<S>,
    documents: Arc<D>,
    audit: Arc<AuditLog<A>>,
    lineage: Arc<LineageTracker>,
    metrics: Arc<Metrics>,
    retry: RetryPolicy,
    structured_pool: ConnectionPool,
    document_pool: ConnectionPool,
    dedup: DedupWindow,
    key_locks: KeyedLocks,
    root_locks: KeyedLocks,
    in_flight: InFlight,
    halted: DashMap<String, String>,
    repairs: RepairQueue,
    changes: broadcast::Sender<ChangeEvent>,
}

/// Result of the document phase.
struct DocumentPhase {
    pending: Vec<DocumentKey>,
    last_error: Option<String>,
}

impl<S, D, A> WriteCoordinator<S, D, A>
where
    S: StructuredStore,
    D: DocumentStore,
    A: AuditSink,
{
    /// Wire a coordinator over the given stores.
    pub fn new(
        structured: Arc<S>,
        documents: Arc<D>,
        audit: Arc<AuditLog<A>>,
        lineage: Arc<LineageTracker>,
        config: &EngineConfig,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            structured,
            documents,
            audit,
            lineage,
            metrics: Arc::new(Metrics::new()),
            retry: RetryPolicy::from(&config.retry),
            structured_pool: ConnectionPool::new(
                StoreSide::Structured,
                config.pools.structured_connections,
                config.pools.acquire_timeout(),
            ),
            document_pool: ConnectionPool::new(
                StoreSide::Document,
                config.pools.document_connections,
                config.pools.acquire_timeout(),
            ),
            dedup: DedupWindow::new(config.dedup.capacity, config.dedup.ttl()),
            key_locks: KeyedLocks::new(),
            root_locks: KeyedLocks::new(),
            in_flight: InFlight::new(),
            halted: DashMap::new(),
            repairs: RepairQueue::new(),
            changes,
        }
    }

    /// Apply an operation.
    pub async fn apply(&self, operation: Operation) -> Outcome {
        self.apply_with_cancel(operation, &CancelToken::new()).await
    }

    /// Apply an operation, honoring `cancel` until the structured commit.
    pub async fn apply_with_cancel(&self, operation: Operation, cancel: &CancelToken) -> Outcome {
        let kind = operation.kind();
        let outcome = self.execute(&operation, cancel).await;
        self.metrics.record_operation(kind.as_str(), outcome.label());
        match &outcome {
            Outcome::Ok(_) => debug!(key = %operation.idempotency_key, operation = %kind, "Operation complete"),
            Outcome::Divergent(notice) => warn!(
                key = %operation.idempotency_key,
                operation = %kind,
                pending = notice.pending.len(),
                "Operation divergent; queued for repair"
            ),
            Outcome::Failed(reason) => info!(
                key = %operation.idempotency_key,
                operation = %kind,
                class = ?reason.class,
                reason = %reason.message,
                "Operation failed"
            ),
        }
        outcome
    }

    async fn execute(&self, operation: &Operation, cancel: &CancelToken) -> Outcome {
        if let Err(e) = validate_envelope(operation) {
            return Outcome::failed(&e);
        }

        let _key_guard = self.key_locks.lock(&operation.idempotency_key).await;
        let request_fingerprint = match fingerprint_of(&operation.command) {
            Ok(fp) => fp,
            Err(e) => return Outcome::failed(&e),
        };
        if let Some(hit) = self.dedup.lookup(&operation.idempotency_key).await {
            if hit.request_fingerprint == request_fingerprint {
                debug!(key = %operation.idempotency_key, "Idempotent replay");
                return hit.outcome;
            }
            return Outcome::failed(&Error::Validation(format!(
                "idempotency key {} was used for a different request",
                operation.idempotency_key
            )));
        }

        let root = match resolve_root(self.structured.as_ref(), &operation.command).await {
            Ok(root) => root,
            Err(e) => return Outcome::failed(&e),
        };
        let _root_guard = self.root_locks.lock(&root.lock_key()).await;
        if let Some(reason) = self.root_halt_reason(&root) {
            return Outcome::failed(&Error::Corruption {
                entity: root.to_string(),
                detail: reason,
            });
        }

        let outcome = self.execute_locked(operation, &root, cancel).await;
        if outcome.is_cacheable() {
            self.dedup
                .remember(&operation.idempotency_key, &request_fingerprint, &outcome)
                .await;
        }
        outcome
    }

    async fn execute_locked(&self, operation: &Operation, root: &Root, cancel: &CancelToken) -> Outcome {
        let operation_id = Uuid::new_v4();
        let mut plan = match plan::plan(self.structured.as_ref(), &operation.command, operation_id).await {
            Ok(plan) => plan,
            Err(e) => return Outcome::failed(&e),
        };
        for edge in &plan.edges {
            if self.lineage.would_cycle(&edge.source, &edge.target).await {
                return Outcome::failed(&Error::CycleDetected {
                    from_artifact: edge.source.to_string(),
                    to_artifact: edge.target.to_string(),
                });
            }
        }

        if cancel.is_cancelled() {
            return Outcome::failed(&Error::Cancelled);
        }

        let _in_flight = self.in_flight.enter(plan.document_keys());
        if let Err(e) = self.commit(std::mem::take(&mut plan.batch)).await {
            error!(root = %root, operation = %operation.kind(), error = %e, "Structured commit failed");
            let entry = audit_entry(operation, &plan.primary, AuditOutcome::Failed)
                .with_detail(format!("structured commit failed: {e}"));
            return self.finish(root, entry, Outcome::failed(&e)).await;
        }

        let _ = self.changes.send(ChangeEvent {
            operation_id,
            kind: operation.kind(),
            entity: plan.primary.clone(),
            committed_at: Utc::now(),
        });

        let documents = self.write_documents(&plan.documents).await;
        let ids = WriteIds {
            operation_id,
            primary: plan.primary.clone(),
            created: plan.created.clone(),
        };

        let lineage_error = if plan.edges.is_empty() {
            None
        } else {
            self.lineage.record_batch(std::mem::take(&mut plan.edges)).await.err()
        };

        for key in &documents.pending {
            self.repairs.enqueue(
                key.clone(),
                operation_id,
                documents.last_error.clone().unwrap_or_default(),
            );
        }

        let (entry, outcome) = if let Some(e) = lineage_error {
            let entry = audit_entry(operation, &plan.primary, AuditOutcome::Failed)
                .with_detail(format!("lineage rejected after commit: {e}"));
            (entry, Outcome::failed(&e))
        } else if documents.pending.is_empty() {
            (audit_entry(operation, &plan.primary, AuditOutcome::Complete), Outcome::Ok(ids))
        } else {
            let detail = documents
                .last_error
                .unwrap_or_else(|| "document write failed".to_string());
            let pending: Vec<String> = documents.pending.iter().map(ToString::to_string).collect();
            let entry = audit_entry(operation, &plan.primary, AuditOutcome::Divergent)
                .with_detail(format!("pending documents [{}]: {detail}", pending.join(", ")));
            let notice = DivergenceNotice {
                ids,
                pending: documents.pending,
                detail,
            };
            (entry, Outcome::Divergent(notice))
        };
        let entry = entry.with_snapshots(plan.before, plan.after);
        self.finish(root, entry, outcome).await
    }

    /// Append the audit entry; an append failure halts the root.
    async fn finish(&self, root: &Root, entry: AuditEntry, outcome: Outcome) -> Outcome {
        match self.audit.append(entry).await {
            Ok(_) => outcome,
            Err(e) => {
                self.halt(root, &e.to_string());
                Outcome::failed(&e)
            }
        }
    }

    async fn commit(&self, batch: StructuredBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let result = self
            .retry
            .run(StoreSide::Structured, "commit", |_| {
                let batch = batch.clone();
                async move {
                    let _conn = self.structured_pool.acquire().await?;
                    self.structured.commit(batch).await
                }
            })
            .await;
        self.metrics.record_latency(StoreSide::Structured, started.elapsed());
        result
    }

    async fn write_documents(&self, documents: &[Document]) -> DocumentPhase {
        let mut phase = DocumentPhase {
            pending: Vec::new(),
            last_error: None,
        };
        for document in documents {
            let started = Instant::now();
            let result = self
                .retry
                .run(StoreSide::Document, "put", |attempt| {
                    let document = document.clone();
                    async move {
                        let _conn = self.document_pool.acquire().await?;
                        debug!(key = %document.key, attempt, "Writing document");
                        self.documents.put(document).await
                    }
                })
                .await;
            self.metrics.record_latency(StoreSide::Document, started.elapsed());
            if let Err(e) = result {
                warn!(key = %document.key, error = %e, "Document write exhausted retries");
                phase.pending.push(document.key.clone());
                phase.last_error = Some(e.to_string());
            }
        }
        phase
    }

    /// Halt every write under a root until it is resumed.
    pub fn halt(&self, root: &Root, reason: &str) {
        error!(root = %root, reason, "Halting root: operator intervention required");
        self.halted.insert(root.lock_key(), reason.to_string());
    }

    /// Halt an experiment by id.
    pub fn halt_experiment(&self, experiment_id: &str, reason: &str) {
        self.halt(&Root::Experiment(experiment_id.to_string()), reason);
    }

    /// Lift a halt on any root. Returns whether it was halted.
    pub fn resume_root(&self, root: &Root) -> bool {
        let resumed = self.halted.remove(&root.lock_key()).is_some();
        if resumed {
            info!(root = %root, "Root resumed by operator");
        }
        resumed
    }

    /// Lift a halt on an experiment. Returns whether it was halted.
    pub fn resume(&self, experiment_id: &str) -> bool {
        self.resume_root(&Root::Experiment(experiment_id.to_string()))
    }

    /// Why a root is halted, if it is.
    #[must_use]
    pub fn root_halt_reason(&self, root: &Root) -> Option<String> {
        self.halted.get(&root.lock_key()).map(|reason| reason.value().clone())
    }

    /// Why an experiment is halted, if it is.
    #[must_use]
    pub fn halt_reason(&self, experiment_id: &str) -> Option<String> {
        self.root_halt_reason(&Root::Experiment(experiment_id.to_string()))
    }

    /// Whether a write to `key` is in progress.
    #[must_use]
    pub fn is_in_flight(&self, key: &DocumentKey) -> bool {
        self.in_flight.contains(key)
    }

    /// Take the keys queued for repair.
    #[must_use]
    pub fn drain_repairs(&self) -> Vec<(DocumentKey, RepairTicket)> {
        self.repairs.drain()
    }

    /// Keys currently queued for repair.
    #[must_use]
    pub fn pending_repairs(&self) -> usize {
        self.repairs.len()
    }

    /// Subscribe to the change feed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Structured store.
    #[must_use]
    pub const fn structured(&self) -> &Arc<S> {
        &self.structured
    }

    /// Document store.
    #[must_use]
    pub const fn documents(&self) -> &Arc<D> {
        &self.documents
    }

    /// Audit log.
    #[must_use]
    pub const fn audit(&self) -> &Arc<AuditLog<A>> {
        &self.audit
    }

    /// Lineage tracker.
    #[must_use]
    pub const fn lineage(&self) -> &Arc<LineageTracker> {
        &self.lineage
    }

    /// Metrics counters.
    #[must_use]
    pub const fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Retry policy in effect.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}

fn audit_entry(operation: &Operation, entity: &EntityRef, outcome: AuditOutcome) -> AuditEntry {
    AuditEntry::new(
        entity.clone(),
        operation.kind(),
        outcome,
        operation.actor.as_str(),
        operation.correlation_id,
    )
}

fn validate_envelope(operation: &Operation) -> Result<()> {
    if operation.idempotency_key.trim().is_empty() {
        return Err(Error::Validation("idempotency key must not be empty".into()));
    }
    if operation.actor.trim().is_empty() {
        return Err(Error::Validation("actor must not be empty".into()));
    }
    Ok(())
}
