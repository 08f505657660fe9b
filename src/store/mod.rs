//! Store Capabilities
//!
//! The two halves of every record live in engines that do not share a
//! transaction manager:
//! - [`StructuredStore`]: relational system of record. Headers, foreign keys,
//!   enum status fields, plus one *document intent* per document key (the
//!   body the document store is expected to hold, with its fingerprint).
//!   A [`StructuredBatch`] commits atomically.
//! - [`DocumentStore`]: free-form payload fragments keyed by entity, each
//!   stored with its content fingerprint.
//!
//! Both traits are async-first; every call is an I/O boundary the
//! coordinator wraps in a deadline.
//!
//! # Example
//!
//! ```rust,no_run
//! use labmix_store::entity::{EntityKind, EntityRef};
//! use labmix_store::store::{Document, DocumentStore, MemoryDocumentStore};
//!
//! # async fn example() -> labmix_store::Result<()> {
//! let store = MemoryDocumentStore::new();
//! let key = EntityRef::new(EntityKind::Experiment, "exp-1");
//! let doc = Document::new(key.clone(), serde_json::json!({"protocol": {"red": 40}}), uuid::Uuid::new_v4());
//!
//! store.put(doc).await?;
//! assert!(store.exists(&key).await?);
//! # Ok(())
//! # }
//! ```

mod backend;
mod faulty;
mod memory;
mod structured;

pub use backend::DocumentBackend;
pub use faulty::{FaultInjectingStore, FaultPlan};
pub use memory::MemoryDocumentStore;
pub use structured::MemoryStructuredStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use uuid::Uuid;

use crate::entity::{
    AnalysisRecord, EntityRef, ExperimentRecord, ExperimentStatus, PlateType, UserRecord, WellRecord,
};
use crate::fingerprint::fingerprint;
use crate::Result;

/// Documents are keyed by the entity they belong to.
pub type DocumentKey = EntityRef;

/// A payload fragment together with its content fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Owning entity
    pub key: DocumentKey,
    /// Free-form payload
    pub body: Value,
    /// `sha256:<hex>` over the canonical body
    pub fingerprint: String,
    /// Operation that produced this body
    pub operation_id: Uuid,
    /// When the body was produced
    pub written_at: DateTime<Utc>,
}

impl Document {
    /// Create a document, computing its fingerprint.
    #[must_use]
    pub fn new(key: DocumentKey, body: Value, operation_id: Uuid) -> Self {
        Self {
            fingerprint: fingerprint(&body),
            key,
            body,
            operation_id,
            written_at: Utc::now(),
        }
    }

    /// Whether the stored fingerprint still matches the body.
    #[must_use]
    pub fn is_intact(&self) -> bool {
        fingerprint(&self.body) == self.fingerprint
    }

    /// Read a top-level field of the body.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.body.get(name).filter(|v| !v.is_null())
    }
}

/// One mutation inside a structured transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredWrite {
    /// Insert or replace a user
    UpsertUser(UserRecord),
    /// Take one experiment from a user's quota, checked against the committed row
    ConsumeQuota {
        /// Quota owner
        user_id: String,
    },
    /// Insert a plate type (conflict if it exists)
    InsertPlateType(PlateType),
    /// Insert a new experiment header
    InsertExperiment(ExperimentRecord),
    /// Replace an existing experiment header
    UpdateExperiment(ExperimentRecord),
    /// Insert the wells of an experiment
    InsertWells(Vec<WellRecord>),
    /// Replace an existing well header
    UpdateWell(WellRecord),
    /// Insert a new analysis header
    InsertAnalysis(AnalysisRecord),
    /// Replace an existing analysis header
    UpdateAnalysis(AnalysisRecord),
    /// Record the expected document body for a key
    PutIntent(Document),
}

/// Writes committed together in one local transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuredBatch {
    writes: Vec<StructuredWrite>,
}

impl StructuredBatch {
    /// Create an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a write.
    pub fn push(&mut self, write: StructuredWrite) {
        self.writes.push(write);
    }

    /// Whether the batch has no writes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Number of writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Iterate over writes in order.
    pub fn iter(&self) -> std::slice::Iter<'_, StructuredWrite> {
        self.writes.iter()
    }
}

impl IntoIterator for StructuredBatch {
    type Item = StructuredWrite;
    type IntoIter = std::vec::IntoIter<StructuredWrite>;

    fn into_iter(self) -> Self::IntoIter {
        self.writes.into_iter()
    }
}

/// Per-status totals used by the aggregate view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    /// Experiment status
    pub status: ExperimentStatus,
    /// Experiments in this status
    pub experiments: u64,
    /// Wells belonging to those experiments
    pub wells: u64,
    /// Wells with a recorded measurement
    pub measured_wells: u64,
}

/// Relational system of record.
pub trait StructuredStore: Send + Sync {
    /// Apply every write atomically, or none of them.
    fn commit(&self, batch: StructuredBatch) -> impl Future<Output = Result<()>> + Send;

    /// Look up a user.
    fn user(&self, user_id: &str) -> impl Future<Output = Result<Option<UserRecord>>> + Send;

    /// Look up a plate type.
    fn plate_type(&self, plate_type_id: &str) -> impl Future<Output = Result<Option<PlateType>>> + Send;

    /// Look up an experiment header.
    fn experiment(&self, experiment_id: &str)
        -> impl Future<Output = Result<Option<ExperimentRecord>>> + Send;

    /// Look up a well header.
    fn well(&self, well_id: &str) -> impl Future<Output = Result<Option<WellRecord>>> + Send;

    /// All wells of an experiment, in plate order.
    fn wells_for_experiment(&self, experiment_id: &str)
        -> impl Future<Output = Result<Vec<WellRecord>>> + Send;

    /// Look up an analysis header.
    fn analysis(&self, analysis_id: &str) -> impl Future<Output = Result<Option<AnalysisRecord>>> + Send;

    /// All analyses of an experiment, oldest first.
    fn analyses_for_experiment(
        &self,
        experiment_id: &str,
    ) -> impl Future<Output = Result<Vec<AnalysisRecord>>> + Send;

    /// Expected document body for a key.
    fn intent(&self, key: &DocumentKey) -> impl Future<Output = Result<Option<Document>>> + Send;

    /// Keys whose intent was written at or after `since`.
    fn intents_since(&self, since: DateTime<Utc>) -> impl Future<Output = Result<Vec<DocumentKey>>> + Send;

    /// Per-status totals (`GROUP BY status`).
    fn status_counts(&self) -> impl Future<Output = Result<Vec<StatusCount>>> + Send;
}

/// Document store holding payload fragments.
pub trait DocumentStore: Send + Sync {
    /// Insert or replace the document for `document.key`.
    fn put(&self, document: Document) -> impl Future<Output = Result<()>> + Send;

    /// Fetch a document.
    fn get(&self, key: &DocumentKey) -> impl Future<Output = Result<Option<Document>>> + Send;

    /// Keys written at or after `since`.
    fn keys_since(&self, since: DateTime<Utc>) -> impl Future<Output = Result<Vec<DocumentKey>>> + Send;

    /// Check if a document exists.
    fn exists(&self, key: &DocumentKey) -> impl Future<Output = Result<bool>> + Send {
        async move { Ok(self.get(key).await?.is_some()) }
    }

    /// Fetch several documents. Missing keys return `None`.
    fn batch_get(
        &self,
        keys: &[DocumentKey],
    ) -> impl Future<Output = Result<Vec<Option<Document>>>> + Send {
        async move {
            let mut results = Vec::with_capacity(keys.len());
            for key in keys {
                results.push(self.get(key).await?);
            }
            Ok(results)
        }
    }
}
