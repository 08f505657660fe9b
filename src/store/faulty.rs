//! Fault-injecting document store wrapper
//!
//! Wraps any `DocumentStore` and turns calls into transient failures on
//! demand. Used to rehearse outages: the coordinator must end in
//! `Divergent`, the reconciler must repair once the outage clears.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::{Document, DocumentKey, DocumentStore};
use crate::error::StoreSide;
use crate::{Error, Result};

/// Switchboard shared by a [`FaultInjectingStore`].
#[derive(Debug, Default)]
pub struct FaultPlan {
    outage: AtomicBool,
    fail_next_puts: AtomicU32,
    latency_ms: AtomicU64,
    injected: AtomicU64,
}

impl FaultPlan {
    /// Create a plan with no faults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call until cleared.
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    /// Whether the outage switch is on.
    #[must_use]
    pub fn is_down(&self) -> bool {
        self.outage.load(Ordering::SeqCst)
    }

    /// Fail the next `n` puts, then recover.
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_next_puts.store(n, Ordering::SeqCst);
    }

    /// Delay every call (exercises per-call deadlines).
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of failures injected so far.
    #[must_use]
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    fn latency(&self) -> Option<Duration> {
        match self.latency_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn check_read(&self) -> Result<()> {
        if self.is_down() {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(Error::transient(StoreSide::Document, "injected outage"));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        self.check_read()?;
        let consumed = self
            .fail_next_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(Error::transient(StoreSide::Document, "injected write failure"));
        }
        Ok(())
    }
}

/// Fault-injecting wrapper around a document store.
///
/// # Example
///
/// ```rust,no_run
/// use labmix_store::store::{FaultInjectingStore, MemoryDocumentStore};
///
/// let store = FaultInjectingStore::new(MemoryDocumentStore::new());
/// store.plan().set_outage(true);
/// // every put/get now fails with a transient document-store error
/// ```
#[derive(Debug)]
pub struct FaultInjectingStore<S: DocumentStore> {
    inner: S,
    plan: FaultPlan,
}

impl<S: DocumentStore> FaultInjectingStore<S> {
    /// Wrap a store with an empty fault plan.
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            plan: FaultPlan::new(),
        }
    }

    /// Get reference to inner store (for inspection/testing)
    #[must_use]
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    /// Get the fault switchboard.
    #[must_use]
    pub const fn plan(&self) -> &FaultPlan {
        &self.plan
    }

    async fn delay(&self) {
        if let Some(latency) = self.plan.latency() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl<S: DocumentStore> DocumentStore for FaultInjectingStore<S> {
    async fn put(&self, document: Document) -> Result<()> {
        self.delay().await;
        self.plan.check_write()?;
        self.inner.put(document).await
    }

    async fn get(&self, key: &DocumentKey) -> Result<Option<Document>> {
        self.delay().await;
        self.plan.check_read()?;
        self.inner.get(key).await
    }

    async fn keys_since(&self, since: DateTime<Utc>) -> Result<Vec<DocumentKey>> {
        self.plan.check_read()?;
        self.inner.keys_since(since).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityKind, EntityRef};
    use crate::store::MemoryDocumentStore;
    use uuid::Uuid;

    fn doc() -> Document {
        Document::new(
            EntityRef::new(EntityKind::Analysis, "an-1"),
            serde_json::json!({"output": [1, 2, 3]}),
            Uuid::new_v4(),
        )
    }

    #[tokio::test]
    async fn test_passthrough_without_faults() {
        let store = FaultInjectingStore::new(MemoryDocumentStore::new());
        store.put(doc()).await.unwrap();
        assert_eq!(store.inner().len(), 1);
        assert_eq!(store.plan().injected(), 0);
    }

    #[tokio::test]
    async fn test_outage_blocks_reads_and_writes() {
        let store = FaultInjectingStore::new(MemoryDocumentStore::new());
        store.plan().set_outage(true);

        assert!(store.put(doc()).await.unwrap_err().is_transient());
        assert!(store.get(&doc().key).await.is_err());
        assert!(store.inner().is_empty());

        store.plan().set_outage(false);
        store.put(doc()).await.unwrap();
        assert_eq!(store.plan().injected(), 2);
    }

    #[tokio::test]
    async fn test_fail_next_puts_recovers() {
        let store = FaultInjectingStore::new(MemoryDocumentStore::new());
        store.plan().fail_next_puts(2);

        assert!(store.put(doc()).await.is_err());
        assert!(store.put(doc()).await.is_err());
        store.put(doc()).await.unwrap();
        assert_eq!(store.inner().len(), 1);
    }
}
