//! Document backend selection
//!
//! A closed set of backend variants resolved through the `DocumentStore`
//! capability, instead of open-ended runtime type lookup.

use chrono::{DateTime, Utc};

use super::{Document, DocumentKey, DocumentStore, FaultInjectingStore, FaultPlan, MemoryDocumentStore};
use crate::Result;

/// Supported document backends.
#[derive(Debug)]
pub enum DocumentBackend {
    /// Plain in-memory store
    Memory(MemoryDocumentStore),
    /// In-memory store behind a fault switchboard
    FaultInjecting(FaultInjectingStore<MemoryDocumentStore>),
}

impl DocumentBackend {
    /// In-memory backend.
    #[must_use]
    pub fn memory() -> Self {
        Self::Memory(MemoryDocumentStore::new())
    }

    /// In-memory backend with fault injection.
    #[must_use]
    pub fn fault_injecting() -> Self {
        Self::FaultInjecting(FaultInjectingStore::new(MemoryDocumentStore::new()))
    }

    /// Fault switchboard, if this backend has one.
    #[must_use]
    pub const fn faults(&self) -> Option<&FaultPlan> {
        match self {
            Self::Memory(_) => None,
            Self::FaultInjecting(store) => Some(store.plan()),
        }
    }

    /// Underlying memory store (for inspection/testing).
    #[must_use]
    pub const fn memory_store(&self) -> &MemoryDocumentStore {
        match self {
            Self::Memory(store) => store,
            Self::FaultInjecting(store) => store.inner(),
        }
    }

    /// Backend name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::FaultInjecting(_) => "memory+faults",
        }
    }
}

impl Default for DocumentBackend {
    fn default() -> Self {
        Self::memory()
    }
}

impl DocumentStore for DocumentBackend {
    async fn put(&self, document: Document) -> Result<()> {
        match self {
            Self::Memory(store) => store.put(document).await,
            Self::FaultInjecting(store) => store.put(document).await,
        }
    }

    async fn get(&self, key: &DocumentKey) -> Result<Option<Document>> {
        match self {
            Self::Memory(store) => store.get(key).await,
            Self::FaultInjecting(store) => store.get(key).await,
        }
    }

    async fn keys_since(&self, since: DateTime<Utc>) -> Result<Vec<DocumentKey>> {
        match self {
            Self::Memory(store) => store.keys_since(since).await,
            Self::FaultInjecting(store) => store.keys_since(since).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_fault_backend_has_plan() {
        assert!(DocumentBackend::memory().faults().is_none());
        assert!(DocumentBackend::fault_injecting().faults().is_some());
        assert_eq!(DocumentBackend::default().name(), "memory");
    }
}
