//! In-memory document store using `DashMap`.
//!
//! This is the default backend - data is lost on process restart.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

use super::{Document, DocumentKey, DocumentStore};
use crate::Result;

/// In-memory document store using a lock-free concurrent hashmap.
///
/// Thread-safe and optimized for high-concurrency read/write workloads.
///
/// # Example
///
/// ```rust
/// use labmix_store::entity::{EntityKind, EntityRef};
/// use labmix_store::store::{Document, DocumentStore, MemoryDocumentStore};
///
/// # async fn example() -> labmix_store::Result<()> {
/// let store = MemoryDocumentStore::new();
/// let key = EntityRef::new(EntityKind::Well, "exp-1:A1");
/// store.put(Document::new(key.clone(), serde_json::json!({"measurement": [0.4]}), uuid::Uuid::new_v4())).await?;
/// assert!(store.get(&key).await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryDocumentStore {
    documents: DashMap<DocumentKey, Document>,
}

impl MemoryDocumentStore {
    /// Create a new in-memory document store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
        }
    }

    /// Create with pre-allocated capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            documents: DashMap::with_capacity(capacity),
        }
    }

    /// Get the number of documents in the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Drop a document behind the coordinator's back (fault injection).
    pub fn remove_document(&self, key: &DocumentKey) -> Option<Document> {
        self.documents.remove(key).map(|(_, doc)| doc)
    }

    /// Replace a document body without refreshing its fingerprint
    /// (fault injection: simulates an out-of-band edit).
    pub fn overwrite_body(&self, key: &DocumentKey, body: Value) -> bool {
        self.documents.get_mut(key).is_some_and(|mut doc| {
            doc.body = body;
            true
        })
    }

    /// Insert a document that has no structured counterpart (fault injection).
    pub fn insert_orphan(&self, document: Document) {
        self.documents.insert(document.key.clone(), document);
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for MemoryDocumentStore {
    async fn put(&self, document: Document) -> Result<()> {
        self.documents.insert(document.key.clone(), document);
        Ok(())
    }

    async fn get(&self, key: &DocumentKey) -> Result<Option<Document>> {
        Ok(self.documents.get(key).map(|doc| doc.value().clone()))
    }

    async fn keys_since(&self, since: DateTime<Utc>) -> Result<Vec<DocumentKey>> {
        Ok(self
            .documents
            .iter()
            .filter(|entry| entry.value().written_at >= since)
            .map(|entry| entry.key().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityKind, EntityRef};
    use serde_json::json;
    use uuid::Uuid;

    fn doc(id: &str, body: Value) -> Document {
        Document::new(EntityRef::new(EntityKind::Experiment, id), body, Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_put_get() {
        let store = MemoryDocumentStore::new();
        store.put(doc("e1", json!({"protocol": {}}))).await.unwrap();

        let key = EntityRef::new(EntityKind::Experiment, "e1");
        let fetched = store.get(&key).await.unwrap().unwrap();
        assert!(fetched.is_intact());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_replaces() {
        let store = MemoryDocumentStore::new();
        store.put(doc("e1", json!({"v": 1}))).await.unwrap();
        store.put(doc("e1", json!({"v": 2}))).await.unwrap();

        let key = EntityRef::new(EntityKind::Experiment, "e1");
        assert_eq!(store.get(&key).await.unwrap().unwrap().body, json!({"v": 2}));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_tampering_breaks_fingerprint() {
        let store = MemoryDocumentStore::new();
        store.put(doc("e1", json!({"v": 1}))).await.unwrap();
        let key = EntityRef::new(EntityKind::Experiment, "e1");

        assert!(store.overwrite_body(&key, json!({"v": 99})));
        assert!(!store.get(&key).await.unwrap().unwrap().is_intact());
        assert!(!store.overwrite_body(&EntityRef::new(EntityKind::Well, "nope"), json!(null)));
    }

    #[tokio::test]
    async fn test_keys_since_and_batch_get() {
        let store = MemoryDocumentStore::new();
        let before = Utc::now();
        store.put(doc("a", json!(1))).await.unwrap();
        store.put(doc("b", json!(2))).await.unwrap();

        let mut keys = store.keys_since(before).await.unwrap();
        keys.sort();
        assert_eq!(keys.len(), 2);

        let missing = EntityRef::new(EntityKind::Experiment, "c");
        let results = store.batch_get(&[keys[0].clone(), missing]).await.unwrap();
        assert!(results[0].is_some());
        assert!(results[1].is_none());
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        use std::sync::Arc;

        let store = Arc::new(MemoryDocumentStore::new());
        let mut handles = vec![];

        for i in 0..100 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.put(doc(&format!("e{i}"), json!({"i": i}))).await.unwrap();
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.len(), 100);
    }
}
