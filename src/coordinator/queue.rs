//! Document keys waiting for out-of-band repair.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::store::DocumentKey;

/// Why a key was queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairTicket {
    /// Operation that left the key divergent
    pub operation_id: Uuid,
    /// Last document-store error
    pub reason: String,
    /// First enqueue time
    pub enqueued_at: DateTime<Utc>,
}

/// Set of keys the reconciler must look at on its next scan.
#[derive(Debug, Default)]
pub struct RepairQueue {
    pending: DashMap<DocumentKey, RepairTicket>,
}

impl RepairQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a key; an existing ticket keeps its enqueue time.
    pub fn enqueue(&self, key: DocumentKey, operation_id: Uuid, reason: impl Into<String>) {
        let reason = reason.into();
        self.pending
            .entry(key)
            .and_modify(|ticket| {
                ticket.operation_id = operation_id;
                ticket.reason.clone_from(&reason);
            })
            .or_insert_with(|| RepairTicket {
                operation_id,
                reason: reason.clone(),
                enqueued_at: Utc::now(),
            });
    }

    /// Take every queued key.
    #[must_use]
    pub fn drain(&self) -> Vec<(DocumentKey, RepairTicket)> {
        let keys: Vec<DocumentKey> = self.pending.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.pending.remove(&key))
            .collect()
    }

    /// Queued keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityKind, EntityRef};

    #[test]
    fn test_enqueue_dedups_and_drain_empties() {
        let queue = RepairQueue::new();
        let key = EntityRef::new(EntityKind::Analysis, "an-1");
        queue.enqueue(key.clone(), Uuid::new_v4(), "timeout");
        queue.enqueue(key.clone(), Uuid::new_v4(), "refused");
        assert_eq!(queue.len(), 1);

        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1.reason, "refused");
        assert!(queue.is_empty());
    }
}
