//! Keyed async mutexes.
//!
//! One mutex per key, created on first use and removed when the last holder
//! or waiter lets go, so the map only holds keys that are contended right
//! now.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::store::DocumentKey;

/// Map of per-key mutexes.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held key; releases (and prunes) on drop.
#[derive(Debug)]
pub struct KeyedGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    /// Create an empty lock map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `key`.
    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let mutex = Arc::clone(self.locks.entry(key.to_string()).or_default().value());
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            locks: &self.locks,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Keys currently held or awaited.
    #[must_use]
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Reference counts of document keys with a write in progress.
#[derive(Debug, Default)]
pub struct InFlight {
    keys: DashMap<DocumentKey, usize>,
}

/// Marks keys in flight until dropped.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    registry: &'a InFlight,
    keys: Vec<DocumentKey>,
}

impl InFlight {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark keys in flight.
    pub fn enter(&self, keys: Vec<DocumentKey>) -> InFlightGuard<'_> {
        for key in &keys {
            *self.keys.entry(key.clone()).or_insert(0) += 1;
        }
        InFlightGuard {
            registry: self,
            keys,
        }
    }

    /// Whether a write to `key` is in progress.
    #[must_use]
    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.keys.contains_key(key)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        for key in &self.keys {
            if let Some(mut count) = self.registry.keys.get_mut(key) {
                *count = count.saturating_sub(1);
            }
            self.registry.keys.remove_if(key, |_, count| *count == 0);
        }
    }
}
