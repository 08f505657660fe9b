//! Bounded idempotency window.

use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::operation::Outcome;

#[derive(Debug)]
struct Remembered {
    request_fingerprint: String,
    outcome: Outcome,
    inserted: Instant,
}

#[derive(Debug, Default)]
struct Window {
    entries: FxHashMap<String, Remembered>,
    order: VecDeque<(String, Instant)>,
}

impl Window {
    fn evict_expired(&mut self, ttl: Duration, now: Instant) {
        while let Some((key, inserted)) = self.order.front() {
            if now.duration_since(*inserted) < ttl {
                break;
            }
            let expired = self
                .entries
                .get(key)
                .is_some_and(|entry| entry.inserted == *inserted);
            if expired {
                self.entries.remove(key);
            }
            self.order.pop_front();
        }
    }

    fn evict_oldest(&mut self) {
        while let Some((key, inserted)) = self.order.pop_front() {
            let live = self
                .entries
                .get(&key)
                .is_some_and(|entry| entry.inserted == inserted);
            if live {
                self.entries.remove(&key);
                return;
            }
        }
    }
}

/// Previously seen request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupHit {
    /// Fingerprint of the original command
    pub request_fingerprint: String,
    /// Outcome returned the first time
    pub outcome: Outcome,
}

/// Idempotency keys remembered for a TTL, oldest evicted past capacity.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    ttl: Duration,
    window: Mutex<Window>,
}

impl DedupWindow {
    /// Create a window.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            window: Mutex::new(Window::default()),
        }
    }

    /// Look up a key.
    pub async fn lookup(&self, key: &str) -> Option<DedupHit> {
        let mut window = self.window.lock().await;
        window.evict_expired(self.ttl, Instant::now());
        window.entries.get(key).map(|entry| DedupHit {
            request_fingerprint: entry.request_fingerprint.clone(),
            outcome: entry.outcome.clone(),
        })
    }

    /// Remember an outcome. Failed outcomes are never stored.
    pub async fn remember(&self, key: &str, request_fingerprint: &str, outcome: &Outcome) {
        if !outcome.is_cacheable() {
            return;
        }
        let now = Instant::now();
        let mut window = self.window.lock().await;
        window.evict_expired(self.ttl, now);
        window.entries.insert(
            key.to_string(),
            Remembered {
                request_fingerprint: request_fingerprint.to_string(),
                outcome: outcome.clone(),
                inserted: now,
            },
        );
        window.order.push_back((key.to_string(), now));
        while window.entries.len() > self.capacity {
            window.evict_oldest();
        }
    }

    /// Remembered keys.
    pub async fn len(&self) -> usize {
        self.window.lock().await.entries.len()
    }
}
