//! In-process metrics counters
//!
//! Lock-free counters keyed by label, read out as a serializable snapshot
//! for whatever exporter the host runs.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::StoreSide;

#[derive(Debug, Default)]
struct Latency {
    count: u64,
    total_micros: u64,
    max_micros: u64,
}

/// Engine-wide counters.
#[derive(Debug, Default)]
pub struct Metrics {
    operations: DashMap<(&'static str, &'static str), u64>,
    divergences: DashMap<&'static str, u64>,
    repairs_attempted: AtomicU64,
    repairs_succeeded: AtomicU64,
    escalations: AtomicU64,
    latency: DashMap<StoreSide, Latency>,
}

impl Metrics {
    /// Create empty counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one terminal operation outcome.
    pub fn record_operation(&self, kind: &'static str, outcome: &'static str) {
        *self.operations.entry((kind, outcome)).or_default() += 1;
    }

    /// Count one divergence detected by the reconciler.
    pub fn record_divergence(&self, class: &'static str) {
        *self.divergences.entry(class).or_default() += 1;
    }

    /// Count one repair attempt and whether it converged.
    pub fn record_repair(&self, succeeded: bool) {
        self.repairs_attempted.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            self.repairs_succeeded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count one escalation to the alert channel.
    pub fn record_escalation(&self) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the latency of one store write.
    pub fn record_latency(&self, store: StoreSide, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let mut entry = self.latency.entry(store).or_default();
        entry.count += 1;
        entry.total_micros = entry.total_micros.saturating_add(micros);
        entry.max_micros = entry.max_micros.max(micros);
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let operations = self
            .operations
            .iter()
            .map(|e| (format!("{}.{}", e.key().0, e.key().1), *e.value()))
            .collect();
        let divergences = self
            .divergences
            .iter()
            .map(|e| ((*e.key()).to_string(), *e.value()))
            .collect();
        let latency = self
            .latency
            .iter()
            .map(|e| {
                let stats = e.value();
                (
                    e.key().as_str().to_string(),
                    LatencySnapshot {
                        count: stats.count,
                        total_micros: stats.total_micros,
                        max_micros: stats.max_micros,
                    },
                )
            })
            .collect();
        MetricsSnapshot {
            operations,
            divergences,
            repairs_attempted: self.repairs_attempted.load(Ordering::Relaxed),
            repairs_succeeded: self.repairs_succeeded.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            latency,
        }
    }
}

/// Store latency summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySnapshot {
    /// Calls measured
    pub count: u64,
    /// Sum of durations (µs)
    pub total_micros: u64,
    /// Slowest call (µs)
    pub max_micros: u64,
}

impl LatencySnapshot {
    /// Mean call duration (µs), 0 when nothing was measured.
    #[must_use]
    pub const fn mean_micros(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_micros / self.count
        }
    }
}

/// Serializable metrics export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// `"{operation}.{outcome}"` -> count
    pub operations: BTreeMap<String, u64>,
    /// divergence class -> count
    pub divergences: BTreeMap<String, u64>,
    /// Repairs replayed by the reconciler
    pub repairs_attempted: u64,
    /// Repairs that converged
    pub repairs_succeeded: u64,
    /// Divergences escalated to alerts
    pub escalations: u64,
    /// store -> write latency
    pub latency: BTreeMap<String, LatencySnapshot>,
}

impl MetricsSnapshot {
    /// Total terminal operations.
    #[must_use]
    pub fn operations_total(&self) -> u64 {
        self.operations.values().sum()
    }

    /// Count for one operation kind and outcome.
    #[must_use]
    pub fn operation_count(&self, kind: &str, outcome: &str) -> u64 {
        self.operations
            .get(&format!("{kind}.{outcome}"))
            .copied()
            .unwrap_or_default()
    }

    /// Share of operations that ended divergent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn divergence_rate(&self) -> f64 {
        let total = self.operations_total();
        if total == 0 {
            return 0.0;
        }
        let divergent: u64 = self
            .operations
            .iter()
            .filter(|(label, _)| label.ends_with(".divergent"))
            .map(|(_, n)| n)
            .sum();
        divergent as f64 / total as f64
    }

    /// Share of repairs that converged (1.0 when none were needed).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn repair_success_rate(&self) -> f64 {
        if self.repairs_attempted == 0 {
            return 1.0;
        }
        self.repairs_succeeded as f64 / self.repairs_attempted as f64
    }
}
