//! Consistency Reconciler
//!
//! Periodically re-reads both halves of recently written records and
//! compares fingerprints three ways:
//!
//! 1. intent fingerprint (structured side, what the document should be)
//! 2. stored document fingerprint
//! 3. fingerprint recomputed from the stored body (catches edits that
//!    bypassed the coordinator)
//!
//! Repairable divergences are replayed through the coordinator once per
//! scan. Divergences that keep failing, or outlive the configured window,
//! are escalated on the alert channel. A document with no structured
//! counterpart is corruption (Jidoka: stop the line): the experiment is
//! halted and a critical alert raised.
//!
//! Scans never take a lock a writer waits on; a stale read is re-checked on
//! the next cycle.

mod report;

pub use report::{Alert, ConsistencyReport, DivergenceDetail, DivergenceKind, ScanReport};

use chrono::{DateTime, TimeDelta, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditSink, MemoryAuditSink, Severity};
use crate::config::ReconcilerConfig;
use crate::coordinator::{experiment_of_well, Command, Operation, Root, WriteCoordinator};
use crate::entity::EntityKind;
use crate::fingerprint::fingerprint;
use crate::store::{Document, DocumentKey, DocumentStore, StructuredStore};
use crate::Result;

/// Actor recorded on repair operations.
pub const REPAIR_ACTOR: &str = "system:reconciler";

#[derive(Debug, Default)]
struct State {
    tracked: FxHashMap<DocumentKey, DivergenceDetail>,
    deferred: FxHashSet<DocumentKey>,
    history: VecDeque<ScanReport>,
}

/// Background divergence detector and repairer.
#[derive(Debug)]
pub struct Reconciler<S, D, A = MemoryAuditSink>
where
    S: StructuredStore,
    D: DocumentStore,
    A: AuditSink,
{
    coordinator: Arc<WriteCoordinator<S, D, A>>,
    config: ReconcilerConfig,
    scan_lock: Mutex<()>,
    state: Mutex<State>,
    alerts: mpsc::Sender<Alert>,
}

/// Comparison of one key.
enum Verdict {
    Match,
    Diverged {
        kind: DivergenceKind,
        expected: Option<String>,
        actual: Option<String>,
    },
}

fn compare(intent: Option<&Document>, document: Option<&Document>) -> Verdict {
    match (intent, document) {
        (None, None) => Verdict::Match,
        (Some(intent), Some(doc)) if intent.fingerprint == doc.fingerprint && doc.is_intact() => {
            Verdict::Match
        }
        (Some(intent), Some(doc)) => Verdict::Diverged {
            kind: DivergenceKind::ContentMismatch,
            expected: Some(intent.fingerprint.clone()),
            actual: Some(fingerprint(&doc.body)),
        },
        (Some(intent), None) => Verdict::Diverged {
            kind: DivergenceKind::MissingInDocument,
            expected: Some(intent.fingerprint.clone()),
            actual: None,
        },
        (None, Some(doc)) => Verdict::Diverged {
            kind: DivergenceKind::MissingInStructured,
            expected: None,
            actual: Some(fingerprint(&doc.body)),
        },
    }
}

impl<S, D, A> Reconciler<S, D, A>
where
    S: StructuredStore,
    D: DocumentStore,
    A: AuditSink,
{
    /// Create a reconciler feeding `alerts`.
    pub fn new(
        coordinator: Arc<WriteCoordinator<S, D, A>>,
        config: ReconcilerConfig,
        alerts: mpsc::Sender<Alert>,
    ) -> Self {
        Self {
            coordinator,
            config,
            scan_lock: Mutex::new(()),
            state: Mutex::new(State::default()),
            alerts,
        }
    }

    /// Scan with the configured window.
    ///
    /// # Errors
    ///
    /// See [`Reconciler::scan`].
    pub async fn run_once(&self) -> Result<ScanReport> {
        self.scan(self.config.scan_window()).await
    }

    /// Compare every key written within `window`, every key the coordinator
    /// queued, and every divergence still open.
    ///
    /// # Errors
    ///
    /// Fails only if the structured store cannot be read; document-store
    /// read failures defer the key to the next scan.
    pub async fn scan(&self, window: Duration) -> Result<ScanReport> {
        let _scan = self.scan_lock.lock().await;
        let started_at = Utc::now();
        let since = window_start(started_at, window);
        let structured = self.coordinator.structured();
        let documents = self.coordinator.documents();

        let mut candidates: BTreeSet<DocumentKey> =
            structured.intents_since(since).await?.into_iter().collect();
        match documents.keys_since(since).await {
            Ok(keys) => candidates.extend(keys),
            Err(e) => warn!(error = %e, "Document store unavailable for key listing"),
        }
        candidates.extend(self.coordinator.drain_repairs().into_iter().map(|(key, _)| key));
        {
            let mut state = self.state.lock().await;
            candidates.extend(state.tracked.keys().cloned());
            candidates.extend(state.deferred.drain());
        }

        let mut report = ScanReport {
            started_at,
            finished_at: started_at,
            checked: 0,
            matched: 0,
            deferred: 0,
            detected: 0,
            escalated: 0,
            divergent: Vec::new(),
        };
        let mut deferred = FxHashSet::default();

        for key in candidates {
            if self.coordinator.is_in_flight(&key) {
                report.checked += 1;
                report.divergent.push(self.in_flight_detail(&key).await);
                continue;
            }
            let intent = structured.intent(&key).await?;
            let document = match documents.get(&key).await {
                Ok(document) => document,
                Err(e) => {
                    debug!(key = %key, error = %e, "Deferring key");
                    deferred.insert(key);
                    continue;
                }
            };
            report.checked += 1;

            match compare(intent.as_ref(), document.as_ref()) {
                Verdict::Match => {
                    report.matched += 1;
                    self.state.lock().await.tracked.remove(&key);
                }
                Verdict::Diverged {
                    kind,
                    expected,
                    actual,
                } => {
                    let detail = self.handle(key, kind, expected, actual, &mut report).await;
                    report.divergent.push(detail);
                }
            }
        }

        report.deferred = deferred.len();
        report.finished_at = Utc::now();
        {
            let mut state = self.state.lock().await;
            state.deferred.extend(deferred);
            state.history.push_back(report.clone());
            while state.history.len() > self.config.history_limit.max(1) {
                state.history.pop_front();
            }
        }

        info!(
            checked = report.checked,
            matched = report.matched,
            divergent = report.divergent.len(),
            repaired = report.repaired(),
            deferred = report.deferred,
            "Reconciliation scan finished"
        );
        Ok(report)
    }

    async fn in_flight_detail(&self, key: &DocumentKey) -> DivergenceDetail {
        let now = Utc::now();
        let state = self.state.lock().await;
        let previous = state.tracked.get(key);
        DivergenceDetail {
            key: key.clone(),
            kind: DivergenceKind::StalePendingRetry,
            expected_fingerprint: None,
            actual_fingerprint: None,
            detected_at: previous.map_or(now, |d| d.detected_at),
            repaired: false,
            escalated: previous.is_some_and(|d| d.escalated),
            repair_attempts: previous.map_or(0, |d| d.repair_attempts),
        }
    }

    /// Track, repair and escalate one divergence.
    async fn handle(
        &self,
        key: DocumentKey,
        kind: DivergenceKind,
        expected: Option<String>,
        actual: Option<String>,
        report: &mut ScanReport,
    ) -> DivergenceDetail {
        let now = Utc::now();
        let previous = self.state.lock().await.tracked.get(&key).cloned();
        let mut detail = match previous {
            Some(previous) if previous.kind == kind => DivergenceDetail {
                expected_fingerprint: expected,
                actual_fingerprint: actual,
                repaired: false,
                ..previous
            },
            _ => {
                report.detected += 1;
                self.coordinator.metrics().record_divergence(kind.as_str());
                warn!(key = %key, class = %kind, "Divergence detected");
                DivergenceDetail {
                    key: key.clone(),
                    kind,
                    expected_fingerprint: expected,
                    actual_fingerprint: actual,
                    detected_at: now,
                    repaired: false,
                    escalated: false,
                    repair_attempts: 0,
                }
            }
        };

        if kind == DivergenceKind::MissingInStructured {
            if !detail.escalated {
                let root = root_of(&key);
                self.coordinator
                    .halt(&root, &format!("{key} exists only in the document store"));
                self.raise(
                    &detail,
                    Severity::Critical,
                    format!("{key} has no structured counterpart; {root} halted"),
                );
                detail.escalated = true;
                report.escalated += 1;
            }
        } else if kind.is_repairable() {
            detail.repaired = self.repair(&detail).await;
            if !detail.repaired {
                detail.repair_attempts += 1;
            }
        }

        if !detail.repaired && !detail.escalated && self.should_escalate(&detail, now) {
            self.raise(
                &detail,
                Severity::Error,
                format!(
                    "{key} still {kind} after {} repair attempts",
                    detail.repair_attempts
                ),
            );
            detail.escalated = true;
            report.escalated += 1;
        }

        let mut state = self.state.lock().await;
        if detail.repaired {
            state.tracked.remove(&key);
        } else {
            state.tracked.insert(key, detail.clone());
        }
        detail
    }

    /// Replay the intent through the coordinator.
    async fn repair(&self, detail: &DivergenceDetail) -> bool {
        let idempotency_key = format!(
            "repair:{}:{}:{}:{}",
            detail.key,
            detail.expected_fingerprint.as_deref().unwrap_or("none"),
            detail.detected_at.timestamp_millis(),
            detail.repair_attempts
        );
        let operation = Operation::new(
            idempotency_key,
            REPAIR_ACTOR,
            Command::RepairDocument {
                key: detail.key.clone(),
            },
        );
        let outcome = self.coordinator.apply(operation).await;
        let repaired = outcome.is_ok();
        self.coordinator.metrics().record_repair(repaired);
        if repaired {
            info!(key = %detail.key, class = %detail.kind, "Divergence repaired");
        } else {
            warn!(key = %detail.key, outcome = outcome.label(), "Repair attempt did not converge");
        }
        repaired
    }

    fn should_escalate(&self, detail: &DivergenceDetail, now: DateTime<Utc>) -> bool {
        let age = (now - detail.detected_at).to_std().unwrap_or_default();
        detail.repair_attempts >= self.config.repair_attempts_before_escalation
            || age > self.config.max_divergence_window()
    }

    fn raise(&self, detail: &DivergenceDetail, severity: Severity, message: String) {
        self.coordinator.metrics().record_escalation();
        error!(key = %detail.key, class = %detail.kind, ?severity, "{message}");
        let alert = Alert {
            severity,
            key: detail.key.clone(),
            class: detail.kind,
            message,
            raised_at: Utc::now(),
        };
        if let Err(e) = self.alerts.try_send(alert) {
            warn!(error = %e, "Alert channel full or closed; alert dropped");
        }
    }

    /// Totals over scans finished at or after `since`, plus open divergences.
    pub async fn consistency_report(&self, since: DateTime<Utc>) -> ConsistencyReport {
        let state = self.state.lock().await;
        let mut report = ConsistencyReport {
            since,
            scans: 0,
            checked: 0,
            matched: 0,
            detected: 0,
            repaired: 0,
            escalated: 0,
            outstanding: Vec::new(),
        };
        for scan in state.history.iter().filter(|scan| scan.finished_at >= since) {
            report.scans += 1;
            report.checked += scan.checked;
            report.matched += scan.matched;
            report.detected += scan.detected;
            report.repaired += scan.repaired();
            report.escalated += scan.escalated;
        }
        report.outstanding = state.tracked.values().cloned().collect();
        report.outstanding.sort_by(|a, b| a.key.cmp(&b.key));
        report
    }

    /// Divergences not yet resolved.
    pub async fn outstanding(&self) -> Vec<DivergenceDetail> {
        self.consistency_report(Utc::now()).await.outstanding
    }

    /// Run `run_once` every configured interval until `shutdown` flips.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()>
    where
        S: 'static,
        D: 'static,
        A: 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!(error = %e, "Reconciliation scan failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Reconciler stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(window)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Experiment a document key belongs to. Orphaned analysis documents are
/// quarantined under their own id.
fn root_of(key: &DocumentKey) -> Root {
    let id = match key.kind {
        EntityKind::Well => experiment_of_well(&key.id).unwrap_or(key.id.as_str()),
        _ => key.id.as_str(),
    };
    Root::Experiment(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;
    use serde_json::json;
    use uuid::Uuid;

    fn doc(body: serde_json::Value) -> Document {
        Document::new(EntityRef::new(EntityKind::Experiment, "e1"), body, Uuid::new_v4())
    }

    #[test]
    fn test_compare_classes() {
        let intent = doc(json!({"protocol": {"red": 1}}));
        let same = intent.clone();
        assert!(matches!(compare(Some(&intent), Some(&same)), Verdict::Match));

        let mut tampered = intent.clone();
        tampered.body = json!({"protocol": {"red": 2}});
        assert!(matches!(
            compare(Some(&intent), Some(&tampered)),
            Verdict::Diverged { kind: DivergenceKind::ContentMismatch, .. }
        ));
        assert!(matches!(
            compare(Some(&intent), None),
            Verdict::Diverged { kind: DivergenceKind::MissingInDocument, .. }
        ));
        assert!(matches!(
            compare(None, Some(&intent)),
            Verdict::Diverged { kind: DivergenceKind::MissingInStructured, .. }
        ));
    }

    #[test]
    fn test_root_of_well_key() {
        let key = EntityRef::new(EntityKind::Well, "e1:B3");
        assert_eq!(root_of(&key), Root::Experiment("e1".into()));
    }

    #[test]
    fn test_window_start_saturates() {
        let now = Utc::now();
        assert_eq!(window_start(now, Duration::from_secs(60)), now - TimeDelta::seconds(60));
        assert_eq!(window_start(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }
}
