//! Engine facade
//!
//! Wires stores, coordinator, reconciler and compactor together and exposes
//! the entry points and read-only query API. Writes are dispatched onto a
//! bounded worker pool; every entry point awaits durability (the coordinator
//! outcome), not mere acceptance.
//!
//! ```rust,no_run
//! use labmix_store::engine::Engine;
//! use serde_json::json;
//!
//! # async fn demo() -> labmix_store::Result<()> {
//! let engine = Engine::builder().build()?;
//! engine.start().await?;
//! let outcome = engine
//!     .create_experiment("create-e1", "alice", "e1", "alice", "p96", json!({"red": 40}))
//!     .await;
//! println!("{}", outcome.label());
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{AuditEntry, AuditLog, AuditSink, MemoryAuditSink};
use crate::compaction::{AggregateView, Compactor};
use crate::config::EngineConfig;
use crate::coordinator::{CancelToken, Command, Operation, Outcome, Root, WriteCoordinator};
use crate::entity::{
    AnalysisRecord, EntityKind, EntityRef, ExperimentRecord, ExperimentStatus, PlateType, ReviewStatus,
    UserRole, WellRecord,
};
use crate::lineage::{ArtifactId, Direction, LineageTracker, LineageWalk};
use crate::metrics::MetricsSnapshot;
use crate::reconciler::{Alert, ConsistencyReport, Reconciler, ScanReport};
use crate::store::{
    DocumentBackend, DocumentKey, DocumentStore, FaultPlan, MemoryDocumentStore, MemoryStructuredStore,
    StructuredStore,
};
use crate::{Error, Result};

/// Actor attributed to telemetry-ingested measurements.
pub const TELEMETRY_ACTOR: &str = "system:telemetry";

/// Engine over the in-memory stores.
pub type MemoryEngine = Engine<MemoryStructuredStore, DocumentBackend, MemoryAuditSink>;

/// Input of `record_analysis`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAnalysis {
    /// Analysis id
    pub analysis_id: String,
    /// Owning experiment
    pub experiment_id: String,
    /// Model/version identifier
    pub model_version: String,
    /// Wells the analysis read; empty means every measured well
    pub source_wells: Vec<String>,
    /// Model input payload
    pub input: Value,
    /// Model output payload
    pub output: Value,
    /// Inference duration
    pub duration_ms: u64,
}

impl From<NewAnalysis> for Command {
    fn from(analysis: NewAnalysis) -> Self {
        Self::RecordAnalysis {
            analysis_id: analysis.analysis_id,
            experiment_id: analysis.experiment_id,
            model_version: analysis.model_version,
            source_wells: analysis.source_wells,
            input: analysis.input,
            output: analysis.output,
            duration_ms: analysis.duration_ms,
        }
    }
}

/// Well header plus its document fragments.
#[derive(Debug, Clone, Serialize)]
pub struct WellView {
    /// Header
    pub well: WellRecord,
    /// Raw measurement payload
    pub measurement: Option<Value>,
    /// Per-well analysis payload
    pub analysis: Option<Value>,
}

/// Analysis header plus its document fragments.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisView {
    /// Header
    pub analysis: AnalysisRecord,
    /// Model input
    pub input: Option<Value>,
    /// Model output
    pub output: Option<Value>,
}

/// Everything known about one experiment, read from both stores.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentView {
    /// Header
    pub experiment: ExperimentRecord,
    /// Protocol parameters
    pub protocol: Option<Value>,
    /// Result payload
    pub result: Option<Value>,
    /// Wells in plate order
    pub wells: Vec<WellView>,
    /// Analyses, oldest first
    pub analyses: Vec<AnalysisView>,
}

impl ExperimentView {
    /// Current status.
    #[must_use]
    pub const fn status(&self) -> ExperimentStatus {
        self.experiment.status()
    }
}

/// Handle to a submitted operation.
#[derive(Debug)]
pub struct OperationHandle {
    cancel: CancelToken,
    task: JoinHandle<Outcome>,
}

impl OperationHandle {
    /// Request cancellation; honored only before the structured commit.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the terminal outcome.
    pub async fn outcome(self) -> Outcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => Outcome::failed(&Error::Cancelled),
            Err(e) => Outcome::failed(&Error::Other(format!("worker task failed: {e}"))),
        }
    }
}

/// Builder for [`MemoryEngine`].
#[derive(Debug, Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    fault_injection: bool,
}

impl EngineBuilder {
    /// Replace the configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Put the document store behind a fault switchboard.
    #[must_use]
    pub const fn with_fault_injection(mut self) -> Self {
        self.fault_injection = true;
        self
    }

    /// Build the engine.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid.
    pub fn build(self) -> Result<MemoryEngine> {
        let documents = if self.fault_injection {
            DocumentBackend::fault_injecting()
        } else {
            DocumentBackend::memory()
        };
        debug!(backend = documents.name(), "Building engine");
        Engine::with_stores(
            Arc::new(MemoryStructuredStore::new()),
            Arc::new(documents),
            MemoryAuditSink::new(),
            self.config,
        )
    }
}

/// Dual-write engine.
#[derive(Debug)]
pub struct Engine<S, D, A = MemoryAuditSink>
where
    S: StructuredStore,
    D: DocumentStore,
    A: AuditSink,
{
    config: EngineConfig,
    coordinator: Arc<WriteCoordinator<S, D, A>>,
    reconciler: Arc<Reconciler<S, D, A>>,
    compactor: Arc<Compactor<S>>,
    workers: Arc<Semaphore>,
    alerts: Mutex<mpsc::Receiver<Alert>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Engine<MemoryStructuredStore, DocumentBackend, MemoryAuditSink> {
    /// Start building an in-memory engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Document fault switchboard, when built `with_fault_injection`.
    #[must_use]
    pub fn faults(&self) -> Option<&FaultPlan> {
        self.coordinator.documents().faults()
    }

    /// Raw document store, for inspection and fault drills.
    #[must_use]
    pub fn document_store(&self) -> &MemoryDocumentStore {
        self.coordinator.documents().memory_store()
    }

    /// Raw structured store.
    #[must_use]
    pub fn structured_store(&self) -> &MemoryStructuredStore {
        self.coordinator.structured()
    }
}

impl<S, D, A> Engine<S, D, A>
where
    S: StructuredStore + 'static,
    D: DocumentStore + 'static,
    A: AuditSink + 'static,
{
    /// Wire an engine over caller-provided stores.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid.
    pub fn with_stores(structured: Arc<S>, documents: Arc<D>, audit: A, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let coordinator = Arc::new(WriteCoordinator::new(
            Arc::clone(&structured),
            documents,
            Arc::new(AuditLog::new(audit)),
            Arc::new(LineageTracker::new()),
            &config,
        ));
        let (alert_tx, alert_rx) = mpsc::channel(config.alert_buffer);
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&coordinator),
            config.reconciler.clone(),
            alert_tx,
        ));
        let compactor = Arc::new(Compactor::new(structured, &config.compaction));
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            workers: Arc::new(Semaphore::new(config.workers)),
            config,
            coordinator,
            reconciler,
            compactor,
            alerts: Mutex::new(alert_rx),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the reconciler loop and the compactor. Calling twice is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates a failure of the initial aggregate build.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(false);
        let feed = self.coordinator.subscribe();
        self.compactor.refresh().await?;
        let mut tasks = self.tasks.lock().await;
        tasks.push(Arc::clone(&self.compactor).spawn(feed, self.shutdown.subscribe()));
        tasks.push(Arc::clone(&self.reconciler).spawn(self.shutdown.subscribe()));
        info!(
            workers = self.config.workers,
            reconcile_every_secs = self.config.reconciler.interval_secs,
            "Engine started"
        );
        Ok(())
    }

    /// Stop background tasks and wait for them to exit.
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Engine stopped");
    }

    /// Dispatch an operation onto the worker pool.
    pub fn submit(&self, operation: Operation) -> OperationHandle {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let coordinator = Arc::clone(&self.coordinator);
        let workers = Arc::clone(&self.workers);
        let task = tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return Outcome::failed(&Error::Other("worker pool closed".into()));
            };
            coordinator.apply_with_cancel(operation, &token).await
        });
        OperationHandle { cancel, task }
    }

    async fn run(&self, operation: Operation) -> Outcome {
        self.submit(operation).outcome().await
    }

    /// Register or update a user.
    pub async fn register_user(
        &self,
        idempotency_key: impl Into<String>,
        actor: impl Into<String>,
        user_id: impl Into<String>,
        email: impl Into<String>,
        role: UserRole,
        quota: u32,
    ) -> Outcome {
        let command = Command::RegisterUser {
            user_id: user_id.into(),
            email: email.into(),
            role,
            quota,
            disabled: false,
        };
        self.run(Operation::new(idempotency_key, actor, command)).await
    }

    /// Register a plate geometry.
    pub async fn register_plate_type(
        &self,
        idempotency_key: impl Into<String>,
        actor: impl Into<String>,
        plate: PlateType,
    ) -> Outcome {
        let command = Command::RegisterPlateType { plate };
        self.run(Operation::new(idempotency_key, actor, command)).await
    }

    /// Create an experiment with one well per plate position.
    pub async fn create_experiment(
        &self,
        idempotency_key: impl Into<String>,
        actor: impl Into<String>,
        experiment_id: impl Into<String>,
        user_id: impl Into<String>,
        plate_type_id: impl Into<String>,
        protocol: Value,
    ) -> Outcome {
        let command = Command::CreateExperiment {
            experiment_id: experiment_id.into(),
            user_id: user_id.into(),
            plate_type_id: plate_type_id.into(),
            protocol,
        };
        self.run(Operation::new(idempotency_key, actor, command)).await
    }

    /// Move an experiment along its lifecycle, optionally attaching a result.
    pub async fn update_status(
        &self,
        idempotency_key: impl Into<String>,
        actor: impl Into<String>,
        experiment_id: impl Into<String>,
        status: ExperimentStatus,
        error_message: Option<String>,
        result: Option<Value>,
    ) -> Outcome {
        let command = Command::UpdateStatus {
            experiment_id: experiment_id.into(),
            status,
            error_message,
            result,
        };
        self.run(Operation::new(idempotency_key, actor, command)).await
    }

    /// Telemetry entry point for raw measurements.
    pub async fn record_measurement(
        &self,
        well_id: impl Into<String>,
        payload: Value,
        idempotency_key: impl Into<String>,
    ) -> Outcome {
        let command = Command::RecordMeasurement {
            well_id: well_id.into(),
            payload,
        };
        self.run(Operation::new(idempotency_key, TELEMETRY_ACTOR, command)).await
    }

    /// Attach a per-well analysis result, or mark the well failed.
    pub async fn record_well_result(
        &self,
        idempotency_key: impl Into<String>,
        actor: impl Into<String>,
        well_id: impl Into<String>,
        result: Value,
        failed: bool,
    ) -> Outcome {
        let command = Command::RecordWellResult {
            well_id: well_id.into(),
            result,
            failed,
        };
        self.run(Operation::new(idempotency_key, actor, command)).await
    }

    /// Record an ML analysis over an experiment's wells.
    pub async fn record_analysis(
        &self,
        idempotency_key: impl Into<String>,
        actor: impl Into<String>,
        analysis: NewAnalysis,
    ) -> Outcome {
        self.run(Operation::new(idempotency_key, actor, analysis.into())).await
    }

    /// Approve or reject an analysis. The reviewer is the acting user.
    pub async fn review_analysis(
        &self,
        idempotency_key: impl Into<String>,
        reviewer: impl Into<String>,
        analysis_id: impl Into<String>,
        decision: ReviewStatus,
    ) -> Outcome {
        let reviewer = reviewer.into();
        let command = Command::ReviewAnalysis {
            analysis_id: analysis_id.into(),
            decision,
            reviewer: reviewer.clone(),
        };
        self.run(Operation::new(idempotency_key, reviewer, command)).await
    }

    /// Header, wells, analyses and document fragments of one experiment.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub async fn get_experiment(&self, experiment_id: &str) -> Result<Option<ExperimentView>> {
        let structured = self.coordinator.structured();
        let Some(experiment) = structured.experiment(experiment_id).await? else {
            return Ok(None);
        };
        let wells = structured.wells_for_experiment(experiment_id).await?;
        let analyses = structured.analyses_for_experiment(experiment_id).await?;

        let mut keys: Vec<DocumentKey> = Vec::with_capacity(1 + wells.len() + analyses.len());
        keys.push(EntityRef::new(EntityKind::Experiment, experiment_id));
        keys.extend(wells.iter().map(|w| EntityRef::new(EntityKind::Well, w.well_id())));
        keys.extend(analyses.iter().map(|a| EntityRef::new(EntityKind::Analysis, a.analysis_id())));
        let mut documents = self.coordinator.documents().batch_get(&keys).await?.into_iter();

        let field = |doc: Option<&crate::store::Document>, name: &str| {
            doc.and_then(|d| d.field(name)).cloned()
        };
        let header = documents.next().flatten();
        let wells = wells
            .into_iter()
            .zip(documents.by_ref())
            .map(|(well, doc)| WellView {
                measurement: field(doc.as_ref(), "measurement"),
                analysis: field(doc.as_ref(), "analysis"),
                well,
            })
            .collect();
        let analyses = analyses
            .into_iter()
            .zip(documents)
            .map(|(analysis, doc)| AnalysisView {
                input: field(doc.as_ref(), "input"),
                output: field(doc.as_ref(), "output"),
                analysis,
            })
            .collect();

        Ok(Some(ExperimentView {
            protocol: field(header.as_ref(), "protocol"),
            result: field(header.as_ref(), "result"),
            experiment,
            wells,
            analyses,
        }))
    }

    /// Lazy provenance walk from `artifact`.
    pub async fn get_lineage(
        &self,
        artifact: &ArtifactId,
        direction: Direction,
        depth: Option<usize>,
    ) -> LineageWalk {
        self.coordinator.lineage().query(artifact, direction, depth).await
    }

    /// Reconciliation totals since `since` plus open divergences.
    pub async fn get_consistency_report(&self, since: DateTime<Utc>) -> ConsistencyReport {
        self.reconciler.consistency_report(since).await
    }

    /// Audit entries of one entity, in order.
    ///
    /// # Errors
    ///
    /// Propagates audit sink read failures.
    pub async fn get_audit_trail(&self, entity_id: &str) -> Result<Vec<AuditEntry>> {
        self.coordinator.audit().trail(entity_id).await
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.coordinator.metrics().snapshot()
    }

    /// Latest aggregate rollup.
    pub async fn aggregate_view(&self) -> Option<Arc<AggregateView>> {
        self.compactor.latest().await
    }

    /// Run one reconciliation scan now.
    ///
    /// # Errors
    ///
    /// See [`Reconciler::scan`].
    pub async fn reconcile_now(&self) -> Result<ScanReport> {
        self.reconciler.run_once().await
    }

    /// Drain alerts raised so far.
    pub async fn take_alerts(&self) -> Vec<Alert> {
        let mut receiver = self.alerts.lock().await;
        let mut alerts = Vec::new();
        while let Ok(alert) = receiver.try_recv() {
            alerts.push(alert);
        }
        alerts
    }

    /// Lift an operator halt on an experiment.
    pub fn resume(&self, experiment_id: &str) -> bool {
        self.coordinator.resume(experiment_id)
    }

    /// Lift an operator halt on a user or plate-type root.
    pub fn resume_root(&self, root: &Root) -> bool {
        self.coordinator.resume_root(root)
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Write coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> &Arc<WriteCoordinator<S, D, A>> {
        &self.coordinator
    }

    /// Reconciler.
    #[must_use]
    pub const fn reconciler(&self) -> &Arc<Reconciler<S, D, A>> {
        &self.reconciler
    }

    /// Compactor.
    #[must_use]
    pub const fn compactor(&self) -> &Arc<Compactor<S>> {
        &self.compactor
    }
}
