//! Aggregate compaction
//!
//! Per-status rollups (experiments, wells, measured wells) are rebuilt as an
//! Arrow `RecordBatch` off the write path. The compactor listens on the
//! coordinator's change feed and debounces bursts: a refresh runs once the
//! feed has been quiet for `debounce`, or `max_delay` after the first event of
//! a burst, whichever comes first.
//!
//! Toyota Way: Muda elimination (one rebuild per burst instead of one per
//! write).

use arrow::array::{ArrayRef, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::CompactionConfig;
use crate::coordinator::ChangeEvent;
use crate::store::{StatusCount, StructuredStore};
use crate::Result;

/// Snapshot of the aggregate rollup.
#[derive(Debug, Clone)]
pub struct AggregateView {
    /// Monotonic refresh counter
    pub version: u64,
    /// Build time
    pub refreshed_at: DateTime<Utc>,
    /// One row per experiment status
    pub batch: RecordBatch,
}

impl AggregateView {
    /// Row for `status`, as `(experiments, wells, measured_wells)`.
    #[must_use]
    pub fn counts_for(&self, status: &str) -> Option<(u64, u64, u64)> {
        let statuses = self.batch.column(0).as_any().downcast_ref::<StringArray>()?;
        let column = |i: usize| self.batch.column(i).as_any().downcast_ref::<UInt64Array>();
        let (experiments, wells, measured) = (column(1)?, column(2)?, column(3)?);
        (0..self.batch.num_rows())
            .find(|&row| statuses.value(row) == status)
            .map(|row| (experiments.value(row), wells.value(row), measured.value(row)))
    }

    /// Experiments across every status.
    #[must_use]
    pub fn total_experiments(&self) -> u64 {
        self.batch
            .column(1)
            .as_any()
            .downcast_ref::<UInt64Array>()
            .map_or(0, |column| column.values().iter().sum())
    }
}

/// Schema of the aggregate batch.
#[must_use]
pub fn aggregate_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("status", DataType::Utf8, false),
        Field::new("experiments", DataType::UInt64, false),
        Field::new("wells", DataType::UInt64, false),
        Field::new("measured_wells", DataType::UInt64, false),
    ]))
}

/// Build the aggregate batch from status counts.
///
/// # Errors
///
/// Returns `Error::Arrow` if the columns do not fit the schema.
pub fn build_batch(counts: &[StatusCount]) -> Result<RecordBatch> {
    let status = StringArray::from_iter_values(counts.iter().map(|c| c.status.as_str()));
    let experiments = UInt64Array::from_iter_values(counts.iter().map(|c| c.experiments));
    let wells = UInt64Array::from_iter_values(counts.iter().map(|c| c.wells));
    let measured = UInt64Array::from_iter_values(counts.iter().map(|c| c.measured_wells));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(status),
        Arc::new(experiments),
        Arc::new(wells),
        Arc::new(measured),
    ];
    Ok(RecordBatch::try_new(aggregate_schema(), columns)?)
}

/// Debounced aggregate builder.
#[derive(Debug)]
pub struct Compactor<S: StructuredStore> {
    store: Arc<S>,
    debounce: Duration,
    max_delay: Duration,
    latest: RwLock<Option<Arc<AggregateView>>>,
    version: AtomicU64,
}

impl<S: StructuredStore> Compactor<S> {
    /// Create a compactor over `store`.
    pub fn new(store: Arc<S>, config: &CompactionConfig) -> Self {
        Self {
            store,
            debounce: config.debounce(),
            max_delay: config.max_delay().max(config.debounce()),
            latest: RwLock::new(None),
            version: AtomicU64::new(0),
        }
    }

    /// Rebuild the view now.
    ///
    /// # Errors
    ///
    /// Propagates structured-store and Arrow errors; the previous view stays
    /// in place.
    pub async fn refresh(&self) -> Result<Arc<AggregateView>> {
        let counts = self.store.status_counts().await?;
        let batch = build_batch(&counts)?;
        let view = Arc::new(AggregateView {
            version: self.version.fetch_add(1, Ordering::Relaxed) + 1,
            refreshed_at: Utc::now(),
            batch,
        });
        *self.latest.write().await = Some(Arc::clone(&view));
        debug!(version = view.version, "Aggregate view refreshed");
        Ok(view)
    }

    /// Most recent view, if one was built.
    pub async fn latest(&self) -> Option<Arc<AggregateView>> {
        self.latest.read().await.clone()
    }

    /// Wait out a burst. Returns `false` once the feed is closed.
    async fn settle(&self, feed: &mut broadcast::Receiver<ChangeEvent>) -> bool {
        let deadline = Instant::now() + self.max_delay;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            match tokio::time::timeout(self.debounce.min(remaining), feed.recv()).await {
                Err(_) => return true,
                Ok(Ok(_)) => {}
                Ok(Err(RecvError::Lagged(skipped))) => {
                    debug!(skipped, "Compactor lagged behind change feed");
                }
                Ok(Err(RecvError::Closed)) => return false,
            }
        }
    }

    /// Consume `feed` until `shutdown` flips or the feed closes.
    pub fn spawn(
        self: Arc<Self>,
        mut feed: broadcast::Receiver<ChangeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()>
    where
        S: 'static,
    {
        tokio::spawn(async move {
            loop {
                let open = tokio::select! {
                    event = feed.recv() => match event {
                        Ok(_) | Err(RecvError::Lagged(_)) => self.settle(&mut feed).await,
                        Err(RecvError::Closed) => false,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Compactor stopping");
                            break;
                        }
                        continue;
                    }
                };
                if let Err(e) = self.refresh().await {
                    error!(error = %e, "Aggregate refresh failed");
                }
                if !open {
                    warn!("Change feed closed; compactor exiting");
                    break;
                }
            }
        })
    }
}
