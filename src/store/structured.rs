//! In-memory structured store - relational tables behind one async lock.
//!
//! A commit applies writes in order under the table lock and keeps an undo
//! log, so a failing batch is reverted before the lock is released.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;

use super::{Document, DocumentKey, StatusCount, StructuredBatch, StructuredStore, StructuredWrite};
use crate::entity::{
    AnalysisRecord, ExperimentRecord, ExperimentStatus, PlateType, UserRecord, WellRecord, WellStatus,
};
use crate::error::StoreSide;
use crate::{Error, Result};

#[derive(Debug, Default)]
struct Tables {
    users: FxHashMap<String, UserRecord>,
    plate_types: FxHashMap<String, PlateType>,
    experiments: FxHashMap<String, ExperimentRecord>,
    wells: FxHashMap<String, WellRecord>,
    analyses: FxHashMap<String, AnalysisRecord>,
    intents: FxHashMap<DocumentKey, Document>,
}

/// Inverse of one applied write.
enum Undo {
    User(String, Option<UserRecord>),
    PlateType(String),
    Experiment(String, Option<ExperimentRecord>),
    Wells(Vec<String>),
    Well(WellRecord),
    Analysis(String, Option<AnalysisRecord>),
    Intent(DocumentKey, Option<Document>),
}

impl Tables {
    fn apply(&mut self, write: StructuredWrite) -> Result<Undo> {
        let undo = match write {
            StructuredWrite::UpsertUser(user) => {
                let id = user.user_id().to_string();
                let previous = self.users.insert(id.clone(), user);
                Undo::User(id, previous)
            }
            StructuredWrite::ConsumeQuota { user_id } => {
                let user = self
                    .users
                    .get_mut(&user_id)
                    .ok_or_else(|| missing_row("user", &user_id))?;
                let previous = user.clone();
                user.consume_quota()?;
                Undo::User(user_id, Some(previous))
            }
            StructuredWrite::InsertPlateType(plate) => {
                if self.plate_types.contains_key(plate.plate_type_id()) {
                    return Err(conflict("plate type", plate.plate_type_id()));
                }
                let id = plate.plate_type_id().to_string();
                self.plate_types.insert(id.clone(), plate);
                Undo::PlateType(id)
            }
            StructuredWrite::InsertExperiment(experiment) => {
                if self.experiments.contains_key(experiment.experiment_id()) {
                    return Err(conflict("experiment", experiment.experiment_id()));
                }
                if !self.users.contains_key(experiment.user_id()) {
                    return Err(missing_fk("user", experiment.user_id()));
                }
                if !self.plate_types.contains_key(experiment.plate_type_id()) {
                    return Err(missing_fk("plate type", experiment.plate_type_id()));
                }
                let id = experiment.experiment_id().to_string();
                self.experiments.insert(id.clone(), experiment);
                Undo::Experiment(id, None)
            }
            StructuredWrite::UpdateExperiment(experiment) => {
                let id = experiment.experiment_id().to_string();
                let slot = self
                    .experiments
                    .get_mut(&id)
                    .ok_or_else(|| missing_row("experiment", &id))?;
                let previous = std::mem::replace(slot, experiment);
                Undo::Experiment(id, Some(previous))
            }
            StructuredWrite::InsertWells(wells) => {
                for well in &wells {
                    if !self.experiments.contains_key(well.experiment_id()) {
                        return Err(missing_fk("experiment", well.experiment_id()));
                    }
                    if self.wells.contains_key(well.well_id()) {
                        return Err(conflict("well", well.well_id()));
                    }
                }
                let ids = wells.iter().map(|w| w.well_id().to_string()).collect();
                for well in wells {
                    self.wells.insert(well.well_id().to_string(), well);
                }
                Undo::Wells(ids)
            }
            StructuredWrite::UpdateWell(well) => {
                let slot = self
                    .wells
                    .get_mut(well.well_id())
                    .ok_or_else(|| missing_row("well", well.well_id()))?;
                Undo::Well(std::mem::replace(slot, well))
            }
            StructuredWrite::InsertAnalysis(analysis) => {
                if !self.experiments.contains_key(analysis.experiment_id()) {
                    return Err(missing_fk("experiment", analysis.experiment_id()));
                }
                if self.analyses.contains_key(analysis.analysis_id()) {
                    return Err(conflict("analysis", analysis.analysis_id()));
                }
                let id = analysis.analysis_id().to_string();
                self.analyses.insert(id.clone(), analysis);
                Undo::Analysis(id, None)
            }
            StructuredWrite::UpdateAnalysis(analysis) => {
                let id = analysis.analysis_id().to_string();
                let slot = self
                    .analyses
                    .get_mut(&id)
                    .ok_or_else(|| missing_row("analysis", &id))?;
                let previous = std::mem::replace(slot, analysis);
                Undo::Analysis(id, Some(previous))
            }
            StructuredWrite::PutIntent(document) => {
                let key = document.key.clone();
                let previous = self.intents.insert(key.clone(), document);
                Undo::Intent(key, previous)
            }
        };
        Ok(undo)
    }

    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::User(id, previous) => restore(&mut self.users, id, previous),
            Undo::PlateType(id) => {
                self.plate_types.remove(&id);
            }
            Undo::Experiment(id, previous) => restore(&mut self.experiments, id, previous),
            Undo::Wells(ids) => {
                for id in ids {
                    self.wells.remove(&id);
                }
            }
            Undo::Well(previous) => {
                self.wells.insert(previous.well_id().to_string(), previous);
            }
            Undo::Analysis(id, previous) => restore(&mut self.analyses, id, previous),
            Undo::Intent(key, previous) => restore(&mut self.intents, key, previous),
        }
    }
}

fn restore<K: std::hash::Hash + Eq, V>(table: &mut FxHashMap<K, V>, key: K, previous: Option<V>) {
    match previous {
        Some(value) => {
            table.insert(key, value);
        }
        None => {
            table.remove(&key);
        }
    }
}

fn conflict(table: &str, id: &str) -> Error {
    Error::StorageError(format!("{table} {id} already exists"))
}

fn missing_fk(table: &str, id: &str) -> Error {
    Error::StorageError(format!("foreign key violation: {table} {id} does not exist"))
}

fn missing_row(table: &str, id: &str) -> Error {
    Error::StorageError(format!("{table} {id} does not exist"))
}

/// In-memory relational store.
///
/// Tables are hash maps keyed by primary id (O(1) lookups); secondary lookups
/// (wells of an experiment, intents since a timestamp) are scans, matching
/// what an index-less table would do.
#[derive(Debug, Default)]
pub struct MemoryStructuredStore {
    tables: RwLock<Tables>,
    fail_next_commits: AtomicU32,
}

impl MemoryStructuredStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a transient error (fault injection).
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_next_commits.store(n, Ordering::SeqCst);
    }

    /// Drop an intent behind the coordinator's back (fault injection).
    pub async fn remove_intent(&self, key: &DocumentKey) -> Option<Document> {
        self.tables.write().await.intents.remove(key)
    }

    /// Number of experiment headers.
    pub async fn experiment_count(&self) -> usize {
        self.tables.read().await.experiments.len()
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl StructuredStore for MemoryStructuredStore {
    async fn commit(&self, batch: StructuredBatch) -> Result<()> {
        if self.take_injected_failure() {
            return Err(Error::transient(StoreSide::Structured, "injected commit failure"));
        }
        let mut tables = self.tables.write().await;
        let mut undo_log = Vec::with_capacity(batch.len());
        for write in batch {
            match tables.apply(write) {
                Ok(undo) => undo_log.push(undo),
                Err(e) => {
                    while let Some(undo) = undo_log.pop() {
                        tables.revert(undo);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        Ok(self.tables.read().await.users.get(user_id).cloned())
    }

    async fn plate_type(&self, plate_type_id: &str) -> Result<Option<PlateType>> {
        Ok(self.tables.read().await.plate_types.get(plate_type_id).cloned())
    }

    async fn experiment(&self, experiment_id: &str) -> Result<Option<ExperimentRecord>> {
        Ok(self.tables.read().await.experiments.get(experiment_id).cloned())
    }

    async fn well(&self, well_id: &str) -> Result<Option<WellRecord>> {
        Ok(self.tables.read().await.wells.get(well_id).cloned())
    }

    async fn wells_for_experiment(&self, experiment_id: &str) -> Result<Vec<WellRecord>> {
        let tables = self.tables.read().await;
        let mut wells: Vec<WellRecord> = tables
            .wells
            .values()
            .filter(|well| well.experiment_id() == experiment_id)
            .cloned()
            .collect();
        wells.sort_by_key(WellRecord::position);
        Ok(wells)
    }

    async fn analysis(&self, analysis_id: &str) -> Result<Option<AnalysisRecord>> {
        Ok(self.tables.read().await.analyses.get(analysis_id).cloned())
    }

    async fn analyses_for_experiment(&self, experiment_id: &str) -> Result<Vec<AnalysisRecord>> {
        let tables = self.tables.read().await;
        let mut analyses: Vec<AnalysisRecord> = tables
            .analyses
            .values()
            .filter(|analysis| analysis.experiment_id() == experiment_id)
            .cloned()
            .collect();
        analyses.sort_by_key(AnalysisRecord::created_at);
        Ok(analyses)
    }

    async fn intent(&self, key: &DocumentKey) -> Result<Option<Document>> {
        Ok(self.tables.read().await.intents.get(key).cloned())
    }

    async fn intents_since(&self, since: DateTime<Utc>) -> Result<Vec<DocumentKey>> {
        Ok(self
            .tables
            .read()
            .await
            .intents
            .values()
            .filter(|doc| doc.written_at >= since)
            .map(|doc| doc.key.clone())
            .collect())
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let tables = self.tables.read().await;
        let mut counts: Vec<StatusCount> = ExperimentStatus::ALL
            .iter()
            .map(|&status| StatusCount {
                status,
                experiments: 0,
                wells: 0,
                measured_wells: 0,
            })
            .collect();
        let slot = |status: ExperimentStatus| {
            ExperimentStatus::ALL
                .iter()
                .position(|s| *s == status)
                .unwrap_or_default()
        };
        for experiment in tables.experiments.values() {
            counts[slot(experiment.status())].experiments += 1;
        }
        for well in tables.wells.values() {
            let Some(experiment) = tables.experiments.get(well.experiment_id()) else {
                continue;
            };
            let entry = &mut counts[slot(experiment.status())];
            entry.wells += 1;
            if matches!(well.status(), WellStatus::Measured | WellStatus::Analyzed) {
                entry.measured_wells += 1;
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{UserRole, WellPosition};

    fn seed() -> StructuredBatch {
        let mut batch = StructuredBatch::new();
        batch.push(StructuredWrite::UpsertUser(UserRecord::new(
            "u1",
            "u1@lab.org",
            UserRole::Researcher,
            5,
        )));
        batch.push(StructuredWrite::InsertPlateType(PlateType::new("p6", "6-well", 2, 3)));
        batch
    }

    #[tokio::test]
    async fn test_commit_and_lookup() {
        let store = MemoryStructuredStore::new();
        let mut batch = seed();
        batch.push(StructuredWrite::InsertExperiment(ExperimentRecord::new("e1", "u1", "p6")));
        batch.push(StructuredWrite::InsertWells(vec![
            WellRecord::new("e1", WellPosition::new(0, 2)),
            WellRecord::new("e1", WellPosition::new(0, 1)),
        ]));
        store.commit(batch).await.unwrap();

        assert!(store.experiment("e1").await.unwrap().is_some());
        let wells = store.wells_for_experiment("e1").await.unwrap();
        assert_eq!(wells.len(), 2);
        assert_eq!(wells[0].well_id(), "e1:A1");
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back() {
        let store = MemoryStructuredStore::new();
        store.commit(seed()).await.unwrap();

        let mut batch = StructuredBatch::new();
        batch.push(StructuredWrite::InsertExperiment(ExperimentRecord::new("e1", "u1", "p6")));
        // Orphan well: experiment e2 does not exist
        batch.push(StructuredWrite::InsertWells(vec![WellRecord::new(
            "e2",
            WellPosition::new(0, 1),
        )]));
        assert!(store.commit(batch).await.is_err());
        assert!(store.experiment("e1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failure_is_transient() {
        let store = MemoryStructuredStore::new();
        store.fail_next_commits(1);
        let err = store.commit(seed()).await.unwrap_err();
        assert!(err.is_transient());
        store.commit(seed()).await.unwrap();
        assert!(store.user("u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_quota_checked_inside_commit() {
        let store = MemoryStructuredStore::new();
        let mut batch = StructuredBatch::new();
        batch.push(StructuredWrite::UpsertUser(UserRecord::new("u1", "u1@lab.org", UserRole::Researcher, 1)));
        batch.push(StructuredWrite::InsertPlateType(PlateType::new("p6", "6-well", 2, 3)));
        store.commit(batch).await.unwrap();

        let create = |id: &str| {
            let mut batch = StructuredBatch::new();
            batch.push(StructuredWrite::ConsumeQuota { user_id: "u1".into() });
            batch.push(StructuredWrite::InsertExperiment(ExperimentRecord::new(id, "u1", "p6")));
            batch
        };
        store.commit(create("e1")).await.unwrap();
        let err = store.commit(create("e2")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(store.experiment("e2").await.unwrap().is_none());
        assert_eq!(store.user("u1").await.unwrap().unwrap().quota_remaining(), 0);
    }

    #[tokio::test]
    async fn test_quota_restored_when_batch_fails() {
        let store = MemoryStructuredStore::new();
        store.commit(seed()).await.unwrap();

        let mut batch = StructuredBatch::new();
        batch.push(StructuredWrite::ConsumeQuota { user_id: "u1".into() });
        batch.push(StructuredWrite::InsertExperiment(ExperimentRecord::new("e1", "u1", "missing-plate")));
        assert!(store.commit(batch).await.is_err());
        assert_eq!(store.user("u1").await.unwrap().unwrap().quota_remaining(), 5);
    }

    #[tokio::test]
    async fn test_status_counts() {
        let store = MemoryStructuredStore::new();
        let mut batch = seed();
        batch.push(StructuredWrite::InsertExperiment(ExperimentRecord::new("e1", "u1", "p6")));
        let mut measured = WellRecord::new("e1", WellPosition::new(0, 1));
        measured.transition(WellStatus::Measured).unwrap();
        batch.push(StructuredWrite::InsertWells(vec![
            measured,
            WellRecord::new("e1", WellPosition::new(0, 2)),
        ]));
        store.commit(batch).await.unwrap();

        let counts = store.status_counts().await.unwrap();
        let pending = counts
            .iter()
            .find(|c| c.status == ExperimentStatus::Pending)
            .unwrap();
        assert_eq!(pending.experiments, 1);
        assert_eq!(pending.wells, 2);
        assert_eq!(pending.measured_wells, 1);
    }
}
