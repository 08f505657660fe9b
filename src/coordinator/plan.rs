//! Planning: turn a command into a structured batch, document intents and
//! lineage edges, validating against current state first.

use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use uuid::Uuid;

use super::operation::Command;
use crate::entity::{
    AnalysisRecord, EntityKind, EntityRef, ExperimentRecord, UserRecord, WellRecord, WellStatus,
};
use crate::fingerprint::fingerprint;
use crate::lineage::{ArtifactId, EdgeSpec, RelationshipKind, Transformation, TransformationKind};
use crate::store::{Document, DocumentKey, StructuredBatch, StructuredStore, StructuredWrite};
use crate::{Error, Result};

/// Serialization scope of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Root {
    /// Everything under one experiment
    Experiment(String),
    /// A user row
    User(String),
    /// A plate type row
    PlateType(String),
}

impl Root {
    /// Key for the root lock map.
    #[must_use]
    pub fn lock_key(&self) -> String {
        self.to_string()
    }

    /// Experiment id, if this root is an experiment.
    #[must_use]
    pub fn experiment_id(&self) -> Option<&str> {
        match self {
            Self::Experiment(id) => Some(id),
            Self::User(_) | Self::PlateType(_) => None,
        }
    }
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Experiment(id) => write!(f, "experiment:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
            Self::PlateType(id) => write!(f, "plate_type:{id}"),
        }
    }
}

/// Everything the coordinator needs to execute one operation.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Targeted entity (audited)
    pub primary: EntityRef,
    /// Entities created
    pub created: Vec<EntityRef>,
    /// Structured writes (one local transaction)
    pub batch: StructuredBatch,
    /// Documents to write after the commit
    pub documents: Vec<Document>,
    /// Lineage edges for derived artifacts
    pub edges: Vec<EdgeSpec>,
    /// Audit snapshot before
    pub before: Option<Value>,
    /// Audit snapshot after
    pub after: Option<Value>,
}

impl Plan {
    fn new(primary: EntityRef) -> Self {
        Self {
            primary,
            created: Vec::new(),
            batch: StructuredBatch::new(),
            documents: Vec::new(),
            edges: Vec::new(),
            before: None,
            after: None,
        }
    }

    /// Stage a document: its intent goes into the batch, the body is
    /// written after the commit.
    fn stage_document(&mut self, document: Document) {
        self.batch.push(StructuredWrite::PutIntent(document.clone()));
        self.documents.push(document);
    }

    /// Keys of the staged documents.
    #[must_use]
    pub fn document_keys(&self) -> Vec<DocumentKey> {
        self.documents.iter().map(|d| d.key.clone()).collect()
    }
}

/// Experiment id encoded in a well id (`"{experiment_id}:{position}"`).
///
/// # Errors
///
/// `Validation` if the id has no position suffix.
pub fn experiment_of_well(well_id: &str) -> Result<&str> {
    well_id
        .rsplit_once(':')
        .map(|(experiment, _)| experiment)
        .filter(|experiment| !experiment.is_empty())
        .ok_or_else(|| Error::Validation(format!("malformed well id '{well_id}'")))
}

/// Resolve the serialization root of a command.
///
/// # Errors
///
/// `Validation`/`NotFound` if the root cannot be determined.
pub async fn resolve_root<S: StructuredStore>(store: &S, command: &Command) -> Result<Root> {
    let root = match command {
        Command::RegisterUser { user_id, .. } => Root::User(user_id.clone()),
        Command::RegisterPlateType { plate } => Root::PlateType(plate.plate_type_id().to_string()),
        Command::CreateExperiment { experiment_id, .. }
        | Command::UpdateStatus { experiment_id, .. }
        | Command::RecordAnalysis { experiment_id, .. } => Root::Experiment(experiment_id.clone()),
        Command::RecordMeasurement { well_id, .. } | Command::RecordWellResult { well_id, .. } => {
            Root::Experiment(experiment_of_well(well_id)?.to_string())
        }
        Command::ReviewAnalysis { analysis_id, .. } => {
            Root::Experiment(analysis_root(store, analysis_id).await?)
        }
        Command::RepairDocument { key } => match key.kind {
            EntityKind::Experiment => Root::Experiment(key.id.clone()),
            EntityKind::Well => Root::Experiment(experiment_of_well(&key.id)?.to_string()),
            EntityKind::Analysis => Root::Experiment(analysis_root(store, &key.id).await?),
            EntityKind::User | EntityKind::PlateType => {
                return Err(Error::Validation(format!("{key} has no document")));
            }
        },
    };
    Ok(root)
}

async fn analysis_root<S: StructuredStore>(store: &S, analysis_id: &str) -> Result<String> {
    store
        .analysis(analysis_id)
        .await?
        .map(|analysis| analysis.experiment_id().to_string())
        .ok_or_else(|| Error::NotFound(format!("analysis {analysis_id}")))
}

/// Build the plan for a command.
///
/// # Errors
///
/// Validation, not-found and transition errors; nothing is written.
pub async fn plan<S: StructuredStore>(store: &S, command: &Command, operation_id: Uuid) -> Result<Plan> {
    match command {
        Command::RegisterUser {
            user_id,
            email,
            role,
            quota,
            disabled,
        } => {
            non_empty("user_id", user_id)?;
            if !email.contains('@') {
                return Err(Error::Validation(format!("invalid email for user {user_id}")));
            }
            let mut plan = Plan::new(EntityRef::new(EntityKind::User, user_id.as_str()));
            let existing = store.user(user_id).await?;
            plan.before = existing.as_ref().map(snapshot).transpose()?;
            if existing.is_none() {
                plan.created.push(plan.primary.clone());
            }
            let mut user = UserRecord::new(user_id.as_str(), email.as_str(), *role, *quota);
            if *disabled {
                user = user.into_disabled();
            }
            plan.after = Some(snapshot(&user)?);
            plan.batch.push(StructuredWrite::UpsertUser(user));
            Ok(plan)
        }

        Command::RegisterPlateType { plate } => {
            plate.validate()?;
            if store.plate_type(plate.plate_type_id()).await?.is_some() {
                return Err(Error::Validation(format!(
                    "plate type {} is already registered",
                    plate.plate_type_id()
                )));
            }
            let mut plan = Plan::new(EntityRef::new(EntityKind::PlateType, plate.plate_type_id()));
            plan.created.push(plan.primary.clone());
            plan.after = Some(snapshot(plate)?);
            plan.batch.push(StructuredWrite::InsertPlateType(plate.clone()));
            Ok(plan)
        }

        Command::CreateExperiment {
            experiment_id,
            user_id,
            plate_type_id,
            protocol,
        } => {
            non_empty("experiment_id", experiment_id)?;
            if !protocol.is_object() {
                return Err(Error::Validation("protocol must be a JSON object".into()));
            }
            if store.experiment(experiment_id).await?.is_some() {
                return Err(Error::Validation(format!("experiment {experiment_id} already exists")));
            }
            // Early rejection only; the commit re-checks the quota under the table lock
            store
                .user(user_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("user {user_id}")))?
                .consume_quota()?;
            let plate = store
                .plate_type(plate_type_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("plate type {plate_type_id}")))?;

            let experiment = ExperimentRecord::new(experiment_id.as_str(), user_id.as_str(), plate_type_id.as_str());
            let wells: Vec<WellRecord> = plate
                .positions()
                .map(|position| WellRecord::new(experiment_id.as_str(), position))
                .collect();

            let mut plan = Plan::new(EntityRef::new(EntityKind::Experiment, experiment_id.as_str()));
            plan.created.push(plan.primary.clone());
            plan.created.extend(
                wells
                    .iter()
                    .map(|well| EntityRef::new(EntityKind::Well, well.well_id())),
            );
            plan.after = Some(snapshot(&experiment)?);

            plan.batch.push(StructuredWrite::ConsumeQuota {
                user_id: user_id.clone(),
            });
            plan.batch.push(StructuredWrite::InsertExperiment(experiment));
            plan.batch.push(StructuredWrite::InsertWells(wells));
            let body = json!({ "protocol": protocol, "result": Value::Null });
            plan.stage_document(Document::new(plan.primary.clone(), body, operation_id));
            Ok(plan)
        }

        Command::UpdateStatus {
            experiment_id,
            status,
            error_message,
            result,
        } => {
            let mut experiment = load_experiment(store, experiment_id).await?;
            let mut plan = Plan::new(EntityRef::new(EntityKind::Experiment, experiment_id.as_str()));
            plan.before = Some(snapshot(&experiment)?);
            experiment.transition(*status, error_message.clone())?;
            plan.after = Some(snapshot(&experiment)?);
            plan.batch.push(StructuredWrite::UpdateExperiment(experiment));

            if let Some(result) = result {
                let document = merged_intent(store, plan.primary.clone(), "result", result.clone(), operation_id).await?;
                plan.stage_document(document);
            }
            Ok(plan)
        }

        Command::RecordMeasurement { well_id, payload } => {
            if payload.is_null() {
                return Err(Error::Validation(format!("measurement for {well_id} is empty")));
            }
            let mut well = load_well(store, well_id).await?;
            let mut experiment = load_experiment(store, well.experiment_id()).await?;
            if experiment.status().is_terminal() {
                return Err(Error::Validation(format!(
                    "experiment {} is {}; measurements are closed",
                    experiment.experiment_id(),
                    experiment.status()
                )));
            }

            let mut plan = Plan::new(EntityRef::new(EntityKind::Well, well_id.as_str()));
            plan.before = Some(snapshot(&well)?);
            well.transition(WellStatus::Measured)?;
            experiment.touch();
            plan.after = Some(snapshot(&well)?);

            let step = Transformation::new("plate-reader-ingest", TransformationKind::Extract, "telemetry")
                .with_checksums(None, Some(fingerprint(payload)));
            plan.edges.push(
                EdgeSpec::new(
                    ArtifactId::protocol(experiment.experiment_id()),
                    ArtifactId::measurement(well_id),
                    RelationshipKind::DerivedFrom,
                )
                .with_transformation(step),
            );

            plan.batch.push(StructuredWrite::UpdateWell(well));
            plan.batch.push(StructuredWrite::UpdateExperiment(experiment));
            let document = merged_intent(store, plan.primary.clone(), "measurement", payload.clone(), operation_id).await?;
            plan.stage_document(document);
            Ok(plan)
        }

        Command::RecordWellResult {
            well_id,
            result,
            failed,
        } => {
            if result.is_null() {
                return Err(Error::Validation(format!("result for {well_id} is empty")));
            }
            let mut well = load_well(store, well_id).await?;
            let mut plan = Plan::new(EntityRef::new(EntityKind::Well, well_id.as_str()));
            plan.before = Some(snapshot(&well)?);

            if *failed {
                well.transition(WellStatus::Failed)?;
            } else {
                if well.status() != WellStatus::Measured {
                    return Err(Error::Validation(format!(
                        "well {well_id} is {}; a result needs a measured well",
                        well.status()
                    )));
                }
                well.transition(WellStatus::Analyzed)?;
                let step = Transformation::new("well-analysis", TransformationKind::Transform, "v1")
                    .with_checksums(None, Some(fingerprint(result)));
                plan.edges.push(
                    EdgeSpec::new(
                        ArtifactId::measurement(well_id),
                        ArtifactId::well_result(well_id),
                        RelationshipKind::TransformedBy,
                    )
                    .with_transformation(step),
                );
            }
            plan.after = Some(snapshot(&well)?);
            plan.batch.push(StructuredWrite::UpdateWell(well));
            let document = merged_intent(store, plan.primary.clone(), "analysis", result.clone(), operation_id).await?;
            plan.stage_document(document);
            Ok(plan)
        }

        Command::RecordAnalysis {
            analysis_id,
            experiment_id,
            model_version,
            source_wells,
            input,
            output,
            duration_ms,
        } => {
            non_empty("analysis_id", analysis_id)?;
            non_empty("model_version", model_version)?;
            if output.is_null() {
                return Err(Error::Validation(format!("analysis {analysis_id} has no output")));
            }
            let mut experiment = load_experiment(store, experiment_id).await?;
            if store.analysis(analysis_id).await?.is_some() {
                return Err(Error::Validation(format!("analysis {analysis_id} already exists")));
            }

            let sources = analysis_sources(store, experiment_id, source_wells).await?;
            let analysis = AnalysisRecord::new(analysis_id.as_str(), experiment_id.as_str(), model_version.as_str());
            let mut plan = Plan::new(EntityRef::new(EntityKind::Analysis, analysis_id.as_str()));
            plan.created.push(plan.primary.clone());
            plan.after = Some(snapshot(&analysis)?);

            let step = Transformation::new("model-inference", TransformationKind::Transform, model_version.as_str())
                .with_parameters(json!({ "source_count": sources.len() }))
                .with_duration_ms(*duration_ms)
                .with_checksums(Some(fingerprint(input)), Some(fingerprint(output)));
            let target = ArtifactId::analysis(analysis_id);
            for (source, kind) in sources {
                plan.edges.push(
                    EdgeSpec::new(source, target.clone(), kind).with_transformation(step.clone()),
                );
            }

            experiment.touch();
            plan.batch.push(StructuredWrite::InsertAnalysis(analysis));
            plan.batch.push(StructuredWrite::UpdateExperiment(experiment));
            let body = json!({ "input": input, "output": output });
            plan.stage_document(Document::new(plan.primary.clone(), body, operation_id));
            Ok(plan)
        }

        Command::ReviewAnalysis {
            analysis_id,
            decision,
            reviewer,
        } => {
            non_empty("reviewer", reviewer)?;
            let mut analysis = store
                .analysis(analysis_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("analysis {analysis_id}")))?;
            let mut plan = Plan::new(EntityRef::new(EntityKind::Analysis, analysis_id.as_str()));
            plan.before = Some(snapshot(&analysis)?);
            analysis.review(*decision, reviewer.as_str())?;
            plan.after = Some(snapshot(&analysis)?);

            let step = Transformation::new("analysis-review", TransformationKind::Review, "manual")
                .with_parameters(json!({ "decision": decision, "reviewer": reviewer }));
            plan.edges.push(
                EdgeSpec::new(
                    ArtifactId::analysis(analysis_id),
                    ArtifactId::review(analysis_id),
                    RelationshipKind::ValidatedBy,
                )
                .with_transformation(step),
            );
            plan.batch.push(StructuredWrite::UpdateAnalysis(analysis));
            Ok(plan)
        }

        Command::RepairDocument { key } => {
            let intent = store
                .intent(key)
                .await?
                .ok_or_else(|| Error::NotFound(format!("document intent for {key}")))?;
            let mut plan = Plan::new(key.clone());
            plan.after = Some(json!({ "fingerprint": intent.fingerprint }));
            plan.documents.push(intent);
            Ok(plan)
        }
    }
}

/// Upstream artifacts of an analysis: the named wells, else every measured
/// well, else the protocol.
async fn analysis_sources<S: StructuredStore>(
    store: &S,
    experiment_id: &str,
    source_wells: &[String],
) -> Result<Vec<(ArtifactId, RelationshipKind)>> {
    let analyzable = |status: WellStatus| matches!(status, WellStatus::Measured | WellStatus::Analyzed);

    if source_wells.is_empty() {
        let measured: Vec<_> = store
            .wells_for_experiment(experiment_id)
            .await?
            .into_iter()
            .filter(|well| analyzable(well.status()))
            .map(|well| (ArtifactId::measurement(well.well_id()), RelationshipKind::AggregatedFrom))
            .collect();
        if measured.is_empty() {
            return Ok(vec![(ArtifactId::protocol(experiment_id), RelationshipKind::DerivedFrom)]);
        }
        return Ok(measured);
    }

    let mut sources = Vec::with_capacity(source_wells.len());
    for well_id in source_wells {
        let well = load_well(store, well_id).await?;
        if well.experiment_id() != experiment_id {
            return Err(Error::Validation(format!(
                "well {well_id} does not belong to experiment {experiment_id}"
            )));
        }
        if !analyzable(well.status()) {
            return Err(Error::Validation(format!("well {well_id} has no measurement")));
        }
        sources.push((ArtifactId::measurement(well_id), RelationshipKind::AggregatedFrom));
    }
    Ok(sources)
}

async fn load_experiment<S: StructuredStore>(store: &S, experiment_id: &str) -> Result<ExperimentRecord> {
    store
        .experiment(experiment_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("experiment {experiment_id}")))
}

async fn load_well<S: StructuredStore>(store: &S, well_id: &str) -> Result<WellRecord> {
    store
        .well(well_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("well {well_id}")))
}

/// Empty body for a document kind.
fn empty_body(kind: EntityKind) -> Value {
    match kind {
        EntityKind::Experiment => json!({ "protocol": null, "result": null }),
        EntityKind::Well => json!({ "measurement": null, "analysis": null }),
        EntityKind::Analysis => json!({ "input": null, "output": null }),
        EntityKind::User | EntityKind::PlateType => json!({}),
    }
}

/// Current intent with one field replaced.
async fn merged_intent<S: StructuredStore>(
    store: &S,
    key: DocumentKey,
    field: &str,
    value: Value,
    operation_id: Uuid,
) -> Result<Document> {
    let mut body = store
        .intent(&key)
        .await?
        .map_or_else(|| empty_body(key.kind), |intent| intent.body);
    match body.as_object_mut() {
        Some(map) => {
            map.insert(field.to_string(), value);
        }
        None => {
            let mut fresh = empty_body(key.kind);
            if let Some(map) = fresh.as_object_mut() {
                map.insert(field.to_string(), value);
            }
            body = fresh;
        }
    }
    Ok(Document::new(key, body, operation_id))
}

fn non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn snapshot<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}
