//! Fixed stage sequence: validate, setup, run, extract.
//!
//! Stage methods hand typed tokens to each other ([`PreparedRun`] then
//! [`CompletedRun`]) so they cannot be called out of order. Every failure
//! after a run record exists writes an `error` record before returning.

use super::session::Session;
use crate::canonical::{canonicalize, CanonicalConfiguration};
use crate::engine::{ProgressWindow, StagePayload, StageReport, StageRequest};
use crate::error::{OrchestratorError, Result};
use crate::metrics::{self, FitSummary, SeriesPairs};
use crate::model::{
    Configuration, Installation, Requirement, RunRecord, RunStatus, Stage, StageEvent,
    ValidatedInstallation,
};
use crate::storage::RunUpdate;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Idle,
    Validating,
    SettingUp,
    Running,
    Extracting,
    Done,
    Failed,
}

/// A configuration with a `pending` record, ready for the run stage.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub installation: Installation,
    pub canonical: CanonicalConfiguration,
    pub scenario: Option<String>,
}

/// A configuration whose simulation finished and produced `output_file`.
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub prepared: PreparedRun,
    pub output_file: String,
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum SetupOutcome {
    Prepared(PreparedRun),
    Reused(RunRecord),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "record", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Evaluated(RunRecord),
    Reused(RunRecord),
}

impl PipelineOutcome {
    pub fn record(&self) -> &RunRecord {
        match self {
            PipelineOutcome::Evaluated(r) | PipelineOutcome::Reused(r) => r,
        }
    }

    pub fn into_record(self) -> RunRecord {
        match self {
            PipelineOutcome::Evaluated(r) | PipelineOutcome::Reused(r) => r,
        }
    }

    pub fn is_reused(&self) -> bool {
        matches!(self, PipelineOutcome::Reused(_))
    }
}

pub struct Pipeline<'a> {
    session: &'a Session,
    state: PipelineState,
}

impl<'a> Pipeline<'a> {
    pub fn new(session: &'a Session) -> Self {
        Self {
            session,
            state: PipelineState::Idle,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn session(&self) -> &'a Session {
        self.session
    }

    fn enter(&mut self, next: PipelineState) {
        debug!(from = ?self.state, to = ?next, "pipeline transition");
        self.state = next;
    }

    /// Launch a stage; an `error` payload becomes `WorkerFailed`.
    async fn launch(&self, request: StageRequest, configuration_id: Option<&str>) -> Result<StageReport> {
        let stage = request.stage;
        self.session.emit(StageEvent::StageStarted {
            stage,
            configuration_id: configuration_id.map(str::to_string),
        });
        let report = self
            .session
            .supervisor()
            .run(request, self.session.events())
            .await?;
        if !report.payload.is_success() {
            return Err(OrchestratorError::worker(stage, report.diagnostic()));
        }
        self.session
            .emit(StageEvent::StageFinished { stage, ok: true });
        Ok(report)
    }

    /// Move to `Failed`, persist the error on the record if there is one,
    /// and hand the error back for propagation.
    async fn fail(
        &mut self,
        stage: Stage,
        configuration_id: Option<&str>,
        err: OrchestratorError,
    ) -> OrchestratorError {
        self.enter(PipelineState::Failed);
        self.session
            .emit(StageEvent::StageFinished { stage, ok: false });
        warn!(%stage, configuration_id, "stage failed: {err}");
        if let Some(id) = configuration_id {
            if let Err(write_err) = self
                .session
                .cache()
                .update(id, RunUpdate::error(err.record_message()))
                .await
            {
                warn!(configuration_id = id, "could not record failure: {write_err}");
            }
        }
        err
    }

    /// Check the installation. A failure lists every missing requirement
    /// and leaves the session usable for a retry.
    pub async fn validate(&mut self) -> Result<ValidatedInstallation> {
        self.enter(PipelineState::Validating);
        let session = self.session;
        let settings = session.settings();
        let request = StageRequest::new(
            Stage::Validate,
            vec![
                settings.ifs_root.to_string_lossy().into_owned(),
                "--output-path".into(),
                settings.output_dir.to_string_lossy().into_owned(),
                "--input-file".into(),
                settings.input_file.to_string_lossy().into_owned(),
            ],
        );
        session.emit(StageEvent::StageStarted {
            stage: Stage::Validate,
            configuration_id: None,
        });

        let report = match session.supervisor().run(request, session.events()).await {
            Ok(report) => report,
            Err(err) => return Err(self.fail(Stage::Validate, None, err).await),
        };
        match interpret_validation(&report, settings.ifs_root.clone()) {
            Ok(validated) => {
                info!(
                    root = %validated.root.display(),
                    base_year = validated.base_year,
                    "installation validated"
                );
                session.emit(StageEvent::StageFinished {
                    stage: Stage::Validate,
                    ok: true,
                });
                self.enter(PipelineState::Idle);
                Ok(validated)
            }
            Err(err) => Err(self.fail(Stage::Validate, None, err).await),
        }
    }

    /// Register the installation, canonicalize, and make sure a `pending`
    /// record exists before the setup worker prepares the scenario. An
    /// `evaluated` record short-circuits to reuse.
    pub async fn set_up(
        &mut self,
        installation: &ValidatedInstallation,
        cfg: &Configuration,
    ) -> Result<SetupOutcome> {
        self.enter(PipelineState::SettingUp);
        let session = self.session;

        let (registered, canonical) = match register_and_canonicalize(session, installation, cfg).await {
            Ok(found) => found,
            Err(err) => return Err(self.fail(Stage::Setup, None, err).await),
        };
        let id = canonical.configuration_id.clone();

        let existing = match session.cache().lookup(&id).await {
            Ok(existing) => existing,
            Err(err) => return Err(self.fail(Stage::Setup, None, err).await),
        };
        let written = match existing {
            Some(record) if record.status == RunStatus::Evaluated => {
                info!(configuration_id = %id, fit_pooled = ?record.fit_pooled, "cache hit");
                session.emit(StageEvent::CacheHit {
                    configuration_id: id,
                    fit_pooled: record.fit_pooled.unwrap_or(f64::NAN),
                });
                self.enter(PipelineState::Done);
                return Ok(SetupOutcome::Reused(record));
            }
            Some(record) if record.status != RunStatus::Error => {
                // Left behind by an interrupted session.
                debug!(configuration_id = %id, status = record.status.as_str(), "resetting stale record");
                session
                    .cache()
                    .update(&id, RunUpdate::status(RunStatus::Pending))
                    .await
            }
            _ => session.cache().insert_pending(registered.id, &canonical).await,
        };
        if let Err(err) = written {
            return Err(self.fail(Stage::Setup, None, err).await);
        }

        let payload = json!({
            "ifs_root": installation.root,
            "endYear": canonical.end_year,
            "baseYear": canonical.base_year,
            "parameters": canonical.input_param,
            "coefficients": canonical.input_coef,
            "outputs": canonical.output_set,
            "configuration_id": canonical.configuration_id,
            "dataset_id": canonical.dataset_id,
        });
        let request = StageRequest::new(Stage::Setup, vec!["--payload".into(), payload.to_string()]);
        let report = match self.launch(request, Some(&id)).await {
            Ok(report) => report,
            Err(err) => return Err(self.fail(Stage::Setup, Some(&id), err).await),
        };
        let scenario = report
            .payload
            .field("sce_id")
            .or_else(|| report.payload.field("sce_file"))
            .map(value_text);
        Ok(SetupOutcome::Prepared(PreparedRun {
            installation: registered,
            canonical,
            scenario,
        }))
    }

    /// Run the simulation for a prepared configuration, relaying progress.
    pub async fn run_simulation(&mut self, prepared: PreparedRun) -> Result<CompletedRun> {
        self.enter(PipelineState::Running);
        let session = self.session;
        let settings = session.settings();
        let id = prepared.canonical.configuration_id.clone();
        let window = ProgressWindow {
            base_year: prepared.canonical.base_year,
            end_year: prepared.canonical.end_year,
        };
        let run_dir = settings.output_dir.join("runs").join(&id);
        let request = StageRequest::new(
            Stage::Run,
            vec![
                "--ifs-root".into(),
                settings.ifs_root.to_string_lossy().into_owned(),
                "--end-year".into(),
                window.end_year.to_string(),
                "--output-dir".into(),
                run_dir.to_string_lossy().into_owned(),
                "--base-year".into(),
                window.base_year.to_string(),
                "--model-id".into(),
                id.clone(),
            ],
        )
        .with_progress(window);

        let report = match self.launch(request, Some(&id)).await {
            Ok(report) => report,
            Err(err) => return Err(self.fail(Stage::Run, Some(&id), err).await),
        };
        let Some(output_file) = report.payload.str_field("output_file").map(str::to_string) else {
            let err = OrchestratorError::worker(Stage::Run, "run worker did not report an output file");
            return Err(self.fail(Stage::Run, Some(&id), err).await);
        };
        let mut artifacts = vec![output_file.clone()];
        if let Some(metadata) = report.payload.str_field("metadata_file") {
            artifacts.push(metadata.to_string());
        }
        if let Err(err) = session
            .cache()
            .update(&id, RunUpdate::completed(artifacts.clone()))
            .await
        {
            return Err(self.fail(Stage::Run, Some(&id), err).await);
        }
        info!(
            configuration_id = %id,
            output_file = %output_file,
            elapsed = %humantime::format_duration(report.elapsed),
            "simulation completed"
        );
        Ok(CompletedRun {
            prepared,
            output_file,
            artifacts,
        })
    }

    /// Compare the simulation output against history and store the fit.
    pub async fn extract(&mut self, run: CompletedRun) -> Result<RunRecord> {
        self.enter(PipelineState::Extracting);
        let session = self.session;
        let settings = session.settings();
        let id = run.prepared.canonical.configuration_id.clone();
        let output_set = match serde_json::to_string(&run.prepared.canonical.output_set) {
            Ok(text) => text,
            Err(err) => return Err(self.fail(Stage::Extract, Some(&id), err.into()).await),
        };
        let request = StageRequest::new(
            Stage::Extract,
            vec![
                "--ifs-root".into(),
                settings.ifs_root.to_string_lossy().into_owned(),
                "--model-db".into(),
                run.output_file.clone(),
                "--input-file".into(),
                settings.input_file.to_string_lossy().into_owned(),
                "--model-id".into(),
                id.clone(),
                "--output-set".into(),
                output_set,
            ],
        );

        let report = match self.launch(request, Some(&id)).await {
            Ok(report) => report,
            Err(err) => return Err(self.fail(Stage::Extract, Some(&id), err).await),
        };
        let Some(fit) = fit_from_payload(&report.payload) else {
            let err = OrchestratorError::worker(
                Stage::Extract,
                "extract worker reported no comparable series",
            );
            return Err(self.fail(Stage::Extract, Some(&id), err).await);
        };
        match session
            .cache()
            .update(&id, RunUpdate::evaluated(fit.fit_var, fit.fit_pooled))
            .await
        {
            Ok(record) => {
                info!(configuration_id = %id, fit_pooled = fit.fit_pooled, "configuration evaluated");
                self.enter(PipelineState::Done);
                Ok(record)
            }
            Err(err) => Err(self.fail(Stage::Extract, Some(&id), err).await),
        }
    }

    /// Setup, then run and extract unless the configuration was already evaluated.
    pub async fn submit(
        &mut self,
        installation: &ValidatedInstallation,
        cfg: &Configuration,
    ) -> Result<PipelineOutcome> {
        match self.set_up(installation, cfg).await? {
            SetupOutcome::Reused(record) => Ok(PipelineOutcome::Reused(record)),
            SetupOutcome::Prepared(prepared) => {
                let completed = self.run_simulation(prepared).await?;
                let record = self.extract(completed).await?;
                Ok(PipelineOutcome::Evaluated(record))
            }
        }
    }
}

async fn register_and_canonicalize(
    session: &Session,
    installation: &ValidatedInstallation,
    cfg: &Configuration,
) -> Result<(Installation, CanonicalConfiguration)> {
    if cfg.base_year != installation.base_year {
        return Err(OrchestratorError::InvalidConfiguration(format!(
            "base year {} does not match the installation base year {}",
            cfg.base_year, installation.base_year
        )));
    }
    let registered = session
        .registry()
        .register(&installation.root, installation.base_year)
        .await?;
    let dictionary = session.registry().dictionary(registered.id).await?;
    let canonical = canonicalize(cfg, &dictionary)?;
    Ok((registered, canonical))
}

fn interpret_validation(report: &StageReport, root: PathBuf) -> Result<ValidatedInstallation> {
    let payload = &report.payload;
    let requirements: Vec<Requirement> = payload
        .field("requirements")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    let mut missing: Vec<String> = requirements
        .iter()
        .filter(|r| !r.exists)
        .map(|r| r.file.clone())
        .collect();
    if let Some(files) = payload.field("missingFiles").and_then(Value::as_array) {
        for file in files.iter().filter_map(Value::as_str) {
            if !missing.iter().any(|m| m == file) {
                missing.push(file.to_string());
            }
        }
    }
    if !missing.is_empty() {
        return Err(OrchestratorError::InstallationInvalid { missing });
    }

    let valid = payload.field("valid").and_then(Value::as_bool).unwrap_or(true);
    if !payload.is_success() || !valid {
        return Err(OrchestratorError::worker(Stage::Validate, report.diagnostic()));
    }
    let base_year = payload
        .field("base_year")
        .and_then(year_value)
        .ok_or_else(|| OrchestratorError::worker(Stage::Validate, "validation did not report a base year"))?;
    Ok(ValidatedInstallation {
        root,
        base_year,
        requirements,
    })
}

fn year_value(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|y| i32::try_from(y).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

type RawSeries = BTreeMap<String, Vec<(Option<f64>, Option<f64>)>>;

/// Fit numbers reported directly, or computed from joined series.
fn fit_from_payload(payload: &StagePayload) -> Option<FitSummary> {
    if let Some(raw) = payload.field("fit_var") {
        let reported: BTreeMap<String, Option<f64>> = serde_json::from_value(raw.clone()).ok()?;
        let fit_var: BTreeMap<String, f64> = reported
            .into_iter()
            .filter_map(|(var, fit)| fit.filter(|v| v.is_finite()).map(|v| (var, v)))
            .collect();
        let fit_pooled = payload
            .field("fit_pooled")
            .and_then(Value::as_f64)
            .filter(|v| v.is_finite())
            .or_else(|| metrics::pooled_from_variables(&fit_var))?;
        return Some(FitSummary {
            fit_var,
            fit_pooled,
        });
    }
    let raw: RawSeries = serde_json::from_value(payload.field("series")?.clone()).ok()?;
    let series: SeriesPairs = raw
        .into_iter()
        .map(|(var, pairs)| {
            let pairs = pairs
                .into_iter()
                .map(|(sim, hist)| (sim.unwrap_or(f64::NAN), hist.unwrap_or(f64::NAN)))
                .collect();
            (var, pairs)
        })
        .collect();
    metrics::fit_from_series(&series)
}
