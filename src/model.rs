use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// function -> input variable -> coefficient slot -> value
pub type CoefficientMap = BTreeMap<String, BTreeMap<String, BTreeMap<String, f64>>>;

/// One candidate set of simulation input overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub base_year: i32,
    pub end_year: i32,
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,
    #[serde(default)]
    pub coefficients: CoefficientMap,
    /// Selected output variable -> historical comparison series.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

/// Configuration as written by a user. The base year normally comes from the
/// validated installation, so it is optional here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationInput {
    #[serde(default)]
    pub base_year: Option<i32>,
    #[serde(default)]
    pub end_year: Option<i32>,
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,
    #[serde(default)]
    pub coefficients: CoefficientMap,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

impl ConfigurationInput {
    /// Resolve into a full configuration. An explicit `end_year` wins over the file.
    pub fn resolve(self, base_year: i32, end_year: Option<i32>) -> Option<Configuration> {
        let end_year = end_year.or(self.end_year)?;
        Some(Configuration {
            base_year: self.base_year.unwrap_or(base_year),
            end_year,
            parameters: self.parameters,
            coefficients: self.coefficients,
            outputs: self.outputs,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Setup,
    Run,
    Extract,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Setup => "setup",
            Stage::Run => "run",
            Stage::Extract => "extract",
        }
    }

    /// Script file used when workers are launched through an interpreter.
    pub fn script_name(self) -> &'static str {
        match self {
            Stage::Validate => "validate_ifs.py",
            Stage::Setup => "model_setup.py",
            Stage::Run => "run_ifs.py",
            Stage::Extract => "extract_compare.py",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Completed,
    Evaluated,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Completed => "completed",
            RunStatus::Evaluated => "evaluated",
            RunStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "completed" => Some(RunStatus::Completed),
            "evaluated" => Some(RunStatus::Evaluated),
            "error" => Some(RunStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Evaluated | RunStatus::Error)
    }
}

/// Persisted outcome of one configuration, keyed by `configuration_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub configuration_id: String,
    pub dataset_id: String,
    pub installation_id: i64,
    pub status: RunStatus,
    #[serde(default)]
    pub fit_var: BTreeMap<String, f64>,
    pub fit_pooled: Option<f64>,
    pub message: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub input_param: BTreeMap<String, f64>,
    pub input_coef: CoefficientMap,
    pub output_set: BTreeMap<String, String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A required file or folder reported by the validation stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub file: String,
    pub exists: bool,
}

/// Result of a successful validation stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedInstallation {
    pub root: PathBuf,
    pub base_year: i32,
    pub requirements: Vec<Requirement>,
}

/// Installation row as registered in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installation {
    pub id: i64,
    pub root: PathBuf,
    pub base_year: i32,
}

/// One progress observation of a stage invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub year: i32,
    pub percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageEvent {
    StageStarted {
        stage: Stage,
        configuration_id: Option<String>,
    },
    Progress {
        stage: Stage,
        year: i32,
        percent: Option<f64>,
    },
    StageFinished {
        stage: Stage,
        ok: bool,
    },
    CacheHit {
        configuration_id: String,
        fit_pooled: f64,
    },
    Iteration {
        iteration: usize,
        configuration_id: String,
        fit_pooled: f64,
        reused: bool,
        best_fit: f64,
    },
    Info(InfoEvent),
}

/// Structured info events consumed by CLI layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InfoEvent {
    Message(String),
    Heartbeat { stage: Stage, elapsed_secs: u64 },
    Interrupted,
}

impl InfoEvent {
    /// Render a human-readable message for CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::Heartbeat {
                stage,
                elapsed_secs,
            } => format!("{stage} stage still running ({elapsed_secs}s)"),
            InfoEvent::Interrupted => "Interrupted; abandoning the active stage".to_string(),
        }
    }
}

/// Best configuration seen by one active-learning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestSoFar {
    pub configuration_id: String,
    pub fit_pooled: f64,
    pub iterations: usize,
    pub external_runs: usize,
    pub cache_hits: usize,
    pub failures: usize,
}

impl BestSoFar {
    pub fn seeded(configuration_id: String, fit_pooled: f64) -> Self {
        Self {
            configuration_id,
            fit_pooled,
            iterations: 0,
            external_runs: 0,
            cache_hits: 0,
            failures: 0,
        }
    }

    /// Record a finite fit; returns true when it became the new best.
    pub fn offer(&mut self, configuration_id: &str, fit_pooled: f64) -> bool {
        if fit_pooled.is_finite() && fit_pooled < self.fit_pooled {
            self.configuration_id = configuration_id.to_string();
            self.fit_pooled = fit_pooled;
            true
        } else {
            false
        }
    }
}
