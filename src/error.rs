//! Error taxonomy surfaced by the canonicalizer, cache, supervisor and pipeline.

use crate::model::{RunStatus, Stage};
use thiserror::Error;

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Caller error; never retried automatically.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The worker failed or produced no usable payload. `message` carries the
    /// captured diagnostic text verbatim when there was any.
    #[error("{stage} stage failed: {message}")]
    WorkerFailed { stage: Stage, message: String },

    #[error(transparent)]
    Cache(#[from] CacheConflict),

    /// Every missing or unreadable requirement, not just the first.
    #[error("installation is invalid, missing: {}", .missing.join(", "))]
    InstallationInvalid { missing: Vec<String> },

    #[error("a {0} stage is already in flight in this session")]
    StageBusy(Stage),

    #[error("result store: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl OrchestratorError {
    pub(crate) fn worker(stage: Stage, message: impl Into<String>) -> Self {
        OrchestratorError::WorkerFailed {
            stage,
            message: message.into(),
        }
    }

    /// Text stored on an `error` run record.
    pub fn record_message(&self) -> String {
        match self {
            OrchestratorError::WorkerFailed { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Sequencing errors from the result cache.
#[derive(Debug, Error)]
pub enum CacheConflict {
    #[error("run record {0} already exists")]
    AlreadyExists(String),

    #[error("run record {0} not found")]
    NotFound(String),

    #[error("run record {id} cannot become {status}: {reason}")]
    InvalidTransition {
        id: String,
        status: &'static str,
        reason: &'static str,
    },
}

impl CacheConflict {
    pub(crate) fn invalid(id: &str, status: RunStatus, reason: &'static str) -> Self {
        CacheConflict::InvalidTransition {
            id: id.to_string(),
            status: status.as_str(),
            reason,
        }
    }
}
