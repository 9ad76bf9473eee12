//! Post-job processing: exports and a snapshot of the result store.

use super::controller::JobOutput;
use crate::model::RunStatus;
use crate::storage::{self, ResultCache};
use serde::Serialize;
use std::path::Path;
use tracing::warn;

/// Record counts per status after the job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct StoreCounts {
    pub pending: i64,
    pub completed: i64,
    pub evaluated: i64,
    pub error: i64,
}

/// Result of post-job processing, ready for presentation layers.
pub(crate) struct ProcessedJob {
    pub export_messages: Vec<String>,
    pub store: StoreCounts,
}

async fn store_counts(cache: &ResultCache) -> crate::error::Result<StoreCounts> {
    Ok(StoreCounts {
        pending: cache.count(RunStatus::Pending).await?,
        completed: cache.count(RunStatus::Completed).await?,
        evaluated: cache.count(RunStatus::Evaluated).await?,
        error: cache.count(RunStatus::Error).await?,
    })
}

/// Export the job output if asked and read back the store counts.
pub(crate) async fn process_job_completion(
    export_json: Option<&Path>,
    cache: &ResultCache,
    output: &JobOutput,
) -> ProcessedJob {
    let mut export_messages = Vec::new();
    if let Some(path) = export_json {
        match storage::export_json(path, output) {
            Ok(()) => export_messages.push(format!("Exported JSON: {}", path.display())),
            Err(e) => export_messages.push(format!("Export JSON failed: {e:#}")),
        }
    }

    let store = store_counts(cache).await.unwrap_or_else(|e| {
        warn!("could not read store counts: {e}");
        StoreCounts::default()
    });

    ProcessedJob {
        export_messages,
        store,
    }
}
