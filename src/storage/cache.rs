//! Content-addressable result cache keyed by `configuration_id`.

use super::{ensure_schema, now_rfc3339, with_connection};
use crate::canonical::CanonicalConfiguration;
use crate::error::{CacheConflict, Result};
use crate::model::{RunRecord, RunStatus};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const RECORD_COLUMNS: &str = "configuration_id, dataset_id, installation_id, status, fit_var, \
     fit_pooled, message, artifacts, input_param, input_coef, output_set, created_at, updated_at";

/// Fields written by [`ResultCache::update`]. Absent fit values and
/// artifacts keep what is stored; the message is always replaced.
#[derive(Debug, Clone)]
pub struct RunUpdate {
    pub status: RunStatus,
    pub fit_var: Option<BTreeMap<String, f64>>,
    pub fit_pooled: Option<f64>,
    pub message: Option<String>,
    pub artifacts: Option<Vec<String>>,
}

impl RunUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status,
            fit_var: None,
            fit_pooled: None,
            message: None,
            artifacts: None,
        }
    }

    pub fn completed(artifacts: Vec<String>) -> Self {
        Self {
            artifacts: Some(artifacts),
            ..Self::status(RunStatus::Completed)
        }
    }

    pub fn evaluated(fit_var: BTreeMap<String, f64>, fit_pooled: f64) -> Self {
        Self {
            fit_var: Some(fit_var),
            fit_pooled: Some(fit_pooled),
            ..Self::status(RunStatus::Evaluated)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::status(RunStatus::Error)
        }
    }
}

/// SQLite-backed run record store.
#[derive(Debug, Clone)]
pub struct ResultCache {
    db_path: PathBuf,
}

impl ResultCache {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        ensure_schema(&db_path).await?;
        Ok(Self { db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub async fn lookup(&self, configuration_id: &str) -> Result<Option<RunRecord>> {
        let id = configuration_id.to_string();
        with_connection(&self.db_path, move |conn| {
            let sql = format!("SELECT {RECORD_COLUMNS} FROM run_record WHERE configuration_id = ?1");
            Ok(conn.query_row(&sql, params![id], record_from_row).optional()?)
        })
        .await
    }

    /// Create a `pending` record. An existing `error` record is reset to
    /// `pending`; any other existing record is a conflict.
    pub async fn insert_pending(
        &self,
        installation_id: i64,
        canonical: &CanonicalConfiguration,
    ) -> Result<RunRecord> {
        let id = canonical.configuration_id.clone();
        let dataset_id = canonical.dataset_id.clone();
        let input_param = serde_json::to_string(&canonical.input_param)?;
        let input_coef = serde_json::to_string(&canonical.input_coef)?;
        let output_set = serde_json::to_string(&canonical.output_set)?;

        with_connection(&self.db_path, move |conn| {
            let tx = conn.transaction()?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT status FROM run_record WHERE configuration_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let now = now_rfc3339();
            match existing.as_deref().and_then(RunStatus::parse) {
                None if existing.is_none() => {
                    tx.execute(
                        "INSERT INTO run_record (configuration_id, installation_id, dataset_id, \
                         input_param, input_coef, output_set, status, artifacts, created_at, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', '[]', ?7, ?7)",
                        params![id, installation_id, dataset_id, input_param, input_coef, output_set, now],
                    )?;
                    debug!(configuration_id = %id, "inserted pending run record");
                }
                Some(RunStatus::Error) => {
                    tx.execute(
                        "UPDATE run_record SET status = 'pending', fit_var = NULL, fit_pooled = NULL, \
                         message = NULL, artifacts = '[]', updated_at = ?2 WHERE configuration_id = ?1",
                        params![id, now],
                    )?;
                    debug!(configuration_id = %id, "reset errored run record to pending");
                }
                _ => return Err(CacheConflict::AlreadyExists(id).into()),
            }
            let sql = format!("SELECT {RECORD_COLUMNS} FROM run_record WHERE configuration_id = ?1");
            let record = tx.query_row(&sql, params![id], record_from_row)?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    /// Update a record in place. `evaluated` needs a finite pooled fit and
    /// `error` needs a message. Returns once the write is durable.
    pub async fn update(&self, configuration_id: &str, update: RunUpdate) -> Result<RunRecord> {
        let id = configuration_id.to_string();
        match update.status {
            RunStatus::Evaluated if !update.fit_pooled.is_some_and(f64::is_finite) => {
                return Err(CacheConflict::invalid(&id, update.status, "pooled fit must be finite").into());
            }
            RunStatus::Error if update.message.as_deref().map_or(true, |m| m.trim().is_empty()) => {
                return Err(CacheConflict::invalid(&id, update.status, "a message is required").into());
            }
            _ => {}
        }
        let fit_var = update.fit_var.as_ref().map(serde_json::to_string).transpose()?;
        let artifacts = update.artifacts.as_ref().map(serde_json::to_string).transpose()?;

        with_connection(&self.db_path, move |conn| {
            let tx = conn.transaction()?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM run_record WHERE configuration_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(current) = current else {
                return Err(CacheConflict::NotFound(id).into());
            };
            if let Some(current) = RunStatus::parse(&current) {
                if current.is_terminal() && current != update.status {
                    return Err(CacheConflict::invalid(
                        &id,
                        update.status,
                        "record is already final; resubmit it instead",
                    )
                    .into());
                }
            }
            let changed = tx.execute(
                "UPDATE run_record SET status = ?2, fit_var = COALESCE(?3, fit_var), \
                 fit_pooled = COALESCE(?4, fit_pooled), message = ?5, \
                 artifacts = COALESCE(?6, artifacts), updated_at = ?7 \
                 WHERE configuration_id = ?1",
                params![
                    id,
                    update.status.as_str(),
                    fit_var,
                    update.fit_pooled,
                    update.message,
                    artifacts,
                    now_rfc3339()
                ],
            )?;
            if changed == 0 {
                return Err(CacheConflict::NotFound(id).into());
            }
            debug!(configuration_id = %id, status = update.status.as_str(), "updated run record");
            let sql = format!("SELECT {RECORD_COLUMNS} FROM run_record WHERE configuration_id = ?1");
            let record = tx.query_row(&sql, params![id], record_from_row)?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    /// Every `evaluated` record sharing `dataset_id`, oldest first.
    pub async fn evaluated_samples(&self, dataset_id: &str) -> Result<Vec<RunRecord>> {
        let dataset_id = dataset_id.to_string();
        with_connection(&self.db_path, move |conn| {
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM run_record \
                 WHERE dataset_id = ?1 AND status = 'evaluated' ORDER BY created_at ASC, configuration_id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![dataset_id], record_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    pub async fn count(&self, status: RunStatus) -> Result<i64> {
        with_connection(&self.db_path, move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM run_record WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )?)
        })
        .await
    }
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let status: String = row.get(3)?;
    let status = RunStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            format!("unknown run status {status:?}").into(),
        )
    })?;
    let fit_var = match row.get::<_, Option<String>>(4)? {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        None => BTreeMap::new(),
    };
    Ok(RunRecord {
        configuration_id: row.get(0)?,
        dataset_id: row.get(1)?,
        installation_id: row.get(2)?,
        status,
        fit_var,
        fit_pooled: row.get(5)?,
        message: row.get(6)?,
        artifacts: json_column(row, 7)?,
        input_param: json_column(row, 8)?,
        input_coef: json_column(row, 9)?,
        output_set: json_column(row, 10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}
