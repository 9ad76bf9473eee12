//! Embedded SQLite store: installations, dictionaries and run records.

mod cache;
mod installation;

pub use cache::{ResultCache, RunUpdate};
pub use installation::InstallationRegistry;

use crate::error::Result;
use anyhow::Context;
use rusqlite::Connection;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS installation (
    installation_id INTEGER PRIMARY KEY AUTOINCREMENT,
    root_path TEXT NOT NULL,
    base_year INTEGER NOT NULL,
    registered_at TEXT NOT NULL,
    UNIQUE (root_path, base_year)
);
CREATE TABLE IF NOT EXISTS parameter (
    installation_id INTEGER NOT NULL REFERENCES installation(installation_id),
    param_name TEXT NOT NULL,
    param_default REAL,
    param_min REAL,
    param_max REAL,
    PRIMARY KEY (installation_id, param_name)
);
CREATE TABLE IF NOT EXISTS coefficient (
    installation_id INTEGER NOT NULL REFERENCES installation(installation_id),
    function_name TEXT NOT NULL,
    x_name TEXT NOT NULL,
    beta_name TEXT NOT NULL,
    beta_default REAL,
    beta_std REAL,
    PRIMARY KEY (installation_id, function_name, x_name, beta_name)
);
CREATE TABLE IF NOT EXISTS output_variable (
    installation_id INTEGER NOT NULL REFERENCES installation(installation_id),
    variable_name TEXT NOT NULL,
    PRIMARY KEY (installation_id, variable_name)
);
CREATE TABLE IF NOT EXISTS run_record (
    configuration_id TEXT PRIMARY KEY,
    installation_id INTEGER NOT NULL,
    dataset_id TEXT NOT NULL,
    input_param TEXT NOT NULL,
    input_coef TEXT NOT NULL,
    output_set TEXT NOT NULL,
    status TEXT NOT NULL,
    fit_var TEXT,
    fit_pooled REAL,
    message TEXT,
    artifacts TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_run_record_dataset ON run_record(dataset_id, status);
"#;

/// Open a connection with durable write settings.
fn connect(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// Run `f` against a fresh connection on the blocking pool.
async fn with_connection<T, F>(path: &Path, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
{
    let path = path.to_path_buf();
    task::spawn_blocking(move || {
        let mut conn = connect(&path)?;
        f(&mut conn)
    })
    .await?
}

async fn ensure_schema(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    with_connection(path, |conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
    })
    .await
}

pub(crate) fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

/// Default output folder when none is given on the command line.
pub fn default_output_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("simtune"))
        .unwrap_or_else(|| PathBuf::from("simtune-output"))
}

/// Write any serializable result as pretty JSON.
pub fn export_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    let out = serde_json::to_string_pretty(value)?;
    std::fs::write(path, out).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
