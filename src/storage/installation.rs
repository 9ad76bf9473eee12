//! Installation metadata and the per-installation name dictionaries.

use super::{ensure_schema, now_rfc3339, with_connection};
use crate::canonical::{CoefficientSpec, Dictionary, ParameterSpec};
use crate::error::Result;
use crate::model::Installation;
use rusqlite::params;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone)]
pub struct InstallationRegistry {
    db_path: PathBuf,
}

impl InstallationRegistry {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        ensure_schema(&db_path).await?;
        Ok(Self { db_path })
    }

    /// Return the installation row for (root, base year), creating it once.
    pub async fn register(&self, root: &Path, base_year: i32) -> Result<Installation> {
        let root = root.to_path_buf();
        with_connection(&self.db_path, move |conn| {
            let root_text = root.to_string_lossy().into_owned();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO installation (root_path, base_year, registered_at) VALUES (?1, ?2, ?3)",
                params![root_text, base_year, now_rfc3339()],
            )?;
            let id: i64 = conn.query_row(
                "SELECT installation_id FROM installation WHERE root_path = ?1 AND base_year = ?2",
                params![root_text, base_year],
                |row| row.get(0),
            )?;
            if inserted > 0 {
                info!(installation_id = id, root = %root.display(), base_year, "registered installation");
            }
            Ok(Installation {
                id,
                root,
                base_year,
            })
        })
        .await
    }

    /// Replace the stored dictionary entries named in `dictionary`.
    pub async fn import_dictionary(&self, installation_id: i64, dictionary: &Dictionary) -> Result<()> {
        let dictionary = dictionary.clone();
        with_connection(&self.db_path, move |conn| {
            let tx = conn.transaction()?;
            for p in &dictionary.parameters {
                tx.execute(
                    "INSERT OR REPLACE INTO parameter (installation_id, param_name, param_default, param_min, param_max) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![installation_id, p.name, p.default, p.min, p.max],
                )?;
            }
            for c in &dictionary.coefficients {
                tx.execute(
                    "INSERT OR REPLACE INTO coefficient (installation_id, function_name, x_name, beta_name, beta_default, beta_std) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![installation_id, c.function, c.x, c.beta, c.default, c.std],
                )?;
            }
            for name in &dictionary.outputs {
                tx.execute(
                    "INSERT OR IGNORE INTO output_variable (installation_id, variable_name) VALUES (?1, ?2)",
                    params![installation_id, name],
                )?;
            }
            tx.commit()?;
            info!(
                installation_id,
                parameters = dictionary.parameters.len(),
                coefficients = dictionary.coefficients.len(),
                "imported dictionary"
            );
            Ok(())
        })
        .await
    }

    pub async fn dictionary(&self, installation_id: i64) -> Result<Dictionary> {
        with_connection(&self.db_path, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT param_name, param_default, param_min, param_max FROM parameter \
                 WHERE installation_id = ?1 ORDER BY param_name",
            )?;
            let parameters = stmt
                .query_map(params![installation_id], |row| {
                    Ok(ParameterSpec {
                        name: row.get(0)?,
                        default: row.get(1)?,
                        min: row.get(2)?,
                        max: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut stmt = conn.prepare(
                "SELECT function_name, x_name, beta_name, beta_default, beta_std FROM coefficient \
                 WHERE installation_id = ?1 ORDER BY function_name, x_name, beta_name",
            )?;
            let coefficients = stmt
                .query_map(params![installation_id], |row| {
                    Ok(CoefficientSpec {
                        function: row.get(0)?,
                        x: row.get(1)?,
                        beta: row.get(2)?,
                        default: row.get(3)?,
                        std: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut stmt = conn.prepare(
                "SELECT variable_name FROM output_variable WHERE installation_id = ?1 ORDER BY variable_name",
            )?;
            let outputs = stmt
                .query_map(params![installation_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;

            Ok(Dictionary {
                parameters,
                coefficients,
                outputs,
            })
        })
        .await
    }
}
