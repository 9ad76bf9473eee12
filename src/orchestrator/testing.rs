//! Fake stage worker and session fixture shared by the orchestrator tests.

use super::session::{Session, SessionSettings};
use crate::canonical::Dictionary;
use crate::engine::{Supervisor, WorkerLauncher};
use crate::model::Configuration;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// `sh worker.sh <log> <stage> <args..>`; every invocation appends its stage
/// name to the log. The first extract reports fit 1.0, later ones 0.5.
/// A `<log>.fail-<stage>` file makes that stage fail on stderr, and a
/// `<log>.series` file makes extract report raw series instead of fits.
pub(crate) const WORKER: &str = r#"
log="$1"; stage="$2"; shift 2
echo "$stage" >> "$log"
if [ -e "$log.fail-$stage" ]; then
  echo "$stage exploded" >&2
  exit 2
fi
case "$stage" in
  validate)
    printf '{"status": "success", "message": "ok", "data": {"valid": true, "base_year": 2019, "requirements": [{"file": "net8/ifs.exe", "exists": true}]}}\n'
    ;;
  setup)
    printf '{"status": "success", "message": "scenario ready", "data": {"sce_id": 7}}\n'
    ;;
  run)
    echo "starting"
    echo "Year 2019"
    echo "Year 2020"
    echo "Year 2020"
    echo "Year 2021"
    printf '{"status": "success", "message": "done", "data": {"output_file": "runs/model.db"}}\n'
    ;;
  extract)
    if [ -e "$log.series" ]; then
      printf '{"status": "success", "message": "compared", "data": {"series": {"POP": [[1.0, 2.0], [3.0, 1.0], [null, 4.0]]}}}\n'
      exit 0
    fi
    n=$(grep -c '^extract$' "$log")
    if [ "$n" -eq 1 ]; then fit=1.0; else fit=0.5; fi
    printf '{"status": "success", "message": "compared", "data": {"fit_var": {"POP": %s}, "fit_pooled": %s}}\n' "$fit" "$fit"
    ;;
esac
"#;

pub(crate) struct Fixture {
    pub dir: TempDir,
    pub session: Session,
    log: PathBuf,
}

impl Fixture {
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_worker(WORKER).await
    }

    pub async fn with_worker(body: &str) -> anyhow::Result<Self> {
        let dir = TempDir::new()?;
        let script = dir.path().join("worker.sh");
        let log = dir.path().join("invocations.log");
        std::fs::write(&script, body)?;
        std::fs::write(&log, "")?;

        let ifs_root = dir.path().join("ifs");
        let supervisor = Supervisor::new(
            WorkerLauncher::Dispatcher {
                program: PathBuf::from("sh"),
                leading_args: vec![
                    script.to_string_lossy().into_owned(),
                    log.to_string_lossy().into_owned(),
                ],
            },
            Duration::from_secs(30),
        );
        let session = Session::open(
            SessionSettings {
                ifs_root: ifs_root.clone(),
                output_dir: dir.path().join("out"),
                input_file: dir.path().join("input.xlsx"),
            },
            supervisor,
            &dir.path().join("store.db"),
        )
        .await?;

        let installation = session.registry().register(&ifs_root, 2019).await?;
        let dictionary: Dictionary = serde_json::from_str(
            r#"{
                "parameters": [{"name": "tfrmin", "default": 1.0, "min": 0.5, "max": 2.0}],
                "coefficients": [{"function": "GDPfn", "x": "Capital", "beta": "b1", "default": 0.3, "std": 0.05}],
                "outputs": ["POP"]
            }"#,
        )?;
        session
            .registry()
            .import_dictionary(installation.id, &dictionary)
            .await?;

        Ok(Self { dir, session, log })
    }

    /// Make `stage` fail (or succeed again) on its next launches.
    pub fn fail_stage(&self, stage: &str, fail: bool) {
        let flag = self.flag(&format!("fail-{stage}"));
        if fail {
            let _ = std::fs::write(flag, "");
        } else {
            let _ = std::fs::remove_file(flag);
        }
    }

    pub fn report_series(&self) {
        let _ = std::fs::write(self.flag("series"), "");
    }

    fn flag(&self, name: &str) -> PathBuf {
        let mut path = self.log.clone().into_os_string();
        path.push(format!(".{name}"));
        PathBuf::from(path)
    }

    /// Number of times the worker was launched for `stage`.
    pub fn invocations(&self, stage: &str) -> usize {
        std::fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .filter(|l| *l == stage)
            .count()
    }

    pub fn configuration(&self, tfrmin: f64) -> Configuration {
        serde_json::from_str(&format!(
            r#"{{
                "base_year": 2019,
                "end_year": 2021,
                "parameters": {{"tfrmin": {tfrmin}}},
                "coefficients": {{"GDPfn": {{"Capital": {{"b1": 0.3}}}}}},
                "outputs": {{"POP": "SeriesPopulation"}}
            }}"#
        ))
        .unwrap_or_else(|e| panic!("fixture configuration: {e}"))
    }
}
