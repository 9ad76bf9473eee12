use crate::canonical::Dictionary;
use crate::engine::{Supervisor, WorkerLauncher};
use crate::model::{ConfigurationInput, StageEvent};
use crate::orchestrator::{
    process_job_completion, run_controller, Job, JobOutput, OptimizeSettings, RunPlan, Session,
    SessionSettings,
};
use anyhow::{Context, Result};
use clap::Parser;
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

const HEARTBEAT: Duration = Duration::from_secs(30);

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "simtune",
    version,
    about = "Runs a simulation model through validate/setup/run/extract and tunes its inputs against history"
)]
pub struct Cli {
    /// Root folder of the simulation installation
    #[arg(long)]
    pub ifs_root: PathBuf,

    /// Folder for run artifacts and the default result store
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Input workbook handed to the validate and extract workers
    #[arg(long)]
    pub input_file: PathBuf,

    /// Configuration JSON (parameters, coefficients, outputs, end_year)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Dictionary JSON of known parameters/coefficients with their ranges
    #[arg(long)]
    pub dictionary: Option<PathBuf>,

    /// Result store path (defaults to <output-dir>/simtune.db)
    #[arg(long)]
    pub database: Option<PathBuf>,

    /// Simulation end year (overrides the configuration file)
    #[arg(long)]
    pub end_year: Option<i32>,

    /// Worker program invoked as `<worker> <worker-args..> <stage> <args..>`,
    /// or the interpreter for --scripts-dir
    #[arg(long)]
    pub worker: Option<PathBuf>,

    /// Extra leading argument for the worker program (repeatable)
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    pub worker_args: Vec<String>,

    /// Folder holding one worker script per stage
    #[arg(long)]
    pub scripts_dir: Option<PathBuf>,

    /// Upper bound on a single stage invocation
    #[arg(long, default_value = "6h")]
    pub stage_timeout: humantime::Duration,

    /// Only validate the installation
    #[arg(long)]
    pub validate_only: bool,

    /// Run the active-learning loop instead of a single configuration
    #[arg(long)]
    pub optimize: bool,

    #[arg(long, default_value_t = 30)]
    pub max_iterations: usize,

    /// Relative change of the best fit counted as no improvement
    #[arg(long, default_value_t = 0.0001)]
    pub convergence_threshold: f64,

    /// Iterations without improvement before stopping (0 disables)
    #[arg(long, default_value_t = 10)]
    pub patience: usize,

    /// Size of the sampled candidate design
    #[arg(long, default_value_t = 200)]
    pub samples: usize,

    /// Seed for the candidate design
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Print JSON result and exit
    #[arg(long)]
    pub json: bool,

    /// Print text summary and exit
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors (for cron usage)
    #[arg(long)]
    pub silent: bool,

    /// Export results as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,
}

impl Cli {
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(crate::storage::default_output_dir)
    }

    pub fn database(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.output_dir().join("simtune.db"))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {what} {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {what} {}", path.display()))
}

/// Build the worker launcher from CLI arguments.
pub fn build_launcher(args: &Cli) -> Result<WorkerLauncher> {
    match (&args.scripts_dir, &args.worker) {
        (Some(scripts_dir), interpreter) => Ok(WorkerLauncher::Scripts {
            interpreter: interpreter.clone().unwrap_or_else(|| PathBuf::from("python3")),
            scripts_dir: scripts_dir.clone(),
        }),
        (None, Some(program)) => Ok(WorkerLauncher::Dispatcher {
            program: program.clone(),
            leading_args: args.worker_args.clone(),
        }),
        (None, None) => Err(anyhow::anyhow!("pass --worker or --scripts-dir")),
    }
}

/// Build the job from CLI arguments.
pub(crate) fn build_job(args: &Cli) -> Result<Job> {
    if args.validate_only {
        return Ok(Job::Validate);
    }
    let config = args
        .config
        .as_deref()
        .context("--config is required unless --validate-only is given")?;
    let configuration: ConfigurationInput = read_json(config, "configuration")?;
    let dictionary = args
        .dictionary
        .as_deref()
        .map(|p| read_json::<Dictionary>(p, "dictionary"))
        .transpose()?;
    let plan = RunPlan {
        configuration,
        end_year: args.end_year,
        dictionary,
    };
    if !args.optimize {
        return Ok(Job::Run(plan));
    }
    Ok(Job::Optimize {
        plan,
        settings: OptimizeSettings {
            max_iterations: args.max_iterations,
            convergence_threshold: args.convergence_threshold,
            patience: args.patience,
        },
        samples: args.samples,
        seed: args.seed,
    })
}

async fn open_session(args: &Cli) -> Result<Session> {
    let launcher = build_launcher(args)?;
    let supervisor = Supervisor::new(launcher, Duration::from(args.stage_timeout));
    let settings = SessionSettings {
        ifs_root: args.ifs_root.clone(),
        output_dir: args.output_dir(),
        input_file: args.input_file.clone(),
    };
    let db = args.database();
    Session::open(settings, supervisor, &db)
        .await
        .with_context(|| format!("failed to open result store {}", db.display()))
}

/// Render one session event for text mode.
fn render_event(ev: &StageEvent) -> Option<String> {
    let line = match ev {
        StageEvent::StageStarted {
            stage,
            configuration_id,
        } => match configuration_id {
            Some(id) => format!("== {stage} {} ==", id.get(..12).unwrap_or(id)),
            None => format!("== {stage} =="),
        },
        StageEvent::Progress {
            stage,
            year,
            percent,
        } => match percent {
            Some(p) => format!("{stage}: year {year} ({p:.0}%)"),
            None => format!("{stage}: year {year}"),
        },
        StageEvent::StageFinished { stage, ok } => {
            if *ok {
                return None;
            }
            format!("{stage} failed")
        }
        StageEvent::CacheHit {
            configuration_id,
            fit_pooled,
        } => format!(
            "Cache hit {} (fit {fit_pooled:.6})",
            configuration_id.get(..12).unwrap_or(configuration_id)
        ),
        StageEvent::Iteration {
            iteration,
            fit_pooled,
            reused,
            best_fit,
            ..
        } => format!(
            "Iteration {iteration}: fit {fit_pooled:.6}{} best {best_fit:.6}",
            if *reused { " (cached)" } else { "" }
        ),
        StageEvent::Info(info) => info.to_message(),
    };
    Some(line)
}

pub async fn run(args: Cli) -> Result<()> {
    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }
    if args.json && args.text {
        return Err(anyhow::anyhow!("--json and --text are mutually exclusive"));
    }

    let job = build_job(&args)?;
    let session = open_session(&args).await?;
    let cache = session.cache().clone();

    let live = !args.json && !args.silent;
    let (out_tx, out_handle) = if args.silent {
        (None, None)
    } else {
        let (tx, handle) = spawn_output_writer();
        (Some(tx), Some(handle))
    };

    // Relay events to stderr in text mode; otherwise consume them silently.
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<StageEvent>();
    let relay_tx = out_tx.as_ref().filter(|_| live).cloned();
    let relay = tokio::spawn(async move {
        while let Some(ev) = evt_rx.recv().await {
            if let (Some(tx), Some(line)) = (relay_tx.as_ref(), render_event(&ev)) {
                let _ = tx.send(OutputLine::Stderr(line));
            }
        }
    });

    let result = run_controller(session, job, evt_tx, HEARTBEAT).await;
    let _ = relay.await;
    let output: JobOutput = result.context("job failed")?;

    let processed = process_job_completion(args.export_json.as_deref(), &cache, &output).await;

    if let Some(tx) = out_tx.as_ref() {
        if args.json {
            let out = serde_json::to_string_pretty(&output)?;
            let _ = tx.send(OutputLine::Stdout(out));
        } else {
            let summary = crate::text_summary::build_text_summary(&output, &processed.store);
            for line in summary.lines {
                let _ = tx.send(OutputLine::Stdout(line));
            }
        }
        for msg in processed.export_messages {
            let _ = tx.send(OutputLine::Stderr(msg));
        }
    }

    if let Some(tx) = out_tx {
        drop(tx);
    }
    if let Some(handle) = out_handle {
        let _ = handle.await;
    }

    Ok(())
}
