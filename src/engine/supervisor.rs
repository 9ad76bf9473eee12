//! Launches one worker process per stage and resolves it exactly once.
//!
//! Reader tasks and the exit waiter only forward [`Signal`]s; the
//! [`Invocation`] owned by [`Supervisor::run`] is the single place that
//! interprets them, so resolution cannot be reported twice.

use super::line_buffer::LineBuffer;
use super::payload::{last_payload, parse_payload, StagePayload};
use super::progress::{parse_year_marker, ProgressTracker, ProgressWindow};
use super::EventSender;
use crate::error::{OrchestratorError, Result};
use crate::model::{ProgressSample, Stage, StageEvent};
use bytes::Bytes;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info, warn};

/// How stage workers are started.
#[derive(Debug, Clone)]
pub enum WorkerLauncher {
    /// `<program> <leading_args..> <stage> <args..>`
    Dispatcher {
        program: PathBuf,
        leading_args: Vec<String>,
    },
    /// `<interpreter> <scripts_dir>/<stage script> <args..>`
    Scripts {
        interpreter: PathBuf,
        scripts_dir: PathBuf,
    },
}

impl WorkerLauncher {
    fn command(&self, stage: Stage) -> Command {
        match self {
            WorkerLauncher::Dispatcher {
                program,
                leading_args,
            } => {
                let mut cmd = Command::new(program);
                cmd.args(leading_args).arg(stage.as_str());
                cmd
            }
            WorkerLauncher::Scripts {
                interpreter,
                scripts_dir,
            } => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(scripts_dir.join(stage.script_name()));
                cmd
            }
        }
    }
}

/// One stage launch request.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub stage: Stage,
    pub args: Vec<String>,
    pub progress: Option<ProgressWindow>,
}

impl StageRequest {
    pub fn new(stage: Stage, args: Vec<String>) -> Self {
        Self {
            stage,
            args,
            progress: None,
        }
    }

    pub fn with_progress(mut self, window: ProgressWindow) -> Self {
        self.progress = Some(window);
        self
    }
}

/// A resolved stage invocation.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub started_at: String,
    pub elapsed: Duration,
    pub payload: StagePayload,
    pub progress: Vec<ProgressSample>,
    pub stderr: String,
}

impl StageReport {
    /// Worker message, falling back to captured stderr, then a generic text.
    pub fn diagnostic(&self) -> String {
        if !self.payload.message.trim().is_empty() {
            self.payload.message.clone()
        } else if !self.stderr.is_empty() {
            self.stderr.clone()
        } else {
            format!("{} worker reported an error", self.stage)
        }
    }
}

#[derive(Debug)]
pub(crate) enum Signal {
    Stdout(Bytes),
    StdoutClosed,
    Stderr(Bytes),
    StderrClosed,
    Exited(Option<i32>),
    SpawnFailed(String),
    TimedOut(Duration),
    Lost,
}

/// Holds the first outcome offered and ignores the rest.
#[derive(Debug)]
pub(crate) struct Resolution<T> {
    outcome: Option<T>,
    settled: bool,
    attempts: usize,
    deliveries: usize,
}

impl<T> Resolution<T> {
    fn new() -> Self {
        Self {
            outcome: None,
            settled: false,
            attempts: 0,
            deliveries: 0,
        }
    }

    /// Returns whether this call won.
    fn resolve(&mut self, value: T) -> bool {
        self.attempts += 1;
        if self.settled {
            return false;
        }
        self.settled = true;
        self.deliveries += 1;
        self.outcome = Some(value);
        true
    }
}

pub(crate) struct Invocation {
    stage: Stage,
    lines: LineBuffer,
    tracker: ProgressTracker,
    progress: Vec<ProgressSample>,
    candidates: Vec<String>,
    stderr: Vec<u8>,
    exit: Option<Option<i32>>,
    stdout_open: bool,
    stderr_open: bool,
    resolution: Resolution<Result<StagePayload>>,
}

impl Invocation {
    pub fn new(stage: Stage, window: Option<ProgressWindow>) -> Self {
        Self {
            stage,
            lines: LineBuffer::default(),
            tracker: ProgressTracker::new(window),
            progress: Vec::new(),
            candidates: Vec::new(),
            stderr: Vec::new(),
            exit: None,
            stdout_open: true,
            stderr_open: true,
            resolution: Resolution::new(),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.resolution.settled
    }

    /// Apply one signal; returns the progress samples it produced.
    pub fn handle(&mut self, signal: Signal) -> Vec<ProgressSample> {
        let mut fresh = Vec::new();
        match signal {
            Signal::Stdout(chunk) => {
                for line in self.lines.push(&chunk) {
                    self.classify(line, &mut fresh);
                }
            }
            Signal::StdoutClosed => {
                if let Some(line) = self.lines.finish() {
                    self.classify(line, &mut fresh);
                }
                self.stdout_open = false;
            }
            Signal::Stderr(chunk) => {
                if !self.is_settled() {
                    self.stderr.extend_from_slice(&chunk);
                }
            }
            Signal::StderrClosed => self.stderr_open = false,
            Signal::Exited(code) => self.exit = Some(code),
            Signal::SpawnFailed(message) => {
                self.resolution
                    .resolve(Err(OrchestratorError::worker(self.stage, message)));
            }
            Signal::TimedOut(after) => {
                self.resolution.resolve(Err(OrchestratorError::worker(
                    self.stage,
                    format!(
                        "{} worker timed out after {}",
                        self.stage,
                        humantime::format_duration(after)
                    ),
                )));
            }
            Signal::Lost => {
                self.resolution.resolve(Err(OrchestratorError::worker(
                    self.stage,
                    format!("lost contact with the {} worker", self.stage),
                )));
            }
        }
        if !self.stdout_open && !self.stderr_open && self.exit.is_some() {
            self.settle();
        }
        fresh
    }

    fn classify(&mut self, line: String, fresh: &mut Vec<ProgressSample>) {
        if self.is_settled() {
            return;
        }
        // A payload line may itself mention a year in its message.
        if parse_payload(&line).is_some() {
            self.candidates.push(line);
        } else if let Some(year) = parse_year_marker(&line) {
            if let Some(sample) = self.tracker.observe(year) {
                self.progress.push(sample);
                fresh.push(sample);
            }
        } else if !line.trim().is_empty() {
            self.candidates.push(line);
        }
    }

    fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    fn settle(&mut self) {
        let outcome = match last_payload(&self.candidates) {
            Some(payload) => {
                if let Some(Some(code)) = self.exit {
                    if code != 0 {
                        warn!(stage = %self.stage, code, "worker exited nonzero but produced a payload");
                    }
                }
                Ok(payload)
            }
            None => {
                let stderr = self.stderr_text();
                if stderr.is_empty() {
                    let how = match self.exit {
                        Some(Some(code)) => format!("with status {code}"),
                        _ => "by signal".to_string(),
                    };
                    Err(OrchestratorError::worker(
                        self.stage,
                        format!("{} worker exited {how} without a result payload", self.stage),
                    ))
                } else {
                    Err(OrchestratorError::worker(self.stage, stderr))
                }
            }
        };
        self.resolution.resolve(outcome);
    }

    fn into_outcome(mut self) -> (Result<StagePayload>, Vec<ProgressSample>, String) {
        let stderr = self.stderr_text();
        let outcome = self.resolution.outcome.take().unwrap_or_else(|| {
            Err(OrchestratorError::worker(
                self.stage,
                "invocation ended without a resolution",
            ))
        });
        (outcome, self.progress, stderr)
    }
}

async fn pump<R>(mut reader: R, tx: mpsc::UnboundedSender<Signal>, data: fn(Bytes) -> Signal, closed: Signal)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(data(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("worker stream read failed: {e}");
                break;
            }
        }
    }
    let _ = tx.send(closed);
}

/// Launches stage workers; at most one invocation is in flight per supervisor.
#[derive(Debug, Clone)]
pub struct Supervisor {
    launcher: WorkerLauncher,
    timeout: Duration,
    gate: Arc<Semaphore>,
}

impl Supervisor {
    pub fn new(launcher: WorkerLauncher, timeout: Duration) -> Self {
        Self {
            launcher,
            timeout,
            gate: Arc::new(Semaphore::new(1)),
        }
    }

    /// Run one stage to resolution, relaying progress on `events`.
    pub async fn run(&self, request: StageRequest, events: &EventSender) -> Result<StageReport> {
        let stage = request.stage;
        let _permit = self
            .gate
            .clone()
            .try_acquire_owned()
            .map_err(|_| OrchestratorError::StageBusy(stage))?;

        let started = Instant::now();
        let started_at = crate::storage::now_rfc3339();
        let mut invocation = Invocation::new(stage, request.progress);
        let (tx, mut rx) = mpsc::unbounded_channel::<Signal>();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let mut cmd = self.launcher.command(stage);
        cmd.args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(%stage, args = ?request.args, "launching worker");

        match cmd.spawn() {
            Err(e) => {
                let _ = tx.send(Signal::SpawnFailed(format!(
                    "failed to launch {stage} worker: {e}"
                )));
            }
            Ok(mut child) => {
                match child.stdout.take() {
                    Some(out) => {
                        tokio::spawn(pump(out, tx.clone(), Signal::Stdout, Signal::StdoutClosed));
                    }
                    None => {
                        let _ = tx.send(Signal::StdoutClosed);
                    }
                }
                match child.stderr.take() {
                    Some(err) => {
                        tokio::spawn(pump(err, tx.clone(), Signal::Stderr, Signal::StderrClosed));
                    }
                    None => {
                        let _ = tx.send(Signal::StderrClosed);
                    }
                }
                let exit_tx = tx.clone();
                tokio::spawn(async move {
                    let waited = tokio::select! {
                        status = child.wait() => Some(status),
                        _ = kill_rx => None,
                    };
                    let code = match waited {
                        Some(status) => status.ok().and_then(|s| s.code()),
                        None => {
                            let _ = child.kill().await;
                            None
                        }
                    };
                    let _ = exit_tx.send(Signal::Exited(code));
                });
            }
        }
        drop(tx);

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut kill_tx = Some(kill_tx);

        while !invocation.is_settled() {
            tokio::select! {
                signal = rx.recv() => {
                    let signal = signal.unwrap_or(Signal::Lost);
                    for sample in invocation.handle(signal) {
                        let _ = events.send(StageEvent::Progress {
                            stage,
                            year: sample.year,
                            percent: sample.percent,
                        });
                    }
                }
                _ = &mut deadline => {
                    invocation.handle(Signal::TimedOut(self.timeout));
                    if let Some(kill) = kill_tx.take() {
                        let _ = kill.send(());
                    }
                }
            }
        }

        let (outcome, progress, stderr) = invocation.into_outcome();
        let elapsed = started.elapsed();
        let payload = outcome?;
        info!(%stage, status = ?payload.status, elapsed_ms = elapsed.as_millis() as u64, "stage resolved");
        Ok(StageReport {
            stage,
            started_at,
            elapsed,
            payload,
            progress,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::payload::PayloadStatus;
    use tokio::sync::broadcast;

    fn text(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn error_stream_and_nonzero_exit_resolve_once() {
        let mut inv = Invocation::new(Stage::Validate, None);
        inv.handle(Signal::Stderr(text("Installation missing net8/ifs.exe\n")));
        inv.handle(Signal::Exited(Some(1)));
        inv.handle(Signal::StdoutClosed);
        assert!(!inv.is_settled());
        inv.handle(Signal::StderrClosed);
        assert!(inv.is_settled());

        // Late and racing signals are no-ops.
        inv.handle(Signal::Exited(Some(1)));
        inv.handle(Signal::Stdout(text("{\"status\": \"success\"}\n")));
        inv.handle(Signal::TimedOut(Duration::from_secs(1)));
        inv.handle(Signal::SpawnFailed("late".into()));

        assert_eq!(inv.resolution.deliveries, 1);
        assert!(inv.resolution.attempts > 1);
        let (outcome, _, _) = inv.into_outcome();
        match outcome {
            Err(OrchestratorError::WorkerFailed { stage, message }) => {
                assert_eq!(stage, Stage::Validate);
                assert_eq!(message, "Installation missing net8/ifs.exe");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn trailing_partial_line_is_parsed_at_close() {
        let mut inv = Invocation::new(Stage::Run, None);
        inv.handle(Signal::Stdout(text("log line\n{\"status\": \"success\", ")));
        inv.handle(Signal::Exited(Some(0)));
        inv.handle(Signal::StderrClosed);
        inv.handle(Signal::Stdout(text("\"message\": \"done\"}")));
        inv.handle(Signal::StdoutClosed);
        let (outcome, _, _) = inv.into_outcome();
        let payload = outcome.unwrap();
        assert_eq!(payload.status, PayloadStatus::Success);
        assert_eq!(payload.message, "done");
    }

    #[test]
    fn payload_wins_over_stderr_noise() {
        let mut inv = Invocation::new(Stage::Extract, None);
        inv.handle(Signal::Stderr(text("DeprecationWarning: something\n")));
        inv.handle(Signal::Stdout(text("{\"status\": \"error\", \"message\": \"no history\"}\n")));
        inv.handle(Signal::StdoutClosed);
        inv.handle(Signal::StderrClosed);
        inv.handle(Signal::Exited(Some(1)));
        let (outcome, _, stderr) = inv.into_outcome();
        let payload = outcome.unwrap();
        assert_eq!(payload.status, PayloadStatus::Error);
        assert_eq!(payload.message, "no history");
        assert_eq!(stderr, "DeprecationWarning: something");
    }

    #[test]
    fn silent_failure_gets_a_generic_message() {
        let mut inv = Invocation::new(Stage::Run, None);
        inv.handle(Signal::StdoutClosed);
        inv.handle(Signal::StderrClosed);
        inv.handle(Signal::Exited(Some(3)));
        let (outcome, _, _) = inv.into_outcome();
        let err = outcome.unwrap_err();
        assert_eq!(
            err.record_message(),
            "run worker exited with status 3 without a result payload"
        );
    }

    #[test]
    fn spawn_failure_resolves_immediately() {
        let mut inv = Invocation::new(Stage::Setup, None);
        inv.handle(Signal::SpawnFailed("failed to launch setup worker: not found".into()));
        assert!(inv.is_settled());
        inv.handle(Signal::Lost);
        assert_eq!(inv.resolution.deliveries, 1);
    }

    #[test]
    fn progress_lines_are_not_payload_candidates() {
        let mut inv = Invocation::new(
            Stage::Run,
            Some(ProgressWindow {
                base_year: 2020,
                end_year: 2030,
            }),
        );
        let samples = inv.handle(Signal::Stdout(text("Year 2021\nYear 2021\nYear 2025\n")));
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].percent, Some(50.0));
        assert!(inv.candidates.is_empty());
    }

    #[test]
    fn payload_mentioning_a_year_is_not_progress() {
        let mut inv = Invocation::new(Stage::Run, None);
        let samples = inv.handle(Signal::Stdout(text(
            "Year 2048\n{\"status\": \"error\", \"message\": \"Progress file reports end Year 2049, expected 2050.\"}\n",
        )));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].year, 2048);
        inv.handle(Signal::Exited(Some(1)));
        inv.handle(Signal::StdoutClosed);
        inv.handle(Signal::StderrClosed);
        let (outcome, progress, _) = inv.into_outcome();
        let payload = outcome.unwrap();
        assert_eq!(payload.status, PayloadStatus::Error);
        assert_eq!(payload.message, "Progress file reports end Year 2049, expected 2050.");
        assert_eq!(progress.len(), 1);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::path::Path;
        use tempfile::TempDir;

        fn launcher(dir: &Path, body: &str) -> WorkerLauncher {
            let script = dir.join("worker.sh");
            std::fs::write(&script, body).unwrap();
            WorkerLauncher::Dispatcher {
                program: PathBuf::from("sh"),
                leading_args: vec![script.to_string_lossy().into_owned()],
            }
        }

        fn events() -> (EventSender, broadcast::Receiver<StageEvent>) {
            broadcast::channel(64)
        }

        #[tokio::test]
        async fn streams_progress_and_returns_the_final_payload() -> anyhow::Result<()> {
            let dir = TempDir::new()?;
            let sup = Supervisor::new(
                launcher(
                    dir.path(),
                    r#"
echo "stage=$1 end=$3"
for y in 2020 2022 2021 2025 2030; do echo "Year $y"; done
printf '{"status": "success", "message": "ok", "data": {"output_file": "model.db"}}'
"#,
                ),
                Duration::from_secs(30),
            );
            let (tx, mut rx) = events();
            let request = StageRequest::new(Stage::Run, vec!["--end-year".into(), "2030".into()])
                .with_progress(ProgressWindow {
                    base_year: 2020,
                    end_year: 2030,
                });
            let report = sup.run(request, &tx).await?;

            assert!(report.payload.is_success());
            assert_eq!(report.payload.str_field("output_file"), Some("model.db"));

            let mut percents = Vec::new();
            while let Ok(ev) = rx.try_recv() {
                if let StageEvent::Progress { percent, .. } = ev {
                    percents.push(percent.unwrap());
                }
            }
            assert_eq!(percents.first().copied(), Some(0.0));
            assert_eq!(percents.last().copied(), Some(100.0));
            assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
            assert_eq!(report.progress.len(), percents.len());
            Ok(())
        }

        #[tokio::test]
        async fn stderr_text_is_surfaced_verbatim() -> anyhow::Result<()> {
            let dir = TempDir::new()?;
            let sup = Supervisor::new(
                launcher(
                    dir.path(),
                    "echo 'Installation missing net8/ifs.exe' >&2\nexit 1\n",
                ),
                Duration::from_secs(30),
            );
            let (tx, _rx) = events();
            let err = sup
                .run(StageRequest::new(Stage::Validate, vec![]), &tx)
                .await
                .unwrap_err();
            match err {
                OrchestratorError::WorkerFailed { message, .. } => {
                    assert_eq!(message, "Installation missing net8/ifs.exe")
                }
                other => panic!("unexpected error: {other}"),
            }
            Ok(())
        }

        #[tokio::test]
        async fn hung_worker_times_out() -> anyhow::Result<()> {
            let dir = TempDir::new()?;
            let sup = Supervisor::new(
                launcher(dir.path(), "sleep 30\n"),
                Duration::from_millis(200),
            );
            let (tx, _rx) = events();
            let started = Instant::now();
            let err = sup
                .run(StageRequest::new(Stage::Run, vec![]), &tx)
                .await
                .unwrap_err();
            assert!(err.to_string().contains("timed out"), "{err}");
            assert!(started.elapsed() < Duration::from_secs(10));
            Ok(())
        }

        #[tokio::test]
        async fn missing_program_is_a_worker_failure() -> anyhow::Result<()> {
            let sup = Supervisor::new(
                WorkerLauncher::Dispatcher {
                    program: PathBuf::from("/nonexistent/simtune-worker"),
                    leading_args: vec![],
                },
                Duration::from_secs(5),
            );
            let (tx, _rx) = events();
            let err = sup
                .run(StageRequest::new(Stage::Setup, vec![]), &tx)
                .await
                .unwrap_err();
            assert!(matches!(err, OrchestratorError::WorkerFailed { stage: Stage::Setup, .. }));
            Ok(())
        }

        #[tokio::test]
        async fn overlapping_launches_are_refused() -> anyhow::Result<()> {
            let dir = TempDir::new()?;
            let sup = Supervisor::new(
                launcher(
                    dir.path(),
                    "sleep 0.3\necho '{\"status\": \"success\", \"message\": \"ok\"}'\n",
                ),
                Duration::from_secs(30),
            );
            let (tx, _rx) = events();
            let (first, second) = tokio::join!(
                sup.run(StageRequest::new(Stage::Run, vec![]), &tx),
                sup.run(StageRequest::new(Stage::Run, vec![]), &tx),
            );
            assert!(first.is_ok());
            assert!(matches!(second, Err(OrchestratorError::StageBusy(Stage::Run))));
            Ok(())
        }
    }
}
