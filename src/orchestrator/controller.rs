//! Job lifecycle controller.
//!
//! Runs one job on a spawned task, relays session events to presentation
//! layers, keeps them informed while a stage is quiet, and abandons the job
//! on Ctrl-C.

use super::active_learning::{optimize, OptimizeReport, OptimizeSettings};
use super::pipeline::{Pipeline, PipelineOutcome};
use super::session::Session;
use super::surrogate::GridSampler;
use crate::canonical::Dictionary;
use crate::model::{
    Configuration, ConfigurationInput, InfoEvent, Stage, StageEvent, ValidatedInstallation,
};
use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::debug;

/// What a configuration-driven job needs beyond the session.
#[derive(Debug, Clone)]
pub(crate) struct RunPlan {
    pub configuration: ConfigurationInput,
    pub end_year: Option<i32>,
    pub dictionary: Option<Dictionary>,
}

#[derive(Debug, Clone)]
pub(crate) enum Job {
    Validate,
    Run(RunPlan),
    Optimize {
        plan: RunPlan,
        settings: OptimizeSettings,
        samples: usize,
        seed: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub(crate) enum JobOutput {
    Validated {
        installation: ValidatedInstallation,
    },
    Run {
        installation: ValidatedInstallation,
        result: PipelineOutcome,
    },
    Optimized {
        installation: ValidatedInstallation,
        report: OptimizeReport,
    },
}

/// Import the dictionary if one was given and resolve the configuration
/// against the validated installation.
async fn prepare(session: &Session, installation: &ValidatedInstallation, plan: RunPlan) -> Result<Configuration> {
    if let Some(dictionary) = plan.dictionary.as_ref() {
        let registered = session
            .registry()
            .register(&installation.root, installation.base_year)
            .await?;
        session
            .registry()
            .import_dictionary(registered.id, dictionary)
            .await
            .context("failed to import dictionary")?;
    }
    plan.configuration
        .resolve(installation.base_year, plan.end_year)
        .context("no end year: pass --end-year or set end_year in the configuration file")
}

async fn execute_job(session: Session, job: Job) -> Result<JobOutput> {
    let mut pipeline = Pipeline::new(&session);
    let installation = pipeline.validate().await?;
    match job {
        Job::Validate => Ok(JobOutput::Validated { installation }),
        Job::Run(plan) => {
            let cfg = prepare(&session, &installation, plan).await?;
            let result = pipeline.submit(&installation, &cfg).await?;
            Ok(JobOutput::Run {
                installation,
                result,
            })
        }
        Job::Optimize {
            plan,
            settings,
            samples,
            seed,
        } => {
            let cfg = prepare(&session, &installation, plan).await?;
            let mut sampler = GridSampler::new(samples, seed);
            let report = optimize(&mut pipeline, &installation, &cfg, &mut sampler, &settings).await?;
            Ok(JobOutput::Optimized {
                installation,
                report,
            })
        }
    }
}

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed.
async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        futures::future::pending::<()>().await;
    }
}

/// Run `job` to completion, forwarding every session event to `event_tx`.
/// A heartbeat is emitted when the active stage has been silent for
/// `heartbeat`.
pub(crate) async fn run_controller(
    session: Session,
    job: Job,
    event_tx: UnboundedSender<StageEvent>,
    heartbeat: Duration,
) -> Result<JobOutput> {
    let mut events = session.subscribe();
    let mut handle = tokio::spawn(execute_job(session.clone(), job));
    let mut active: Option<(Stage, Instant)> = None;
    let mut last_activity = Instant::now();
    let mut watchdog = tokio::time::interval(heartbeat);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let interrupt = interrupted();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            joined = &mut handle => {
                // Flush whatever the job published before it finished.
                while let Ok(ev) = events.try_recv() {
                    let _ = event_tx.send(ev);
                }
                return joined.context("job task failed")?;
            }
            ev = events.recv() => {
                match ev {
                    Ok(ev) => {
                        last_activity = Instant::now();
                        match &ev {
                            StageEvent::StageStarted { stage, .. } => active = Some((*stage, last_activity)),
                            StageEvent::StageFinished { .. } => active = None,
                            _ => {}
                        }
                        let _ = event_tx.send(ev);
                    }
                    Err(RecvError::Lagged(skipped)) => debug!(skipped, "event relay lagged"),
                    // The controller holds a session handle, so the stream cannot close first.
                    Err(RecvError::Closed) => {}
                }
            }
            _ = watchdog.tick() => {
                if let Some((stage, started)) = active {
                    if last_activity.elapsed() >= heartbeat {
                        let _ = event_tx.send(StageEvent::Info(InfoEvent::Heartbeat {
                            stage,
                            elapsed_secs: started.elapsed().as_secs(),
                        }));
                        last_activity = Instant::now();
                    }
                }
            }
            _ = &mut interrupt => {
                handle.abort();
                let _ = event_tx.send(StageEvent::Info(InfoEvent::Interrupted));
                // Dropping the job drops the worker, which is killed; its
                // record stays pending and is re-run next time.
                let _ = (&mut handle).await;
                anyhow::bail!("interrupted");
            }
        }
    }
}
