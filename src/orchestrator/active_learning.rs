//! Active-learning loop: propose, reuse or evaluate, track the best fit.

use super::pipeline::Pipeline;
use super::surrogate::{Observation, SearchSpace, Surrogate};
use crate::canonical::{canonicalize, CanonicalConfiguration};
use crate::error::{OrchestratorError, Result};
use crate::model::{BestSoFar, Configuration, StageEvent, ValidatedInstallation};
use serde::Serialize;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct OptimizeSettings {
    pub max_iterations: usize,
    /// Relative change of the best fit treated as "no progress".
    pub convergence_threshold: f64,
    /// Consecutive no-progress iterations before stopping; 0 disables.
    pub patience: usize,
}

impl Default for OptimizeSettings {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            convergence_threshold: 1e-4,
            patience: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxIterations,
    Converged,
    Exhausted,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizeReport {
    pub best: BestSoFar,
    pub stop: StopReason,
    pub dataset_id: String,
    /// Evaluated samples available to the surrogate at the end.
    pub samples: usize,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

/// Tracks consecutive iterations without meaningful improvement.
#[derive(Debug)]
struct Convergence {
    threshold: f64,
    patience: usize,
    previous: f64,
    stale: usize,
}

impl Convergence {
    fn new(threshold: f64, patience: usize, initial: f64) -> Self {
        Self {
            threshold,
            patience,
            previous: initial,
            stale: 0,
        }
    }

    /// Feed the current best; returns true once patience is exhausted.
    fn observe(&mut self, best: f64) -> bool {
        let change = (best - self.previous).abs() / (self.previous.abs() + 1e-8);
        if change < self.threshold {
            self.stale += 1;
        } else {
            self.stale = 0;
        }
        self.previous = best;
        self.patience > 0 && self.stale >= self.patience
    }
}

/// A failed candidate is scored worse than anything finite and the loop
/// moves on; infrastructure errors abort.
fn is_candidate_failure(err: &OrchestratorError) -> bool {
    matches!(
        err,
        OrchestratorError::WorkerFailed { .. }
            | OrchestratorError::InvalidConfiguration(_)
            | OrchestratorError::InstallationInvalid { .. }
    )
}

pub async fn optimize(
    pipeline: &mut Pipeline<'_>,
    installation: &ValidatedInstallation,
    initial: &Configuration,
    surrogate: &mut dyn Surrogate,
    settings: &OptimizeSettings,
) -> Result<OptimizeReport> {
    let session = pipeline.session();
    let started = Instant::now();

    let seed = pipeline.submit(installation, initial).await?.into_record();
    let seed_fit = seed.fit_pooled.unwrap_or(f64::INFINITY);
    let mut best = BestSoFar::seeded(seed.configuration_id.clone(), seed_fit);
    info!(configuration_id = %seed.configuration_id, fit_pooled = seed_fit, "optimization seeded");

    let dictionary = session.registry().dictionary(seed.installation_id).await?;
    let (base_year, end_year) = (initial.base_year, initial.end_year);
    let dataset_id = seed.dataset_id.clone();
    // The stored spelling of the seed keeps proposals comparable with history.
    let template = CanonicalConfiguration::from_record(seed, base_year, end_year).to_configuration();
    let space = SearchSpace::new(&template, &dictionary);

    let mut seen = HashSet::new();
    let mut history = Vec::new();
    for record in session.cache().evaluated_samples(&dataset_id).await? {
        let Some(fit) = record.fit_pooled else { continue };
        seen.insert(record.configuration_id.clone());
        history.push(Observation {
            configuration: CanonicalConfiguration::from_record(record, base_year, end_year)
                .to_configuration(),
            fit_pooled: fit,
        });
    }
    info!(samples = history.len(), dataset_id = %dataset_id, "loaded compatible samples");

    let mut convergence = Convergence::new(settings.convergence_threshold, settings.patience, best.fit_pooled);
    let mut stop = StopReason::MaxIterations;

    for iteration in 1..=settings.max_iterations {
        let Some(candidate) = surrogate.propose(&space, &history).await? else {
            info!(iteration, "surrogate has no further candidates");
            stop = StopReason::Exhausted;
            break;
        };

        let (configuration_id, fit, reused) = match pipeline.submit(installation, &candidate).await {
            Ok(outcome) => {
                let reused = outcome.is_reused();
                if reused {
                    best.cache_hits += 1;
                } else {
                    best.external_runs += 1;
                }
                let record = outcome.into_record();
                let fit = record.fit_pooled.unwrap_or(f64::INFINITY);
                if seen.insert(record.configuration_id.clone()) {
                    history.push(Observation {
                        configuration: candidate,
                        fit_pooled: fit,
                    });
                }
                (record.configuration_id, fit, reused)
            }
            Err(err) if is_candidate_failure(&err) => {
                let configuration_id = canonicalize(&candidate, &dictionary)
                    .map(|c| c.configuration_id)
                    .unwrap_or_default();
                warn!(iteration, configuration_id = %configuration_id, "candidate failed: {err}");
                best.failures += 1;
                history.push(Observation {
                    configuration: candidate,
                    fit_pooled: f64::INFINITY,
                });
                (configuration_id, f64::INFINITY, false)
            }
            Err(err) => return Err(err),
        };

        best.iterations = iteration;
        if best.offer(&configuration_id, fit) {
            info!(iteration, configuration_id = %configuration_id, fit_pooled = fit, "new best configuration");
        }
        session.emit(StageEvent::Iteration {
            iteration,
            configuration_id,
            fit_pooled: fit,
            reused,
            best_fit: best.fit_pooled,
        });

        if convergence.observe(best.fit_pooled) {
            info!(iteration, "best fit stopped improving");
            stop = StopReason::Converged;
            break;
        }
    }

    info!(
        best = %best.configuration_id,
        fit_pooled = best.fit_pooled,
        iterations = best.iterations,
        external_runs = best.external_runs,
        cache_hits = best.cache_hits,
        failures = best.failures,
        ?stop,
        "optimization finished"
    );
    Ok(OptimizeReport {
        best,
        stop,
        dataset_id,
        samples: history.len(),
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[test]
    fn convergence_needs_consecutive_stale_iterations() {
        let mut c = Convergence::new(1e-3, 3, 10.0);
        assert!(!c.observe(10.0));
        assert!(!c.observe(10.0));
        assert!(!c.observe(5.0)); // improvement resets
        assert!(!c.observe(5.0));
        assert!(!c.observe(5.0));
        assert!(c.observe(5.0));
    }

    #[test]
    fn zero_patience_never_converges() {
        let mut c = Convergence::new(1.0, 0, 1.0);
        for _ in 0..10 {
            assert!(!c.observe(1.0));
        }
    }

    /// Proposes the same configuration forever.
    struct Repeat(Configuration);

    #[async_trait]
    impl Surrogate for Repeat {
        async fn propose(&mut self, _: &SearchSpace, _: &[Observation]) -> Result<Option<Configuration>> {
            Ok(Some(self.0.clone()))
        }
    }

    #[cfg(unix)]
    mod flow {
        use super::*;
        use crate::orchestrator::surrogate::GridSampler;
        use crate::model::RunStatus;
        use crate::orchestrator::testing::Fixture;

        #[tokio::test]
        async fn repeated_candidate_runs_once_then_hits_cache() -> anyhow::Result<()> {
            let fx = Fixture::new().await?;
            let mut pipeline = Pipeline::new(&fx.session);
            let installation = pipeline.validate().await?;

            let initial = fx.configuration(1.0);
            pipeline.submit(&installation, &initial).await?;
            assert_eq!(fx.invocations("run"), 1);

            let mut events = fx.session.subscribe();
            let mut surrogate = Repeat(fx.configuration(1.5));
            let settings = OptimizeSettings {
                max_iterations: 5,
                convergence_threshold: 1e-4,
                patience: 0,
            };
            let report = optimize(&mut pipeline, &installation, &initial, &mut surrogate, &settings).await?;

            assert_eq!(report.best.external_runs, 1);
            assert_eq!(report.best.cache_hits, 4);
            assert_eq!(report.best.iterations, 5);
            assert_eq!(report.stop, StopReason::MaxIterations);
            assert_eq!(fx.invocations("run"), 2);

            let mut best_after = Vec::new();
            while let Ok(ev) = events.try_recv() {
                if let StageEvent::Iteration { best_fit, reused, iteration, .. } = ev {
                    assert_eq!(reused, iteration > 1);
                    best_after.push(best_fit);
                }
            }
            assert_eq!(best_after, vec![0.5; 5]);
            assert_eq!(report.best.fit_pooled, 0.5);
            Ok(())
        }

        #[tokio::test]
        async fn failures_do_not_stop_the_loop() -> anyhow::Result<()> {
            let fx = Fixture::new().await?;
            let mut pipeline = Pipeline::new(&fx.session);
            let installation = pipeline.validate().await?;
            let initial = fx.configuration(1.0);
            pipeline.submit(&installation, &initial).await?;

            fx.fail_stage("run", true);
            let settings = OptimizeSettings {
                max_iterations: 3,
                convergence_threshold: 1e-4,
                patience: 0,
            };
            let mut events = fx.session.subscribe();
            let mut sampler = GridSampler::new(10, 3);
            let report = optimize(&mut pipeline, &installation, &initial, &mut sampler, &settings).await?;

            let mut failed_ids = Vec::new();
            while let Ok(ev) = events.try_recv() {
                if let StageEvent::Iteration { configuration_id, fit_pooled, .. } = ev {
                    assert!(fit_pooled.is_infinite());
                    failed_ids.push(configuration_id);
                }
            }
            assert_eq!(failed_ids.len(), 3);
            for id in &failed_ids {
                let record = fx.session.cache().lookup(id).await?;
                let record = record.unwrap_or_else(|| panic!("no record for {id:?}"));
                assert_eq!(record.status, RunStatus::Error);
                assert_eq!(record.message.as_deref(), Some("run exploded"));
            }

            assert_eq!(report.best.failures, 3);
            assert_eq!(report.best.iterations, 3);
            assert_eq!(report.best.fit_pooled, 1.0);
            assert_eq!(report.samples, 4);
            Ok(())
        }

        #[tokio::test]
        async fn stalled_search_converges_early() -> anyhow::Result<()> {
            let fx = Fixture::new().await?;
            let mut pipeline = Pipeline::new(&fx.session);
            let installation = pipeline.validate().await?;
            let initial = fx.configuration(1.0);

            let settings = OptimizeSettings {
                max_iterations: 20,
                convergence_threshold: 1e-4,
                patience: 2,
            };
            let mut sampler = GridSampler::new(50, 11);
            let report = optimize(&mut pipeline, &installation, &initial, &mut sampler, &settings).await?;

            // 1.0 -> 0.5 improves, then two iterations at 0.5 exhaust patience.
            assert_eq!(report.stop, StopReason::Converged);
            assert_eq!(report.best.iterations, 3);
            assert_eq!(report.best.fit_pooled, 0.5);
            assert_eq!(fx.invocations("run"), 4);
            Ok(())
        }
    }
}
