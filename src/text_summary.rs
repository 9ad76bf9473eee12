//! Text summary builder for CLI output.

use crate::orchestrator::{JobOutput, StoreCounts};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

fn fit(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{v:.6}"),
        _ => "-".to_string(),
    }
}

pub(crate) fn build_text_summary(output: &JobOutput, store: &StoreCounts) -> TextSummary {
    let mut lines = Vec::new();

    let installation = match output {
        JobOutput::Validated { installation }
        | JobOutput::Run { installation, .. }
        | JobOutput::Optimized { installation, .. } => installation,
    };
    lines.push(format!(
        "Installation: {} (base year {})",
        installation.root.display(),
        installation.base_year
    ));
    if !installation.requirements.is_empty() {
        let present = installation.requirements.iter().filter(|r| r.exists).count();
        lines.push(format!(
            "Requirements: {present}/{} present",
            installation.requirements.len()
        ));
    }

    match output {
        JobOutput::Validated { .. } => {}
        JobOutput::Run { result, .. } => {
            let record = result.record();
            let how = if result.is_reused() { "reused from cache" } else { "evaluated" };
            lines.push(format!("Configuration: {} ({how})", short(&record.configuration_id)));
            lines.push(format!("Pooled fit: {}", fit(record.fit_pooled)));
            for (var, value) in &record.fit_var {
                lines.push(format!("  {var}: {}", fit(Some(*value))));
            }
            if let Some(artifact) = record.artifacts.first() {
                lines.push(format!("Output: {artifact}"));
            }
        }
        JobOutput::Optimized { report, .. } => {
            let best = &report.best;
            lines.push(format!(
                "Best configuration: {} fit {}",
                short(&best.configuration_id),
                fit(Some(best.fit_pooled))
            ));
            lines.push(format!(
                "Iterations: {} ({} runs, {} cache hits, {} failed), stopped: {:?}",
                best.iterations, best.external_runs, best.cache_hits, best.failures, report.stop
            ));
            lines.push(format!(
                "Comparable samples: {} in {}",
                report.samples,
                humantime::format_duration(report.elapsed)
            ));
        }
    }

    lines.push(format!(
        "Store: {} evaluated, {} error, {} pending, {} completed",
        store.evaluated, store.error, store.pending, store.completed
    ));
    TextSummary { lines }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BestSoFar, ValidatedInstallation};
    use crate::orchestrator::{OptimizeReport, StopReason};
    use std::path::PathBuf;

    #[test]
    fn optimization_summary_mentions_counters() {
        let output = JobOutput::Optimized {
            installation: ValidatedInstallation {
                root: PathBuf::from("/opt/ifs"),
                base_year: 2019,
                requirements: vec![],
            },
            report: OptimizeReport {
                best: BestSoFar {
                    configuration_id: "0123456789abcdef".into(),
                    fit_pooled: 0.25,
                    iterations: 5,
                    external_runs: 1,
                    cache_hits: 4,
                    failures: 0,
                },
                stop: StopReason::MaxIterations,
                dataset_id: "d".into(),
                samples: 2,
                elapsed: std::time::Duration::from_secs(90),
            },
        };
        let summary = build_text_summary(&output, &StoreCounts::default());
        assert_eq!(summary.lines[0], "Installation: /opt/ifs (base year 2019)");
        assert_eq!(summary.lines[1], "Best configuration: 0123456789ab fit 0.250000");
        assert!(summary.lines[2].contains("1 runs, 4 cache hits"));
        assert_eq!(summary.lines[3], "Comparable samples: 2 in 1m 30s");
    }
}
