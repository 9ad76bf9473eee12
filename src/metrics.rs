use std::collections::BTreeMap;

/// (simulated, historical) pairs joined per output variable.
pub type SeriesPairs = BTreeMap<String, Vec<(f64, f64)>>;

/// Per-variable and pooled fit error of one evaluated run.
#[derive(Debug, Clone, PartialEq)]
pub struct FitSummary {
    pub fit_var: BTreeMap<String, f64>,
    pub fit_pooled: f64,
}

/// Mean squared error over pairs where both values are finite.
pub fn mean_squared_error(pairs: &[(f64, f64)]) -> Option<f64> {
    let (sum, n) = pairs
        .iter()
        .filter(|(sim, hist)| sim.is_finite() && hist.is_finite())
        .fold((0.0, 0usize), |(sum, n), (sim, hist)| {
            (sum + (sim - hist).powi(2), n + 1)
        });
    (n > 0).then(|| sum / n as f64)
}

/// Compute fit from joined series. Variables without usable pairs are
/// left out; `None` when nothing could be compared.
pub fn fit_from_series(series: &SeriesPairs) -> Option<FitSummary> {
    let fit_var: BTreeMap<String, f64> = series
        .iter()
        .filter_map(|(var, pairs)| mean_squared_error(pairs).map(|mse| (var.clone(), mse)))
        .collect();
    let all: Vec<(f64, f64)> = series.values().flatten().copied().collect();
    let fit_pooled = mean_squared_error(&all)?;
    Some(FitSummary {
        fit_var,
        fit_pooled,
    })
}

/// Mean of the finite per-variable errors.
pub fn pooled_from_variables(fit_var: &BTreeMap<String, f64>) -> Option<f64> {
    let finite: Vec<f64> = fit_var.values().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    Some(finite.iter().sum::<f64>() / finite.len() as f64)
}
