//! Candidate proposal seam for the active-learning loop.
//!
//! The loop only needs "given what has been evaluated, what next?"; any
//! model can sit behind [`Surrogate`]. [`GridSampler`] is the built-in
//! fallback that walks a seeded random design.

use crate::canonical::{CoefficientSpec, Dictionary, ParameterSpec};
use crate::error::Result;
use crate::model::Configuration;
use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;

/// An evaluated configuration. Failed candidates carry `f64::INFINITY`.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub configuration: Configuration,
    pub fit_pooled: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Dimension {
    Parameter(String),
    Coefficient {
        function: String,
        x: String,
        beta: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bound {
    pub dimension: Dimension,
    pub low: f64,
    pub high: f64,
}

/// Box over the names active in a template configuration. Every point maps
/// back to a configuration with the template's structure, so candidates
/// share its `dataset_id`.
#[derive(Debug, Clone)]
pub struct SearchSpace {
    template: Configuration,
    bounds: Vec<Bound>,
}

impl SearchSpace {
    pub fn new(template: &Configuration, dictionary: &Dictionary) -> Self {
        let mut bounds = Vec::new();
        for (name, value) in &template.parameters {
            let (low, high) = parameter_range(dictionary.parameter(name), *value);
            bounds.push(Bound {
                dimension: Dimension::Parameter(name.clone()),
                low,
                high,
            });
        }
        for (function, x_map) in &template.coefficients {
            for (x, beta_map) in x_map {
                for (beta, value) in beta_map {
                    let (low, high) =
                        coefficient_range(dictionary.coefficient(function, x, beta), *value);
                    bounds.push(Bound {
                        dimension: Dimension::Coefficient {
                            function: function.clone(),
                            x: x.clone(),
                            beta: beta.clone(),
                        },
                        low,
                        high,
                    });
                }
            }
        }
        Self {
            template: template.clone(),
            bounds,
        }
    }

    pub fn bounds(&self) -> &[Bound] {
        &self.bounds
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    pub fn configuration_at(&self, point: &[f64]) -> Configuration {
        let mut cfg = self.template.clone();
        for (bound, value) in self.bounds.iter().zip(point) {
            match &bound.dimension {
                Dimension::Parameter(name) => {
                    cfg.parameters.insert(name.clone(), *value);
                }
                Dimension::Coefficient { function, x, beta } => {
                    cfg.coefficients
                        .entry(function.clone())
                        .or_default()
                        .entry(x.clone())
                        .or_default()
                        .insert(beta.clone(), *value);
                }
            }
        }
        cfg
    }

    /// Coordinates of `cfg`, or `None` if it lacks one of the dimensions.
    pub fn point_of(&self, cfg: &Configuration) -> Option<Vec<f64>> {
        self.bounds
            .iter()
            .map(|bound| match &bound.dimension {
                Dimension::Parameter(name) => cfg.parameters.get(name).copied(),
                Dimension::Coefficient { function, x, beta } => cfg
                    .coefficients
                    .get(function)
                    .and_then(|m| m.get(x))
                    .and_then(|m| m.get(beta))
                    .copied(),
            })
            .collect()
    }
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn around(center: f64) -> (f64, f64) {
    if center.is_finite() && center != 0.0 {
        (center - center.abs(), center + center.abs())
    } else {
        (-1.0, 1.0)
    }
}

/// Stored bounds win one side at a time; a missing side falls back to
/// `center ± |center|` around the stored default, else the template value.
fn parameter_range(spec: Option<&ParameterSpec>, value: f64) -> (f64, f64) {
    let finite = |v: Option<f64>| v.filter(|v| v.is_finite());
    let center = finite(spec.and_then(|s| s.default)).unwrap_or(value);
    let (fallback_low, fallback_high) = around(center);
    let low = finite(spec.and_then(|s| s.min)).unwrap_or(fallback_low);
    let high = finite(spec.and_then(|s| s.max)).unwrap_or(fallback_high);
    ordered(low, high)
}

fn coefficient_range(spec: Option<&CoefficientSpec>, value: f64) -> (f64, f64) {
    let stored_default = spec.and_then(|s| s.default).filter(|c| c.is_finite());
    let center = stored_default.unwrap_or(value);
    let (mut low, mut high) = match spec.and_then(|s| s.std) {
        Some(std) if std.is_finite() && std != 0.0 => {
            (center - 3.0 * std.abs(), center + 3.0 * std.abs())
        }
        _ => around(center),
    };
    // Keep the sign of an estimated coefficient.
    match stored_default {
        Some(c) if c > 0.0 => low = low.max(0.0),
        Some(c) if c < 0.0 => high = high.min(0.0),
        _ => {}
    }
    (low, high)
}

#[async_trait]
pub trait Surrogate: Send {
    /// Next candidate given every observation so far; `None` when there is
    /// nothing left worth trying.
    async fn propose(
        &mut self,
        space: &SearchSpace,
        history: &[Observation],
    ) -> Result<Option<Configuration>>;
}

/// Proposes points of a seeded uniform design in order, skipping any point
/// already observed.
pub struct GridSampler {
    samples: usize,
    rng: StdRng,
    grid: Option<Vec<Vec<f64>>>,
    cursor: usize,
}

impl GridSampler {
    pub fn new(samples: usize, seed: u64) -> Self {
        Self {
            samples,
            rng: StdRng::seed_from_u64(seed),
            grid: None,
            cursor: 0,
        }
    }
}

fn sample_grid(rng: &mut StdRng, space: &SearchSpace, samples: usize) -> Vec<Vec<f64>> {
    (0..samples)
        .map(|_| {
            space
                .bounds()
                .iter()
                .map(|b| {
                    if b.low < b.high {
                        rng.gen_range(b.low..=b.high)
                    } else {
                        b.low
                    }
                })
                .collect()
        })
        .collect()
}

fn same_point(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(x, y)| (x - y).abs() <= 1e-9 * x.abs().max(y.abs()).max(1.0))
}

#[async_trait]
impl Surrogate for GridSampler {
    async fn propose(
        &mut self,
        space: &SearchSpace,
        history: &[Observation],
    ) -> Result<Option<Configuration>> {
        if space.is_empty() {
            return Ok(None);
        }
        if self.grid.is_none() {
            self.grid = Some(sample_grid(&mut self.rng, space, self.samples));
        }
        let Some(grid) = self.grid.as_ref() else {
            return Ok(None);
        };
        let observed: Vec<Vec<f64>> = history
            .iter()
            .filter_map(|o| space.point_of(&o.configuration))
            .collect();
        while self.cursor < grid.len() {
            let point = &grid[self.cursor];
            self.cursor += 1;
            if !observed.iter().any(|o| same_point(o, point)) {
                return Ok(Some(space.configuration_at(point)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::canonicalize;

    fn dictionary() -> Dictionary {
        serde_json::from_str(
            r#"{
                "parameters": [
                    {"name": "tfrmin", "default": 1.0, "min": 0.5, "max": 2.0},
                    {"name": "labshr", "default": 0.4},
                    {"name": "zeroed", "default": 0.0}
                ],
                "coefficients": [
                    {"function": "GDPfn", "x": "Capital", "beta": "b1", "default": 0.1, "std": 0.05},
                    {"function": "GDPfn", "x": "Labor", "beta": "b2", "default": -0.2},
                    {"function": "GDPfn", "x": "Tech", "beta": "b3"}
                ]
            }"#,
        )
        .unwrap()
    }

    fn template() -> Configuration {
        serde_json::from_str(
            r#"{
                "base_year": 2019,
                "end_year": 2030,
                "parameters": {"tfrmin": 1.0, "labshr": 0.4, "zeroed": 0.0},
                "coefficients": {"GDPfn": {"Capital": {"b1": 0.1}, "Labor": {"b2": -0.2}, "Tech": {"b3": 0.0}}},
                "outputs": {"POP": "SeriesPopulation"}
            }"#,
        )
        .unwrap()
    }

    fn range_of(space: &SearchSpace, dim: &Dimension) -> (f64, f64) {
        let b = space.bounds().iter().find(|b| &b.dimension == dim).unwrap();
        (b.low, b.high)
    }

    #[test]
    fn ranges_follow_dictionary_with_fallbacks() {
        let space = SearchSpace::new(&template(), &dictionary());
        assert_eq!(range_of(&space, &Dimension::Parameter("tfrmin".into())), (0.5, 2.0));
        assert_eq!(range_of(&space, &Dimension::Parameter("labshr".into())), (0.0, 0.8));
        assert_eq!(range_of(&space, &Dimension::Parameter("zeroed".into())), (-1.0, 1.0));

        let coef = |x: &str, beta: &str| Dimension::Coefficient {
            function: "GDPfn".into(),
            x: x.into(),
            beta: beta.into(),
        };
        // 0.1 +- 0.15, clipped at zero to stay positive.
        let (low, high) = range_of(&space, &coef("Capital", "b1"));
        assert_eq!(low, 0.0);
        assert!((high - 0.25).abs() < 1e-12);
        // -0.2 +- 0.2, clipped at zero to stay negative.
        assert_eq!(range_of(&space, &coef("Labor", "b2")), (-0.4, 0.0));
        assert_eq!(range_of(&space, &coef("Tech", "b3")), (-1.0, 1.0));
    }

    #[test]
    fn missing_defaults_center_on_the_template() {
        let dict: Dictionary = serde_json::from_str(
            r#"{
                "parameters": [{"name": "tfrmin"}, {"name": "labshr", "min": 0.1}],
                "coefficients": [{"function": "GDPfn", "x": "Capital", "beta": "b1", "std": 0.25}]
            }"#,
        )
        .unwrap();
        let cfg: Configuration = serde_json::from_str(
            r#"{
                "base_year": 2019,
                "end_year": 2030,
                "parameters": {"tfrmin": 1.2, "labshr": 0.5},
                "coefficients": {"GDPfn": {"Capital": {"b1": 0.5}}}
            }"#,
        )
        .unwrap();
        let space = SearchSpace::new(&cfg, &dict);
        assert_eq!(range_of(&space, &Dimension::Parameter("tfrmin".into())), (0.0, 2.4));
        // Stored lower bound, fallback upper bound.
        assert_eq!(range_of(&space, &Dimension::Parameter("labshr".into())), (0.1, 1.0));
        // No stored default, so no sign clipping.
        let coef = Dimension::Coefficient {
            function: "GDPfn".into(),
            x: "Capital".into(),
            beta: "b1".into(),
        };
        assert_eq!(range_of(&space, &coef), (-0.25, 1.25));
    }

    #[test]
    fn points_keep_the_dataset_shape() {
        let dict = dictionary();
        let space = SearchSpace::new(&template(), &dict);
        let point: Vec<f64> = space.bounds().iter().map(|b| (b.low + b.high) / 2.0).collect();
        let cfg = space.configuration_at(&point);
        assert_eq!(space.point_of(&cfg), Some(point));

        let a = canonicalize(&template(), &dict).unwrap();
        let b = canonicalize(&cfg, &dict).unwrap();
        assert_eq!(a.dataset_id, b.dataset_id);
        assert_ne!(a.configuration_id, b.configuration_id);
    }

    #[tokio::test]
    async fn sampler_is_seeded_and_stays_in_bounds() -> anyhow::Result<()> {
        let space = SearchSpace::new(&template(), &dictionary());
        let mut a = GridSampler::new(5, 42);
        let mut b = GridSampler::new(5, 42);
        for _ in 0..5 {
            let pa = a.propose(&space, &[]).await?.unwrap();
            let pb = b.propose(&space, &[]).await?.unwrap();
            assert_eq!(pa, pb);
            let point = space.point_of(&pa).unwrap();
            for (v, bound) in point.iter().zip(space.bounds()) {
                assert!(*v >= bound.low && *v <= bound.high);
            }
        }
        assert!(a.propose(&space, &[]).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn sampler_skips_observed_points() -> anyhow::Result<()> {
        let space = SearchSpace::new(&template(), &dictionary());
        let mut probe = GridSampler::new(3, 7);
        let first = probe.propose(&space, &[]).await?.unwrap();
        let second = probe.propose(&space, &[]).await?.unwrap();

        let mut sampler = GridSampler::new(3, 7);
        let history = vec![Observation {
            configuration: first,
            fit_pooled: 1.0,
        }];
        assert_eq!(sampler.propose(&space, &history).await?, Some(second));
        Ok(())
    }

    #[tokio::test]
    async fn empty_space_proposes_nothing() -> anyhow::Result<()> {
        let mut cfg = template();
        cfg.parameters.clear();
        cfg.coefficients.clear();
        let space = SearchSpace::new(&cfg, &dictionary());
        assert!(GridSampler::new(10, 0).propose(&space, &[]).await?.is_none());
        Ok(())
    }
}
