//! Canonical form and content hashes of a configuration.
//!
//! `configuration_id` identifies the exact values; `dataset_id` identifies only
//! the shape (years plus the set of active names), so samples sharing it are
//! structurally comparable.

use crate::error::{OrchestratorError, Result};
use crate::model::{CoefficientMap, Configuration, RunRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Known parameter, coefficient and output names for one installation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dictionary {
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub coefficients: Vec<CoefficientSpec>,
    /// Empty means any output variable is accepted.
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default)]
    pub default: Option<f64>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientSpec {
    pub function: String,
    pub x: String,
    pub beta: String,
    #[serde(default)]
    pub default: Option<f64>,
    #[serde(default)]
    pub std: Option<f64>,
}

impl Dictionary {
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.coefficients.is_empty()
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn coefficient(&self, function: &str, x: &str, beta: &str) -> Option<&CoefficientSpec> {
        self.coefficients.iter().find(|c| {
            c.function.eq_ignore_ascii_case(function)
                && c.x.eq_ignore_ascii_case(x)
                && c.beta.eq_ignore_ascii_case(beta)
        })
    }

    /// The dictionary's own spelling of an output variable.
    fn output(&self, name: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|o| o.eq_ignore_ascii_case(name))
            .map(String::as_str)
    }
}

/// Configuration reduced to its canonical maps plus both identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalConfiguration {
    pub configuration_id: String,
    pub dataset_id: String,
    pub base_year: i32,
    pub end_year: i32,
    pub input_param: BTreeMap<String, f64>,
    pub input_coef: CoefficientMap,
    pub output_set: BTreeMap<String, String>,
}

impl CanonicalConfiguration {
    /// Canonical form of a stored record. The years are not stored per
    /// record; they are part of its `dataset_id`.
    pub fn from_record(record: RunRecord, base_year: i32, end_year: i32) -> Self {
        Self {
            configuration_id: record.configuration_id,
            dataset_id: record.dataset_id,
            base_year,
            end_year,
            input_param: record.input_param,
            input_coef: record.input_coef,
            output_set: record.output_set,
        }
    }

    pub fn to_configuration(&self) -> Configuration {
        Configuration {
            base_year: self.base_year,
            end_year: self.end_year,
            parameters: self.input_param.clone(),
            coefficients: self.input_coef.clone(),
            outputs: self.output_set.clone(),
        }
    }
}

#[derive(Serialize)]
struct Structure<'a> {
    base_year: i32,
    end_year: i32,
    param_keys: Vec<&'a str>,
    coef_keys: Vec<String>,
    output_keys: Vec<&'a str>,
}

#[derive(Serialize)]
struct Content<'a> {
    dataset_id: &'a str,
    input_param: &'a BTreeMap<String, f64>,
    input_coef: &'a CoefficientMap,
    output_set: &'a BTreeMap<String, String>,
}

/// Build the canonical form of `cfg`, validating it against `dictionary`.
pub fn canonicalize(cfg: &Configuration, dictionary: &Dictionary) -> Result<CanonicalConfiguration> {
    if cfg.end_year < cfg.base_year {
        return Err(OrchestratorError::InvalidConfiguration(format!(
            "end year {} is before base year {}",
            cfg.end_year, cfg.base_year
        )));
    }

    let mut unknown = Vec::new();
    let mut duplicate = Vec::new();
    let mut input_param = BTreeMap::new();
    for (name, value) in &cfg.parameters {
        let key = match dictionary.parameter(name) {
            Some(spec) => spec.name.clone(),
            None => {
                unknown.push(format!("parameter {name}"));
                name.clone()
            }
        };
        let value = canonical_number(name, *value)?;
        if input_param.insert(key, value).is_some() {
            duplicate.push(format!("parameter {name}"));
        }
    }

    let mut input_coef = CoefficientMap::new();
    for (function, x_map) in &cfg.coefficients {
        for (x, beta_map) in x_map {
            for (beta, value) in beta_map {
                let (f, xn, b) = match dictionary.coefficient(function, x, beta) {
                    Some(spec) => (spec.function.clone(), spec.x.clone(), spec.beta.clone()),
                    None => {
                        unknown.push(format!("coefficient {function}.{x}.{beta}"));
                        (function.clone(), x.clone(), beta.clone())
                    }
                };
                let key = format!("{function}.{x}.{beta}");
                let value = canonical_number(&key, *value)?;
                let slot = input_coef.entry(f).or_default().entry(xn).or_default();
                if slot.insert(b, value).is_some() {
                    duplicate.push(format!("coefficient {key}"));
                }
            }
        }
    }

    let mut output_set = BTreeMap::new();
    for (name, series) in &cfg.outputs {
        let key = match dictionary.output(name) {
            Some(known) => known.to_string(),
            None if dictionary.outputs.is_empty() => name.clone(),
            None => {
                unknown.push(format!("output {name}"));
                name.clone()
            }
        };
        if output_set.insert(key, series.clone()).is_some() {
            duplicate.push(format!("output {name}"));
        }
    }

    if !duplicate.is_empty() {
        return Err(OrchestratorError::InvalidConfiguration(format!(
            "names given more than once: {}",
            duplicate.join(", ")
        )));
    }
    if !unknown.is_empty() {
        return Err(OrchestratorError::InvalidConfiguration(format!(
            "unknown names: {}",
            unknown.join(", ")
        )));
    }

    let structure = Structure {
        base_year: cfg.base_year,
        end_year: cfg.end_year,
        param_keys: input_param.keys().map(String::as_str).collect(),
        coef_keys: coefficient_keys(&input_coef),
        output_keys: output_set.keys().map(String::as_str).collect(),
    };
    let dataset_id = stable_hash(&structure)?;
    let configuration_id = stable_hash(&Content {
        dataset_id: &dataset_id,
        input_param: &input_param,
        input_coef: &input_coef,
        output_set: &output_set,
    })?;

    Ok(CanonicalConfiguration {
        configuration_id,
        dataset_id,
        base_year: cfg.base_year,
        end_year: cfg.end_year,
        input_param,
        input_coef,
        output_set,
    })
}

/// Sorted `function.x.beta` keys.
pub fn coefficient_keys(coefficients: &CoefficientMap) -> Vec<String> {
    coefficients
        .iter()
        .flat_map(|(function, x_map)| {
            x_map.iter().flat_map(move |(x, beta_map)| {
                beta_map.keys().map(move |beta| format!("{function}.{x}.{beta}"))
            })
        })
        .collect()
}

/// Rounds to 1e-9 and folds `-0.0` into `0.0` so equal values hash equally.
fn canonical_number(name: &str, value: f64) -> Result<f64> {
    if !value.is_finite() {
        return Err(OrchestratorError::InvalidConfiguration(format!(
            "{name} has a non-finite value"
        )));
    }
    let rounded = if value.abs() < 1e9 {
        (value * 1e9).round() / 1e9
    } else {
        value
    };
    Ok(if rounded == 0.0 { 0.0 } else { rounded })
}

fn stable_hash<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(bytes)))
}
