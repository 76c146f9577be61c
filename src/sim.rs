//! Synthetic confounded data
//!
//! Generates datasets with a known treatment effect so estimators and
//! refuters can be checked against ground truth.

use std::path::Path;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Bernoulli, Distribution, Normal};
use serde::Serialize;

use crate::dataset::{Column, Dataset};
use crate::CausalError;

/// Graph matching the data generated by [`generate`].
pub const SIM_GRAPH: &str =
    "digraph { X -> Y; Z1 -> X; Z1 -> Y; Z2 -> X; Z2 -> Y; W -> Y; V -> X; }";

/// Simulation configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub n_rows: usize,
    /// Effect of `X` on `Y` at `W = 0`
    pub effect: f64,
    /// How much the effect grows per unit of the modifier `W`
    pub modifier_slope: f64,
    /// Scales the influence of `Z1` and `Z2` on both `X` and `Y`
    pub confounding: f64,
    pub noise_std: f64,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            n_rows: 2000,
            effect: 2.0,
            modifier_slope: 0.0,
            confounding: 1.0,
            noise_std: 1.0,
            seed: 42,
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), CausalError> {
        if self.n_rows == 0 {
            return Err(CausalError::Config("n_rows must be > 0".to_string()));
        }
        if !self.noise_std.is_finite() || self.noise_std < 0.0 {
            return Err(CausalError::Config(format!(
                "noise_std must be finite and >= 0, got {}",
                self.noise_std
            )));
        }
        let coefficients = [
            ("effect", self.effect),
            ("modifier_slope", self.modifier_slope),
            ("confounding", self.confounding),
        ];
        if let Some((name, value)) = coefficients.iter().find(|(_, v)| !v.is_finite()) {
            return Err(CausalError::Config(format!("{name} must be finite, got {value}")));
        }
        Ok(())
    }
}

/// One generated unit
#[derive(Debug, Clone, Serialize)]
pub struct SimRow {
    #[serde(rename = "X")]
    pub x: u8,
    #[serde(rename = "Y")]
    pub y: f64,
    #[serde(rename = "Z1")]
    pub z1: f64,
    #[serde(rename = "Z2")]
    pub z2: f64,
    #[serde(rename = "W")]
    pub w: f64,
    #[serde(rename = "V")]
    pub v: f64,
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Draw `config.n_rows` units.
///
/// `Z1`, `Z2`, `W`, `V` are standard normal. `X` is Bernoulli with
/// `logit = confounding * (0.8 Z1 - 0.5 Z2) + 0.7 V` and
/// `Y = (effect + modifier_slope * W) X + confounding * (1.5 Z1 - Z2) + 0.5 W + noise`.
pub fn generate(config: &SimConfig) -> Result<Vec<SimRow>, CausalError> {
    config.validate()?;
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let standard = Normal::new(0.0, 1.0)
        .map_err(|e| CausalError::Config(format!("normal distribution: {e}")))?;
    let noise = Normal::new(0.0, config.noise_std)
        .map_err(|e| CausalError::Config(format!("noise_std {}: {e}", config.noise_std)))?;

    let mut rows = Vec::with_capacity(config.n_rows);
    for _ in 0..config.n_rows {
        let z1 = standard.sample(&mut rng);
        let z2 = standard.sample(&mut rng);
        let w = standard.sample(&mut rng);
        let v = standard.sample(&mut rng);

        let p = sigmoid(config.confounding * (0.8 * z1 - 0.5 * z2) + 0.7 * v);
        let treated = Bernoulli::new(p)
            .map_err(|e| CausalError::Config(format!("propensity {p}: {e}")))?
            .sample(&mut rng);
        let x = if treated { 1.0 } else { 0.0 };

        let y = (config.effect + config.modifier_slope * w) * x
            + config.confounding * (1.5 * z1 - z2)
            + 0.5 * w
            + noise.sample(&mut rng);

        rows.push(SimRow {
            x: u8::from(treated),
            y,
            z1,
            z2,
            w,
            v,
        });
    }
    Ok(rows)
}

/// Generate rows and load them as a [`Dataset`].
pub fn generate_dataset(config: &SimConfig) -> Result<Dataset, CausalError> {
    let rows = generate(config)?;
    let pick = |f: fn(&SimRow) -> f64| rows.iter().map(f).collect::<Vec<f64>>();
    Dataset::from_columns(vec![
        Column::numeric("X", pick(|r| f64::from(r.x))),
        Column::numeric("Y", pick(|r| r.y)),
        Column::numeric("Z1", pick(|r| r.z1)),
        Column::numeric("Z2", pick(|r| r.z2)),
        Column::numeric("W", pick(|r| r.w)),
        Column::numeric("V", pick(|r| r.v)),
    ])
}

/// Write generated rows as CSV with a header line.
pub fn write_csv(rows: &[SimRow], path: &Path) -> Result<(), CausalError> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Mean of `Y` among treated minus mean among controls, with no adjustment
pub fn naive_difference(rows: &[SimRow]) -> f64 {
    let (mut sum_t, mut n_t, mut sum_c, mut n_c) = (0.0, 0usize, 0.0, 0usize);
    for row in rows {
        if row.x == 1 {
            sum_t += row.y;
            n_t += 1;
        } else {
            sum_c += row.y;
            n_c += 1;
        }
    }
    sum_t / n_t.max(1) as f64 - sum_c / n_c.max(1) as f64
}
