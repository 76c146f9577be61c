use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::estimate::EstimationMethod;
use crate::identify::IdentifyPolicy;
use crate::refute::PlaceboType;
use crate::CausalError;

/// Run options for one analysis, usually read from a TOML file.
///
/// ```toml
/// method = "backdoor.propensity_score_stratification"
/// identify_policy = "best_effort"
///
/// [estimation]
/// num_strata = 0
/// clipping_threshold = 10
///
/// [refutation]
/// num_simulations = 100
/// subset_fraction = 0.9
/// random_seed = 2026
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisOptions {
    pub method: EstimationMethod,
    pub identify_policy: IdentifyPolicy,
    pub estimation: EstimatorSettings,
    pub refutation: RefuterSettings,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            method: EstimationMethod::PropensityScoreStratification,
            identify_policy: IdentifyPolicy::BestEffort,
            estimation: EstimatorSettings::default(),
            refutation: RefuterSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EstimatorSettings {
    /// Number of propensity strata, `0` picks `clamp(n / 100, 5, 50)`
    pub num_strata: usize,
    /// Strata with fewer treated or control units than this are dropped
    pub clipping_threshold: usize,
    /// Propensity scores are clipped to `[clip, 1 - clip]` for weighting
    pub propensity_clip: f64,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            num_strata: 0,
            clipping_threshold: 10,
            propensity_clip: 0.01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RefuterSettings {
    pub num_simulations: usize,
    /// Share of rows kept by the data subset refuter
    pub subset_fraction: f64,
    pub placebo_type: PlaceboType,
    pub random_seed: u64,
}

impl Default for RefuterSettings {
    fn default() -> Self {
        Self {
            num_simulations: 100,
            subset_fraction: 0.9,
            placebo_type: PlaceboType::Permute,
            random_seed: 0xCA05_A1_2026_u64,
        }
    }
}

impl AnalysisOptions {
    pub fn from_toml_file(path: &Path) -> Result<Self, CausalError> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, CausalError> {
        let options: AnalysisOptions = toml::from_str(raw)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), CausalError> {
        if self.estimation.clipping_threshold == 0 {
            return Err(CausalError::Config(
                "clipping_threshold must be greater than zero".to_string(),
            ));
        }

        if !(0.0..0.5).contains(&self.estimation.propensity_clip) {
            return Err(CausalError::Config(
                "propensity_clip must be in [0, 0.5)".to_string(),
            ));
        }

        if self.refutation.num_simulations == 0 {
            return Err(CausalError::Config(
                "num_simulations must be greater than zero".to_string(),
            ));
        }

        let fraction = self.refutation.subset_fraction;
        if !fraction.is_finite() || fraction <= 0.0 || fraction > 1.0 {
            return Err(CausalError::Config(
                "subset_fraction must be in (0, 1]".to_string(),
            ));
        }

        Ok(())
    }
}
