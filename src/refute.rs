//! Refuters
//!
//! Each refuter perturbs the data or the estimand, re-runs the same estimator
//! for the same target population many times, and compares the mean new
//! effect to the original estimate.

use std::fmt;

use log::debug;
use rand::seq::{index, SliceRandom};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::config::RefuterSettings;
use crate::dataset::ProjectedData;
use crate::estimate::{CausalEstimate, EffectEstimator};
use crate::identify::IdentifiedEstimand;
use crate::report::format_sig3;
use crate::worker::CancellationToken;
use crate::CausalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RefuterKind {
    #[serde(rename = "random_common_cause")]
    RandomCommonCause,
    #[serde(rename = "placebo_treatment_refuter")]
    PlaceboTreatment,
    #[serde(rename = "data_subset_refuter")]
    DataSubset,
}

impl RefuterKind {
    pub const ALL: [RefuterKind; 3] = [
        RefuterKind::RandomCommonCause,
        RefuterKind::DataSubset,
        RefuterKind::PlaceboTreatment,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RefuterKind::RandomCommonCause => "random_common_cause",
            RefuterKind::PlaceboTreatment => "placebo_treatment_refuter",
            RefuterKind::DataSubset => "data_subset_refuter",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            RefuterKind::RandomCommonCause => "Add a random common cause",
            RefuterKind::PlaceboTreatment => "Use a Placebo Treatment",
            RefuterKind::DataSubset => "Use a subset of data",
        }
    }

    fn salt(self) -> u64 {
        match self {
            RefuterKind::RandomCommonCause => 0x5243_4341_5553_4500,
            RefuterKind::PlaceboTreatment => 0x504C_4143_4542_4F00,
            RefuterKind::DataSubset => 0x5355_4253_4554_0000,
        }
    }
}

/// How the placebo refuter replaces the treatment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceboType {
    #[default]
    Permute,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefutationResult {
    pub refuter: RefuterKind,
    pub estimated_effect: f64,
    /// Mean effect over all simulations
    pub new_effect: f64,
    pub simulations: usize,
    /// Two-sided p-value of the original estimate under the simulated
    /// distribution, `None` with fewer than two simulations or zero spread
    pub p_value: Option<f64>,
}

impl fmt::Display for RefutationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Refute: {}", self.refuter.title())?;
        writeln!(f, "Estimated effect:{}", format_sig3(self.estimated_effect))?;
        write!(f, "New effect:{}", format_sig3(self.new_effect))?;
        if let Some(p) = self.p_value {
            write!(f, "\np value:{}", format_sig3(p))?;
        }
        Ok(())
    }
}

const RANDOM_COLUMN: &str = "w_random";

/// Run one refuter against `estimate`.
///
/// The token is checked before every simulation.
#[allow(clippy::too_many_arguments)]
pub fn refute_estimate(
    data: &ProjectedData,
    estimand: &IdentifiedEstimand,
    estimate: &CausalEstimate,
    estimator: &dyn EffectEstimator,
    kind: RefuterKind,
    settings: &RefuterSettings,
    cancel: Option<&CancellationToken>,
) -> Result<RefutationResult, CausalError> {
    let random_column = unused_name(data, RANDOM_COLUMN);
    let random_estimand = estimand.with_backdoor_variable(&random_column);

    let mut effects = Vec::with_capacity(settings.num_simulations);
    for sim in 0..settings.num_simulations {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(CausalError::Cancelled);
        }

        let seed = settings.random_seed ^ kind.salt() ^ (sim as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let new = match kind {
            RefuterKind::RandomCommonCause => {
                let values: Vec<f64> = (0..data.n_rows())
                    .map(|_| StandardNormal.sample(&mut rng))
                    .collect();
                let augmented = data.with_covariate(random_column.clone(), values)?;
                estimator.estimate(&augmented, &random_estimand, estimate.target_units)?
            }
            RefuterKind::PlaceboTreatment => {
                let placebo = match settings.placebo_type {
                    PlaceboType::Permute => {
                        let mut permuted = data.treatment().to_vec();
                        permuted.shuffle(&mut rng);
                        permuted
                    }
                };
                let placebo_data = data.with_treatment(placebo)?;
                estimator.estimate(&placebo_data, estimand, estimate.target_units)?
            }
            RefuterKind::DataSubset => {
                let n = data.n_rows();
                let keep = ((settings.subset_fraction * n as f64).round() as usize).clamp(1, n);
                let mut rows = index::sample(&mut rng, n, keep).into_vec();
                rows.sort_unstable();
                estimator.estimate(&data.subset(&rows), estimand, estimate.target_units)?
            }
        };
        effects.push(new.value);
    }

    let count = effects.len() as f64;
    let mean = effects.iter().sum::<f64>() / count;
    let p_value = if effects.len() >= 2 {
        let var = effects.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / (count - 1.0);
        let std = var.sqrt();
        if std > 0.0 {
            two_sided_p_value((estimate.value - mean) / std)
        } else {
            None
        }
    } else {
        None
    };

    debug!(
        "{}: {} simulations, new effect {mean}, p {:?}",
        kind.name(),
        effects.len(),
        p_value
    );

    Ok(RefutationResult {
        refuter: kind,
        estimated_effect: estimate.value,
        new_effect: mean,
        simulations: effects.len(),
        p_value,
    })
}

fn unused_name(data: &ProjectedData, base: &str) -> String {
    if !data.has_column(base) {
        return base.to_string();
    }
    (1..)
        .map(|i| format!("{base}_{i}"))
        .find(|name| !data.has_column(name))
        .unwrap_or_else(|| base.to_string())
}

/// Two-sided tail probability of a standard normal beyond `|z|`
fn two_sided_p_value(z: f64) -> Option<f64> {
    let normal = Normal::new(0.0, 1.0).ok()?;
    Some((2.0 * normal.sf(z.abs())).min(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EstimatorSettings;
    use crate::estimate::{build_estimator, EstimationMethod, TargetUnits};
    use crate::identify::{identify_effect, IdentifyPolicy};
    use crate::params::AnalysisParams;
    use crate::sim::{generate_dataset, SimConfig, SIM_GRAPH};
    use approx::assert_relative_eq;

    struct Fixture {
        data: ProjectedData,
        estimand: IdentifiedEstimand,
        estimator: Box<dyn EffectEstimator>,
        estimate: CausalEstimate,
    }

    fn fixture(method: EstimationMethod) -> Fixture {
        let params = AnalysisParams::new("X", "Y", SIM_GRAPH)
            .unwrap()
            .with_common_causes(["Z1", "Z2"]);
        let data = generate_dataset(&SimConfig::default())
            .unwrap()
            .project(&params)
            .unwrap();
        let estimand = identify_effect(
            params.graph(),
            "X",
            "Y",
            &|name: &str| data.has_column(name),
            &[],
            &[],
            IdentifyPolicy::Strict,
        )
        .unwrap();
        let estimator = build_estimator(method, &EstimatorSettings::default());
        let estimate = estimator
            .estimate(&data, &estimand, TargetUnits::Ate)
            .unwrap();
        Fixture {
            data,
            estimand,
            estimator,
            estimate,
        }
    }

    fn settings(num_simulations: usize) -> RefuterSettings {
        RefuterSettings {
            num_simulations,
            ..Default::default()
        }
    }

    fn run(f: &Fixture, kind: RefuterKind, sims: usize) -> RefutationResult {
        refute_estimate(
            &f.data,
            &f.estimand,
            &f.estimate,
            f.estimator.as_ref(),
            kind,
            &settings(sims),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_random_common_cause_keeps_estimate() {
        let f = fixture(EstimationMethod::LinearRegression);
        let result = run(&f, RefuterKind::RandomCommonCause, 10);
        assert_eq!(result.simulations, 10);
        assert!((result.new_effect - f.estimate.value).abs() < 0.05);
        assert!(result.p_value.unwrap() > 0.05);
    }

    #[test]
    fn test_placebo_effect_is_near_zero() {
        let f = fixture(EstimationMethod::PropensityScoreStratification);
        let result = run(&f, RefuterKind::PlaceboTreatment, 10);
        assert!(result.new_effect.abs() < 0.3, "placebo {}", result.new_effect);
        assert!(result.p_value.unwrap() < 0.01);
    }

    #[test]
    fn test_data_subset_stays_close() {
        let f = fixture(EstimationMethod::PropensityScoreWeighting);
        let result = run(&f, RefuterKind::DataSubset, 10);
        assert!((result.new_effect - f.estimate.value).abs() < 0.2);
    }

    #[test]
    fn test_refuters_are_reproducible() {
        let f = fixture(EstimationMethod::LinearRegression);
        let a = run(&f, RefuterKind::PlaceboTreatment, 5);
        let b = run(&f, RefuterKind::PlaceboTreatment, 5);
        assert_eq!(a, b);
    }

    #[test]
    fn test_single_simulation_has_no_p_value() {
        let f = fixture(EstimationMethod::LinearRegression);
        assert_eq!(run(&f, RefuterKind::DataSubset, 1).p_value, None);
    }

    #[test]
    fn test_cancelled_token_stops_refuter() {
        let f = fixture(EstimationMethod::LinearRegression);
        let token = CancellationToken::new();
        token.cancel();
        let err = refute_estimate(
            &f.data,
            &f.estimand,
            &f.estimate,
            f.estimator.as_ref(),
            RefuterKind::RandomCommonCause,
            &settings(100),
            Some(&token),
        )
        .unwrap_err();
        assert!(matches!(err, CausalError::Cancelled));
    }

    #[test]
    fn test_display_matches_refuter_layout() {
        let result = RefutationResult {
            refuter: RefuterKind::DataSubset,
            estimated_effect: 2.0134,
            new_effect: 2.0,
            simulations: 100,
            p_value: Some(0.9),
        };
        assert_eq!(
            result.to_string(),
            "Refute: Use a subset of data\nEstimated effect:2.01\nNew effect:2\np value:0.9"
        );
    }

    #[test]
    fn test_two_sided_p_value() {
        assert_relative_eq!(two_sided_p_value(0.0).unwrap(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(two_sided_p_value(1.959_964).unwrap(), 0.05, epsilon = 1e-6);
        assert_relative_eq!(
            two_sided_p_value(-1.959_964).unwrap(),
            two_sided_p_value(1.959_964).unwrap()
        );
        assert!(two_sided_p_value(10.0).unwrap() < 1e-20);
    }

    /// Reports the row count it was given as the effect.
    struct RowCount;

    impl EffectEstimator for RowCount {
        fn method(&self) -> EstimationMethod {
            EstimationMethod::LinearRegression
        }

        fn estimate(
            &self,
            data: &ProjectedData,
            _estimand: &IdentifiedEstimand,
            target: TargetUnits,
        ) -> Result<CausalEstimate, CausalError> {
            Ok(CausalEstimate {
                value: data.n_rows() as f64,
                method: self.method(),
                target_units: target,
                backdoor_variables: Vec::new(),
                strata_used: None,
                strata_dropped: None,
                n_units: data.n_rows(),
            })
        }
    }

    #[test]
    fn test_data_subset_keeps_rounded_fraction() {
        let f = fixture(EstimationMethod::LinearRegression);
        let n = f.data.n_rows();
        for fraction in [0.9, 0.333, 1.0] {
            let settings = RefuterSettings {
                num_simulations: 3,
                subset_fraction: fraction,
                ..Default::default()
            };
            let result = refute_estimate(
                &f.data,
                &f.estimand,
                &f.estimate,
                &RowCount,
                RefuterKind::DataSubset,
                &settings,
                None,
            )
            .unwrap();
            assert_eq!(result.new_effect, (fraction * n as f64).round());
        }
    }
}
