//! Backdoor effect estimators
//!
//! Every estimator works on a [`ProjectedData`] and the adjustment set of an
//! [`IdentifiedEstimand`], and reports the effect for one target population.

use std::fmt;
use std::str::FromStr;

use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::config::EstimatorSettings;
use crate::dataset::ProjectedData;
use crate::identify::IdentifiedEstimand;
use crate::CausalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EstimationMethod {
    #[serde(rename = "backdoor.propensity_score_stratification")]
    PropensityScoreStratification,
    #[serde(rename = "backdoor.propensity_score_weighting")]
    PropensityScoreWeighting,
    #[serde(rename = "backdoor.linear_regression")]
    LinearRegression,
}

impl EstimationMethod {
    pub const ALL: [EstimationMethod; 3] = [
        EstimationMethod::PropensityScoreStratification,
        EstimationMethod::PropensityScoreWeighting,
        EstimationMethod::LinearRegression,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EstimationMethod::PropensityScoreStratification => {
                "backdoor.propensity_score_stratification"
            }
            EstimationMethod::PropensityScoreWeighting => "backdoor.propensity_score_weighting",
            EstimationMethod::LinearRegression => "backdoor.linear_regression",
        }
    }
}

impl fmt::Display for EstimationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EstimationMethod {
    type Err = CausalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|m| m.name() == wanted || m.name().trim_start_matches("backdoor.") == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|m| m.name()).collect();
                CausalError::Config(format!(
                    "unsupported method '{wanted}', expected one of {}",
                    known.join(", ")
                ))
            })
    }
}

/// Population the effect is averaged over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetUnits {
    /// All units
    Ate,
    /// Control units
    Atc,
    /// Treated units
    Att,
}

impl TargetUnits {
    pub const ALL: [TargetUnits; 3] = [TargetUnits::Ate, TargetUnits::Atc, TargetUnits::Att];

    pub fn label(self) -> &'static str {
        match self {
            TargetUnits::Ate => "ATE",
            TargetUnits::Atc => "ATC",
            TargetUnits::Att => "ATT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CausalEstimate {
    pub value: f64,
    pub method: EstimationMethod,
    pub target_units: TargetUnits,
    pub backdoor_variables: Vec<String>,
    /// Strata that contributed, stratification only
    pub strata_used: Option<usize>,
    /// Strata dropped by the clipping threshold, stratification only
    pub strata_dropped: Option<usize>,
    /// Size of the target population
    pub n_units: usize,
}

pub trait EffectEstimator: Send + Sync {
    fn method(&self) -> EstimationMethod;

    fn estimate(
        &self,
        data: &ProjectedData,
        estimand: &IdentifiedEstimand,
        target: TargetUnits,
    ) -> Result<CausalEstimate, CausalError>;
}

pub fn build_estimator(
    method: EstimationMethod,
    settings: &EstimatorSettings,
) -> Box<dyn EffectEstimator> {
    match method {
        EstimationMethod::PropensityScoreStratification => {
            Box::new(PropensityScoreStratification {
                num_strata: settings.num_strata,
                clipping_threshold: settings.clipping_threshold,
            })
        }
        EstimationMethod::PropensityScoreWeighting => Box::new(PropensityScoreWeighting {
            propensity_clip: settings.propensity_clip,
        }),
        EstimationMethod::LinearRegression => Box::new(LinearRegression),
    }
}

/// Group units into strata of similar propensity and average the
/// within-stratum differences in mean outcome.
#[derive(Debug, Clone)]
pub struct PropensityScoreStratification {
    /// `0` picks `clamp(n / 100, 5, 50)`
    pub num_strata: usize,
    pub clipping_threshold: usize,
}

impl PropensityScoreStratification {
    fn strata_for(&self, n: usize) -> usize {
        let k = if self.num_strata == 0 {
            (n / 100).clamp(5, 50)
        } else {
            self.num_strata
        };
        k.min(n).max(1)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Stratum {
    n_treated: usize,
    n_control: usize,
    sum_treated: f64,
    sum_control: f64,
}

impl EffectEstimator for PropensityScoreStratification {
    fn method(&self) -> EstimationMethod {
        EstimationMethod::PropensityScoreStratification
    }

    fn estimate(
        &self,
        data: &ProjectedData,
        estimand: &IdentifiedEstimand,
        target: TargetUnits,
    ) -> Result<CausalEstimate, CausalError> {
        check_overlap(data)?;
        let covariates = gather(data, &estimand.backdoor_variables)?;
        let propensity = fit_logistic(&covariates, data.treatment())?;

        let n = data.n_rows();
        let k = self.strata_for(n);
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| propensity[a].total_cmp(&propensity[b]));

        let mut strata = vec![Stratum::default(); k];
        for (rank, &row) in order.iter().enumerate() {
            let stratum = &mut strata[rank * k / n];
            let y = data.outcome()[row];
            if data.treatment()[row] {
                stratum.n_treated += 1;
                stratum.sum_treated += y;
            } else {
                stratum.n_control += 1;
                stratum.sum_control += y;
            }
        }

        let clip = self.clipping_threshold;
        let (kept, dropped): (Vec<Stratum>, Vec<Stratum>) = strata
            .into_iter()
            .partition(|s| s.n_treated >= clip && s.n_control >= clip);
        if !dropped.is_empty() {
            debug!(
                "dropped {} of {k} strata with fewer than {clip} treated or control units",
                dropped.len()
            );
        }
        if kept.is_empty() {
            return Err(CausalError::Estimation(format!(
                "no propensity stratum has at least {clip} treated and {clip} control units"
            )));
        }

        let mut weighted = 0.0;
        let mut total = 0.0;
        for s in &kept {
            let diff = s.sum_treated / s.n_treated as f64 - s.sum_control / s.n_control as f64;
            let weight = match target {
                TargetUnits::Ate => (s.n_treated + s.n_control) as f64,
                TargetUnits::Att => s.n_treated as f64,
                TargetUnits::Atc => s.n_control as f64,
            };
            weighted += weight * diff;
            total += weight;
        }

        Ok(CausalEstimate {
            value: weighted / total,
            method: self.method(),
            target_units: target,
            backdoor_variables: estimand.backdoor_variables.clone(),
            strata_used: Some(kept.len()),
            strata_dropped: Some(dropped.len()),
            n_units: target_size(data, target),
        })
    }
}

/// Inverse propensity weighting with normalized (Hájek) weights.
#[derive(Debug, Clone)]
pub struct PropensityScoreWeighting {
    pub propensity_clip: f64,
}

impl EffectEstimator for PropensityScoreWeighting {
    fn method(&self) -> EstimationMethod {
        EstimationMethod::PropensityScoreWeighting
    }

    fn estimate(
        &self,
        data: &ProjectedData,
        estimand: &IdentifiedEstimand,
        target: TargetUnits,
    ) -> Result<CausalEstimate, CausalError> {
        check_overlap(data)?;
        let covariates = gather(data, &estimand.backdoor_variables)?;
        let propensity = fit_logistic(&covariates, data.treatment())?;
        let lo = self.propensity_clip;
        let hi = 1.0 - self.propensity_clip;

        let (mut wy_t, mut w_t, mut wy_c, mut w_c) = (0.0, 0.0, 0.0, 0.0);
        for ((&p, &t), &y) in propensity
            .iter()
            .zip(data.treatment())
            .zip(data.outcome())
        {
            let p = p.clamp(lo, hi);
            let w = match (target, t) {
                (TargetUnits::Ate, true) => 1.0 / p,
                (TargetUnits::Ate, false) => 1.0 / (1.0 - p),
                (TargetUnits::Att, true) => 1.0,
                (TargetUnits::Att, false) => p / (1.0 - p),
                (TargetUnits::Atc, true) => (1.0 - p) / p,
                (TargetUnits::Atc, false) => 1.0,
            };
            if t {
                wy_t += w * y;
                w_t += w;
            } else {
                wy_c += w * y;
                w_c += w;
            }
        }

        Ok(CausalEstimate {
            value: wy_t / w_t - wy_c / w_c,
            method: self.method(),
            target_units: target,
            backdoor_variables: estimand.backdoor_variables.clone(),
            strata_used: None,
            strata_dropped: None,
            n_units: target_size(data, target),
        })
    }
}

/// OLS of the outcome on treatment, adjustment set, effect modifiers and
/// treatment-by-modifier interactions.
#[derive(Debug, Clone, Copy)]
pub struct LinearRegression;

impl EffectEstimator for LinearRegression {
    fn method(&self) -> EstimationMethod {
        EstimationMethod::LinearRegression
    }

    fn estimate(
        &self,
        data: &ProjectedData,
        estimand: &IdentifiedEstimand,
        target: TargetUnits,
    ) -> Result<CausalEstimate, CausalError> {
        check_overlap(data)?;
        let controls = gather(data, &estimand.backdoor_variables)?;
        let modifier_names: Vec<String> = estimand
            .effect_modifiers
            .iter()
            .filter(|m| data.covariate(m.as_str()).is_some())
            .cloned()
            .collect();
        let modifiers = gather(data, &modifier_names)?;
        let extra: Vec<&[f64]> = modifier_names
            .iter()
            .zip(&modifiers)
            .filter(|(name, _)| !estimand.backdoor_variables.contains(*name))
            .map(|(_, values)| *values)
            .collect();

        let n = data.n_rows();
        let t: Vec<f64> = data.treatment().iter().map(|&b| f64::from(u8::from(b))).collect();
        let p = 2 + controls.len() + extra.len() + modifiers.len();
        let x = DMatrix::<f64>::from_fn(n, p, |i, j| {
            if j == 0 {
                return 1.0;
            }
            if j == 1 {
                return t[i];
            }
            let j = j - 2;
            if j < controls.len() {
                return controls[j][i];
            }
            let j = j - controls.len();
            if j < extra.len() {
                return extra[j][i];
            }
            t[i] * modifiers[j - extra.len()][i]
        });
        let y = DVector::<f64>::from_column_slice(data.outcome());
        let beta = ols(&x, &y)?;

        let interaction_start = p - modifiers.len();
        let mut value = beta[1];
        for (m, values) in modifiers.iter().enumerate() {
            value += beta[interaction_start + m] * target_mean(values, data.treatment(), target);
        }

        Ok(CausalEstimate {
            value,
            method: self.method(),
            target_units: target,
            backdoor_variables: estimand.backdoor_variables.clone(),
            strata_used: None,
            strata_dropped: None,
            n_units: target_size(data, target),
        })
    }
}

fn check_overlap(data: &ProjectedData) -> Result<(), CausalError> {
    if data.n_treated() == 0 || data.n_control() == 0 {
        return Err(CausalError::Estimation(format!(
            "treatment '{}' has no variation ({} treated, {} control)",
            data.treatment_name(),
            data.n_treated(),
            data.n_control()
        )));
    }
    Ok(())
}

fn gather<'a>(data: &'a ProjectedData, names: &[String]) -> Result<Vec<&'a [f64]>, CausalError> {
    names
        .iter()
        .map(|name| {
            data.covariate(name).ok_or_else(|| {
                CausalError::Estimation(format!("adjustment variable '{name}' is not in the data"))
            })
        })
        .collect()
}

fn target_size(data: &ProjectedData, target: TargetUnits) -> usize {
    match target {
        TargetUnits::Ate => data.n_rows(),
        TargetUnits::Att => data.n_treated(),
        TargetUnits::Atc => data.n_control(),
    }
}

fn target_mean(values: &[f64], treatment: &[bool], target: TargetUnits) -> f64 {
    let (sum, count) = values
        .iter()
        .zip(treatment)
        .filter(|(_, t)| match target {
            TargetUnits::Ate => true,
            TargetUnits::Att => **t,
            TargetUnits::Atc => !**t,
        })
        .fold((0.0, 0usize), |(s, c), (&v, _)| (s + v, c + 1));
    sum / count.max(1) as f64
}

fn solve_normal_equation(normal: DMatrix<f64>, rhs: DVector<f64>) -> Option<DVector<f64>> {
    if let Some(chol) = normal.clone().cholesky() {
        return Some(chol.solve(&rhs));
    }
    normal.lu().solve(&rhs)
}

fn ols(x: &DMatrix<f64>, y: &DVector<f64>) -> Result<DVector<f64>, CausalError> {
    let xt = x.transpose();
    let beta = solve_normal_equation(&xt * x, &xt * y).ok_or_else(|| {
        CausalError::Estimation("regression design matrix is singular".to_string())
    })?;
    if beta.iter().any(|b| !b.is_finite()) {
        return Err(CausalError::Estimation(
            "regression produced non-finite coefficients".to_string(),
        ));
    }
    Ok(beta)
}

const LOGIT_MAX_ITER: usize = 50;
const LOGIT_TOL: f64 = 1e-8;
const LOGIT_RIDGE: f64 = 1e-6;

/// Propensity scores from a ridge-stabilized logistic regression fitted by
/// Newton's method on standardized covariates.
pub fn fit_logistic(covariates: &[&[f64]], treatment: &[bool]) -> Result<Vec<f64>, CausalError> {
    let n = treatment.len();
    let mut columns: Vec<Vec<f64>> = Vec::with_capacity(covariates.len());
    for values in covariates {
        let mean = values.iter().sum::<f64>() / n as f64;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        let std = var.sqrt();
        if std < 1e-12 {
            // constant column, absorbed by the intercept
            continue;
        }
        columns.push(values.iter().map(|v| (v - mean) / std).collect());
    }

    let p = columns.len() + 1;
    let x = DMatrix::<f64>::from_fn(n, p, |i, j| if j == 0 { 1.0 } else { columns[j - 1][i] });
    let t = DVector::<f64>::from_iterator(n, treatment.iter().map(|&b| f64::from(u8::from(b))));
    let mut beta = DVector::<f64>::zeros(p);

    for iter in 0..LOGIT_MAX_ITER {
        let mu = (&x * &beta).map(sigmoid);
        let w = mu.map(|m| (m * (1.0 - m)).max(1e-10));
        let gradient = x.transpose() * (&t - &mu) - &beta * LOGIT_RIDGE;

        let mut weighted = x.clone();
        for (i, mut row) in weighted.row_iter_mut().enumerate() {
            row *= w[i];
        }
        let hessian = x.transpose() * weighted + DMatrix::<f64>::identity(p, p) * LOGIT_RIDGE;

        let step = solve_normal_equation(hessian, gradient).ok_or_else(|| {
            CausalError::Estimation("propensity model Hessian is singular".to_string())
        })?;
        beta += &step;
        if step.amax() < LOGIT_TOL {
            debug!("logistic fit converged after {} iterations", iter + 1);
            break;
        }
    }

    if beta.iter().any(|b| !b.is_finite()) {
        return Err(CausalError::Estimation(
            "propensity model did not converge".to_string(),
        ));
    }
    Ok((&x * &beta).iter().map(|&e| sigmoid(e)).collect())
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identify::{identify_effect, IdentifyPolicy};
    use crate::params::AnalysisParams;
    use crate::sim::{generate_dataset, SimConfig, SIM_GRAPH};
    use approx::assert_abs_diff_eq;

    fn scenario(config: &SimConfig) -> (ProjectedData, IdentifiedEstimand) {
        let params = AnalysisParams::new("X", "Y", SIM_GRAPH)
            .unwrap()
            .with_common_causes(["Z1", "Z2"])
            .with_effect_modifiers(["W"]);
        let data = generate_dataset(config).unwrap().project(&params).unwrap();
        let estimand = identify_effect(
            params.graph(),
            "X",
            "Y",
            &|name: &str| data.has_column(name),
            &params.effect_modifiers,
            &[],
            IdentifyPolicy::Strict,
        )
        .unwrap();
        (data, estimand)
    }

    #[test]
    fn test_method_names_parse() {
        for method in EstimationMethod::ALL {
            assert_eq!(method.name().parse::<EstimationMethod>().unwrap(), method);
        }
        assert_eq!(
            "linear_regression".parse::<EstimationMethod>().unwrap(),
            EstimationMethod::LinearRegression
        );
        assert!("backdoor.magic".parse::<EstimationMethod>().is_err());
    }

    #[test]
    fn test_auto_strata_count() {
        let s = PropensityScoreStratification {
            num_strata: 0,
            clipping_threshold: 10,
        };
        assert_eq!(s.strata_for(2000), 20);
        assert_eq!(s.strata_for(100), 5);
        assert_eq!(s.strata_for(1_000_000), 50);
        assert_eq!(s.strata_for(3), 3);
    }

    #[test]
    fn test_every_method_recovers_effect() {
        let (data, estimand) = scenario(&SimConfig::default());
        assert_eq!(estimand.backdoor_variables, vec!["Z1", "Z2"]);
        for method in EstimationMethod::ALL {
            let estimator = build_estimator(method, &EstimatorSettings::default());
            for target in TargetUnits::ALL {
                let estimate = estimator.estimate(&data, &estimand, target).unwrap();
                assert!(
                    (estimate.value - 2.0).abs() < 0.5,
                    "{method} {target:?} gave {}",
                    estimate.value
                );
            }
        }
    }

    #[test]
    fn test_stratification_reports_strata() {
        let (data, estimand) = scenario(&SimConfig::default());
        let estimator = build_estimator(
            EstimationMethod::PropensityScoreStratification,
            &EstimatorSettings::default(),
        );
        let estimate = estimator.estimate(&data, &estimand, TargetUnits::Att).unwrap();
        let used = estimate.strata_used.unwrap();
        let dropped = estimate.strata_dropped.unwrap();
        assert_eq!(used + dropped, 20);
        assert!(used > 0);
        assert_eq!(estimate.n_units, data.n_treated());
    }

    #[test]
    fn test_stratification_fails_when_all_strata_clipped() {
        let (data, estimand) = scenario(&SimConfig {
            n_rows: 60,
            ..Default::default()
        });
        let estimator = PropensityScoreStratification {
            num_strata: 5,
            clipping_threshold: 50,
        };
        let err = estimator
            .estimate(&data, &estimand, TargetUnits::Ate)
            .unwrap_err();
        assert!(matches!(err, CausalError::Estimation(_)));
    }

    #[test]
    fn test_regression_uses_modifier_interaction() {
        let (data, estimand) = scenario(&SimConfig {
            modifier_slope: 1.0,
            noise_std: 0.1,
            ..Default::default()
        });
        let estimate = LinearRegression
            .estimate(&data, &estimand, TargetUnits::Att)
            .unwrap();
        let w = data.covariate("W").unwrap();
        let expected = 2.0 + target_mean(w, data.treatment(), TargetUnits::Att);
        assert_abs_diff_eq!(estimate.value, expected, epsilon = 0.05);
    }

    #[test]
    fn test_constant_treatment_is_rejected() {
        let (data, estimand) = scenario(&SimConfig {
            n_rows: 50,
            ..Default::default()
        });
        let data = data.with_treatment(vec![true; 50]).unwrap();
        let err = LinearRegression
            .estimate(&data, &estimand, TargetUnits::Ate)
            .unwrap_err();
        assert!(matches!(err, CausalError::Estimation(_)));
    }

    #[test]
    fn test_logistic_fit_tracks_true_propensity() {
        let x: Vec<f64> = (0..400).map(|i| (i as f64 - 200.0) / 50.0).collect();
        let t: Vec<bool> = x
            .iter()
            .enumerate()
            .map(|(i, &v)| (i * 7919 % 100) as f64 / 100.0 < sigmoid(v))
            .collect();
        let p = fit_logistic(&[&x], &t).unwrap();
        assert!(p[0] < 0.2);
        assert!(p[399] > 0.8);
        assert!(p.windows(2).all(|w| w[0] <= w[1] + 1e-12));
    }
}
