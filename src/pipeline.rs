//! The analysis run: project, model, identify, estimate three times, refute
//! three times, report.
//!
//! A run either completes every stage or fails; nothing partial is returned.

use std::time::Instant;

use chrono::Utc;
use log::info;

use crate::config::AnalysisOptions;
use crate::dataset::{Dataset, ProjectedData};
use crate::estimate::{CausalEstimate, TargetUnits};
use crate::identify::IdentifiedEstimand;
use crate::model::CausalModel;
use crate::params::AnalysisParams;
use crate::refute::{RefutationResult, RefuterKind};
use crate::report::AnalysisReport;
use crate::worker::CancellationToken;
use crate::CausalError;

/// Keep the referenced columns and coerce the treatment; fails with
/// [`CausalError::MissingColumns`] when a role names an absent column.
pub fn project_dataset(
    dataset: &Dataset,
    params: &AnalysisParams,
) -> Result<ProjectedData, CausalError> {
    dataset.project(params)
}

pub fn build_model(data: ProjectedData, params: &AnalysisParams) -> Result<CausalModel, CausalError> {
    CausalModel::new(data, params)
}

/// ATE, ATC and ATT from one estimand.
pub fn estimate_all(
    model: &CausalModel,
    estimand: &IdentifiedEstimand,
    options: &AnalysisOptions,
    cancel: Option<&CancellationToken>,
) -> Result<[CausalEstimate; 3], CausalError> {
    let estimate = |target: TargetUnits| -> Result<CausalEstimate, CausalError> {
        if let Some(token) = cancel {
            token.check()?;
        }
        info!("estimating {} with {}", target.label(), options.method);
        model.estimate_effect(estimand, options.method, target, &options.estimation)
    };
    Ok([
        estimate(TargetUnits::Ate)?,
        estimate(TargetUnits::Atc)?,
        estimate(TargetUnits::Att)?,
    ])
}

/// Random common cause, data subset and placebo refutations of `estimate`.
pub fn refute_all(
    model: &CausalModel,
    estimand: &IdentifiedEstimand,
    estimate: &CausalEstimate,
    options: &AnalysisOptions,
    cancel: Option<&CancellationToken>,
) -> Result<[RefutationResult; 3], CausalError> {
    let refute = |kind: RefuterKind| {
        info!(
            "running {} with {} simulations",
            kind.name(),
            options.refutation.num_simulations
        );
        model.refute_estimate(estimand, estimate, kind, options, cancel)
    };
    let [random, subset, placebo] = RefuterKind::ALL;
    Ok([refute(random)?, refute(subset)?, refute(placebo)?])
}

pub fn run_analysis(
    dataset: &Dataset,
    params: &AnalysisParams,
    options: &AnalysisOptions,
) -> Result<AnalysisReport, CausalError> {
    run_analysis_with_cancel(dataset, params, options, &CancellationToken::new())
}

pub fn run_analysis_with_cancel(
    dataset: &Dataset,
    params: &AnalysisParams,
    options: &AnalysisOptions,
    cancel: &CancellationToken,
) -> Result<AnalysisReport, CausalError> {
    let started = Instant::now();
    options.validate()?;
    params.validate_roles()?;

    info!(
        "projecting {} rows onto {} columns",
        dataset.n_rows(),
        params.columns().len()
    );
    let data = project_dataset(dataset, params)?;
    cancel.check()?;

    let model = build_model(data, params)?;
    info!("identifying effect of {} on {}", params.treatment, params.outcome);
    let estimand = model.identify_effect(options.identify_policy)?;
    cancel.check()?;

    let [ate, atc, att] = estimate_all(&model, &estimand, options, Some(cancel))?;
    cancel.check()?;

    let [random_common_cause, data_subset, placebo] =
        refute_all(&model, &estimand, &ate, options, Some(cancel))?;

    let elapsed_secs = started.elapsed().as_secs_f64();
    info!("analysis finished in {elapsed_secs:.2}s");

    Ok(AnalysisReport {
        treatment: params.treatment.clone(),
        outcome: params.outcome.clone(),
        treatment_levels: model.data().treatment_levels().clone(),
        method: options.method,
        estimand,
        ate,
        atc,
        att,
        random_common_cause,
        data_subset,
        placebo,
        elapsed_secs,
        generated_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RefuterSettings;
    use crate::dataset::Column;
    use crate::params::DEFAULT_GRAPH;

    fn small_dataset() -> Dataset {
        Dataset::from_columns(vec![
            Column::numeric("X", vec![0.0, 1.0, 0.0, 1.0]),
            Column::numeric("Y", vec![1.0, 2.0, 3.0, 4.0]),
            Column::numeric("Z1", vec![0.1, 0.2, 0.3, 0.4]),
        ])
        .unwrap()
    }

    #[test]
    fn test_missing_column_aborts_before_modeling() {
        let params = AnalysisParams::new("X", "Y", DEFAULT_GRAPH)
            .unwrap()
            .with_common_causes(["Z1", "Z2"]);
        let err = run_analysis(&small_dataset(), &params, &AnalysisOptions::default()).unwrap_err();
        match err {
            CausalError::MissingColumns(cols) => assert_eq!(cols, vec!["Z2"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_overlapping_roles_are_rejected() {
        let params = AnalysisParams::new("X", "Y", DEFAULT_GRAPH)
            .unwrap()
            .with_common_causes(["Z1"])
            .with_effect_modifiers(["Z1"]);
        assert!(matches!(
            run_analysis(&small_dataset(), &params, &AnalysisOptions::default()),
            Err(CausalError::Config(_))
        ));
    }

    #[test]
    fn test_cancelled_run_returns_no_report() {
        let params = AnalysisParams::new("X", "Y", DEFAULT_GRAPH)
            .unwrap()
            .with_common_causes(["Z1"]);
        let token = CancellationToken::new();
        token.cancel();
        let options = AnalysisOptions {
            refutation: RefuterSettings {
                num_simulations: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            run_analysis_with_cancel(&small_dataset(), &params, &options, &token),
            Err(CausalError::Cancelled)
        ));
    }
}
