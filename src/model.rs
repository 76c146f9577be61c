//! Causal model: projected data bound to an augmented causal graph.

use log::debug;

use crate::config::{AnalysisOptions, EstimatorSettings};
use crate::dataset::ProjectedData;
use crate::estimate::{build_estimator, CausalEstimate, EstimationMethod, TargetUnits};
use crate::graph::CausalGraph;
use crate::identify::{identify_effect, IdentifiedEstimand, IdentifyPolicy};
use crate::params::AnalysisParams;
use crate::refute::{refute_estimate, RefutationResult, RefuterKind};
use crate::worker::CancellationToken;
use crate::CausalError;

#[derive(Debug, Clone)]
pub struct CausalModel {
    data: ProjectedData,
    graph: CausalGraph,
    effect_modifiers: Vec<String>,
    instruments: Vec<String>,
}

impl CausalModel {
    /// Bind `data` to the graph of `params`.
    ///
    /// Role variables missing from the graph are added with the edges their
    /// role implies: common causes point to treatment and outcome,
    /// instruments to the treatment, effect modifiers to the outcome. A
    /// treatment or outcome missing from the graph gets a direct edge.
    pub fn new(data: ProjectedData, params: &AnalysisParams) -> Result<Self, CausalError> {
        let mut graph = params.graph().clone();
        let treatment = params.treatment.as_str();
        let outcome = params.outcome.as_str();

        let needs_direct_edge = !graph.contains(treatment) || !graph.contains(outcome);
        graph.add_node(treatment);
        graph.add_node(outcome);
        if needs_direct_edge {
            graph.add_edge(treatment, outcome)?;
        }

        for name in &params.common_causes {
            if !graph.contains(name) {
                debug!("adding common cause {name} to the graph");
                graph.add_edge(name, treatment)?;
                graph.add_edge(name, outcome)?;
            }
        }
        for name in &params.instruments {
            if !graph.contains(name) {
                debug!("adding instrument {name} to the graph");
                graph.add_edge(name, treatment)?;
            }
        }
        for name in &params.effect_modifiers {
            if !graph.contains(name) {
                debug!("adding effect modifier {name} to the graph");
                graph.add_edge(name, outcome)?;
            }
        }

        debug!("causal graph: {}", graph.to_dot());
        Ok(Self {
            data,
            graph,
            effect_modifiers: params.effect_modifiers.clone(),
            instruments: params.instruments.clone(),
        })
    }

    pub fn graph(&self) -> &CausalGraph {
        &self.graph
    }

    pub fn data(&self) -> &ProjectedData {
        &self.data
    }

    pub fn identify_effect(&self, policy: IdentifyPolicy) -> Result<IdentifiedEstimand, CausalError> {
        identify_effect(
            &self.graph,
            self.data.treatment_name(),
            self.data.outcome_name(),
            &|name: &str| self.data.has_column(name),
            &self.effect_modifiers,
            &self.instruments,
            policy,
        )
    }

    pub fn estimate_effect(
        &self,
        estimand: &IdentifiedEstimand,
        method: EstimationMethod,
        target: TargetUnits,
        settings: &EstimatorSettings,
    ) -> Result<CausalEstimate, CausalError> {
        build_estimator(method, settings).estimate(&self.data, estimand, target)
    }

    pub fn refute_estimate(
        &self,
        estimand: &IdentifiedEstimand,
        estimate: &CausalEstimate,
        kind: RefuterKind,
        options: &AnalysisOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<RefutationResult, CausalError> {
        let estimator = build_estimator(estimate.method, &options.estimation);
        refute_estimate(
            &self.data,
            estimand,
            estimate,
            estimator.as_ref(),
            kind,
            &options.refutation,
            cancel,
        )
    }
}
