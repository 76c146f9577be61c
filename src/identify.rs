//! Backdoor identification
//!
//! Finds an observed adjustment set that blocks every backdoor path from the
//! treatment to the outcome, and the instruments of the treatment.

use std::collections::BTreeSet;
use std::fmt;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::graph::CausalGraph;
use crate::CausalError;

/// What to do when no observed adjustment set blocks all backdoor paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifyPolicy {
    /// Proceed with the observed parents of the treatment and flag the
    /// estimand as not identified
    #[default]
    BestEffort,
    /// Fail with [`CausalError::NotIdentifiable`]
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimandType {
    NonparametricAte,
}

/// Statistical quantity that answers the causal question
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentifiedEstimand {
    pub estimand_type: EstimandType,
    pub treatment: String,
    pub outcome: String,
    pub backdoor_variables: Vec<String>,
    pub instrumental_variables: Vec<String>,
    pub effect_modifiers: Vec<String>,
    /// Confounders named in the graph but absent from the data
    pub unobserved_confounders: Vec<String>,
    /// `false` when the backdoor set was accepted without blocking every path
    pub identified: bool,
}

impl IdentifiedEstimand {
    /// Expression of the backdoor estimand, e.g. `d/d[X](E[Y|Z1,Z2])`
    pub fn expression(&self) -> String {
        if self.backdoor_variables.is_empty() {
            format!("d/d[{}](E[{}])", self.treatment, self.outcome)
        } else {
            format!(
                "d/d[{}](E[{}|{}])",
                self.treatment,
                self.outcome,
                self.backdoor_variables.join(",")
            )
        }
    }

    /// Copy with one more variable in the adjustment set
    pub fn with_backdoor_variable(&self, name: &str) -> IdentifiedEstimand {
        let mut copy = self.clone();
        if !copy.backdoor_variables.iter().any(|v| v == name) {
            copy.backdoor_variables.push(name.to_string());
        }
        copy
    }
}

impl fmt::Display for IdentifiedEstimand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Estimand type: nonparametric-ate")?;
        writeln!(f, "Estimand expression: {}", self.expression())?;
        let conditioning = if self.backdoor_variables.is_empty() {
            String::new()
        } else {
            format!(",{}", self.backdoor_variables.join(","))
        };
        writeln!(
            f,
            "Estimand assumption: Unconfoundedness: if U->{{{t}}} and U->{y} then P({y}|{t}{c},U) = P({y}|{t}{c})",
            t = self.treatment,
            y = self.outcome,
            c = conditioning
        )?;
        if !self.instrumental_variables.is_empty() {
            writeln!(f, "Instruments: {}", self.instrumental_variables.join(", "))?;
        }
        if !self.identified {
            write!(
                f,
                "Warning: backdoor paths may remain open (unobserved: {})",
                self.unobserved_confounders.join(", ")
            )?;
        }
        Ok(())
    }
}

/// Identify the effect of `treatment` on `outcome`.
///
/// `observed` tells which graph nodes are columns of the data. The candidate
/// sets tried in order are: observed parents of the treatment; observed
/// ancestors of treatment or outcome that are not descendants of the
/// treatment; the same including instruments. The first one that
/// d-separates treatment and outcome once the treatment's outgoing edges are
/// cut is used.
pub fn identify_effect(
    graph: &CausalGraph,
    treatment: &str,
    outcome: &str,
    observed: &dyn Fn(&str) -> bool,
    effect_modifiers: &[String],
    declared_instruments: &[String],
    policy: IdentifyPolicy,
) -> Result<IdentifiedEstimand, CausalError> {
    for name in [treatment, outcome] {
        if !graph.contains(name) {
            return Err(CausalError::Config(format!(
                "'{name}' is not a node of the causal graph"
            )));
        }
    }

    if !graph.has_directed_path(treatment, outcome) {
        warn!("no directed path from {treatment} to {outcome}, the effect is expected to be zero");
    }

    let cut = graph.without_outgoing(treatment);
    let descendants = graph.descendants(treatment);

    let mut instruments: Vec<String> = Vec::new();
    for candidate in graph.ancestors(treatment) {
        if candidate != outcome
            && observed(candidate.as_str())
            && cut.d_separated(&[candidate.as_str()], &[outcome], &[])
        {
            instruments.push(candidate);
        }
    }
    for name in declared_instruments {
        if observed(name.as_str()) && !instruments.contains(name) {
            instruments.push(name.clone());
        }
    }

    let parents: Vec<String> = graph
        .parents(treatment)
        .into_iter()
        .filter(|p| p != outcome && !instruments.contains(p))
        .collect();
    let (observed_parents, latent_parents): (Vec<String>, Vec<String>) =
        parents.into_iter().partition(|p| observed(p.as_str()));
    let unobserved: Vec<String> = latent_parents
        .into_iter()
        .filter(|u| !cut.d_separated(&[u.as_str()], &[outcome], &[]))
        .collect();

    let mut ancestral: BTreeSet<String> = graph.ancestors(treatment);
    ancestral.extend(graph.ancestors(outcome));
    let canonical: Vec<String> = graph
        .nodes()
        .into_iter()
        .filter(|n| ancestral.contains(*n))
        .filter(|n| *n != treatment && *n != outcome)
        .filter(|n| !descendants.contains(*n) && observed(*n))
        .map(str::to_string)
        .collect();
    let canonical_without_iv: Vec<String> = canonical
        .iter()
        .filter(|n| !instruments.contains(n))
        .cloned()
        .collect();

    let blocks = |set: &[String]| {
        let refs: Vec<&str> = set.iter().map(String::as_str).collect();
        cut.d_separated(&[treatment], &[outcome], &refs)
    };

    let chosen = [&observed_parents, &canonical_without_iv, &canonical]
        .into_iter()
        .find(|set| blocks(set))
        .cloned();

    let (backdoor_variables, identified) = match chosen {
        Some(set) => {
            debug!("backdoor set for {treatment} -> {outcome}: {set:?}");
            (set, true)
        }
        None => {
            let reason = if unobserved.is_empty() {
                "no observed adjustment set blocks every backdoor path".to_string()
            } else {
                format!(
                    "backdoor paths through unobserved {} cannot be blocked",
                    unobserved.join(", ")
                )
            };
            if policy == IdentifyPolicy::Strict {
                return Err(CausalError::NotIdentifiable(reason));
            }
            warn!("{reason}; proceeding with observed parents of {treatment}");
            (observed_parents, false)
        }
    };

    Ok(IdentifiedEstimand {
        estimand_type: EstimandType::NonparametricAte,
        treatment: treatment.to_string(),
        outcome: outcome.to_string(),
        backdoor_variables,
        instrumental_variables: instruments,
        effect_modifiers: effect_modifiers.to_vec(),
        unobserved_confounders: unobserved,
        identified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_observed(_: &str) -> bool {
        true
    }

    fn identify(
        dot: &str,
        observed: &dyn Fn(&str) -> bool,
        policy: IdentifyPolicy,
    ) -> Result<IdentifiedEstimand, CausalError> {
        let graph = CausalGraph::parse_dot(dot).unwrap();
        identify_effect(&graph, "X", "Y", observed, &[], &[], policy)
    }

    #[test]
    fn test_confounded_example() {
        let estimand = identify(
            "digraph { X -> Y; Z1 -> Y; Z1 -> X; Z2 -> Y; Z2 -> X; }",
            &all_observed,
            IdentifyPolicy::Strict,
        )
        .unwrap();
        assert!(estimand.identified);
        assert_eq!(estimand.backdoor_variables, vec!["Z1", "Z2"]);
        assert!(estimand.instrumental_variables.is_empty());
        assert_eq!(estimand.expression(), "d/d[X](E[Y|Z1,Z2])");
    }

    #[test]
    fn test_instrument_is_kept_out_of_adjustment() {
        let estimand = identify(
            "digraph { Z -> X; W -> X; W -> Y; X -> Y }",
            &all_observed,
            IdentifyPolicy::Strict,
        )
        .unwrap();
        assert_eq!(estimand.backdoor_variables, vec!["W"]);
        assert_eq!(estimand.instrumental_variables, vec!["Z"]);
    }

    #[test]
    fn test_unobserved_parent_with_observed_mediator() {
        // U is latent but its path to Y runs through M.
        let observed = |n: &str| n != "U";
        let estimand = identify(
            "digraph { U -> X; U -> M; M -> Y; X -> Y }",
            &observed,
            IdentifyPolicy::Strict,
        )
        .unwrap();
        assert!(estimand.identified);
        assert_eq!(estimand.backdoor_variables, vec!["M"]);
    }

    #[test]
    fn test_latent_confounder_strict_fails() {
        let observed = |n: &str| n != "U";
        let err = identify(
            "digraph { U -> X; U -> Y; Z -> X; X -> Y }",
            &observed,
            IdentifyPolicy::Strict,
        )
        .unwrap_err();
        assert!(matches!(err, CausalError::NotIdentifiable(_)));
    }

    #[test]
    fn test_latent_confounder_best_effort_proceeds() {
        let observed = |n: &str| n != "U";
        let estimand = identify(
            "digraph { U -> X; U -> Y; W -> X; W -> Y; X -> Y }",
            &observed,
            IdentifyPolicy::BestEffort,
        )
        .unwrap();
        assert!(!estimand.identified);
        assert_eq!(estimand.backdoor_variables, vec!["W"]);
        assert_eq!(estimand.unobserved_confounders, vec!["U"]);
        assert!(estimand.to_string().contains("unobserved: U"));
    }

    #[test]
    fn test_unconfounded_graph_needs_no_adjustment() {
        let estimand =
            identify("digraph { X -> Y }", &all_observed, IdentifyPolicy::Strict).unwrap();
        assert!(estimand.backdoor_variables.is_empty());
        assert_eq!(estimand.expression(), "d/d[X](E[Y])");
    }

    #[test]
    fn test_missing_treatment_node_is_an_error() {
        let graph = CausalGraph::parse_dot("digraph { A -> Y }").unwrap();
        let err = identify_effect(
            &graph,
            "X",
            "Y",
            &all_observed,
            &[],
            &[],
            IdentifyPolicy::BestEffort,
        )
        .unwrap_err();
        assert!(matches!(err, CausalError::Config(_)));
    }

    #[test]
    fn test_with_backdoor_variable() {
        let estimand =
            identify("digraph { W -> X; W -> Y; X -> Y }", &all_observed, IdentifyPolicy::Strict)
                .unwrap();
        let extended = estimand.with_backdoor_variable("w_random");
        assert_eq!(extended.backdoor_variables, vec!["W", "w_random"]);
        assert_eq!(estimand.backdoor_variables, vec!["W"]);
    }
}
