//! Causal effect estimation from a tabular dataset and a causal graph.
//!
//! A run takes a CSV dataset, a DOT `digraph` describing the causal
//! structure, and a parameter literal naming the treatment, outcome, common
//! causes, effect modifiers and instruments. It identifies the effect with the
//! backdoor criterion, estimates it for three target populations (ATE, ATC,
//! ATT) and stress-tests the population estimate with three refuters (random
//! common cause, placebo treatment, data subset).
//!
//! The run is a strict linear pipeline, see [`pipeline::run_analysis`].

pub mod config;
pub mod dataset;
pub mod estimate;
pub mod graph;
pub mod identify;
pub mod model;
pub mod params;
pub mod pipeline;
pub mod refute;
pub mod report;
pub mod sim;
pub mod worker;

use thiserror::Error;

// Re-export main types
pub use config::{AnalysisOptions, EstimatorSettings, RefuterSettings};
pub use dataset::{BinaryLevels, Dataset, ProjectedData};
pub use estimate::{CausalEstimate, EstimationMethod, TargetUnits};
pub use graph::CausalGraph;
pub use identify::{IdentifiedEstimand, IdentifyPolicy};
pub use model::CausalModel;
pub use params::{parse_params, AnalysisParams};
pub use pipeline::{run_analysis, run_analysis_with_cancel};
pub use refute::{RefutationResult, RefuterKind};
pub use report::{format_sig3, AnalysisReport};
pub use worker::{AnalysisHandle, AnalysisRunner, CancellationToken};

#[derive(Debug, Error)]
pub enum CausalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("could not parse {what}: {message}")]
    Parse { what: &'static str, message: String },
    #[error("missing column(s) in dataset: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("effect is not identifiable: {0}")]
    NotIdentifiable(String),
    #[error("estimation failed: {0}")]
    Estimation(String),
    #[error("analysis cancelled")]
    Cancelled,
    #[error("an analysis run is already in flight")]
    RunInFlight,
    #[error("analysis worker panicked")]
    WorkerPanicked,
}

impl CausalError {
    pub(crate) fn parse(what: &'static str, message: impl Into<String>) -> Self {
        Self::Parse {
            what,
            message: message.into(),
        }
    }
}
