use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use causal_estimator::config::AnalysisOptions;
use causal_estimator::identify::IdentifyPolicy;
use causal_estimator::params::parse_params;
use causal_estimator::sim::{self, SimConfig};
use causal_estimator::{AnalysisRunner, Dataset, EstimationMethod};

#[derive(Debug, Parser)]
#[command(author, version, about = "Causal effect estimation from a CSV dataset and a causal graph")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the first rows of a dataset
    Preview {
        /// CSV file with a header row
        #[arg(long, value_name = "FILE")]
        data: PathBuf,

        /// Number of rows to show
        #[arg(long, default_value_t = 5)]
        rows: usize,
    },

    /// Estimate the effect and run the refuters
    Run(RunArgs),

    /// Write a synthetic confounded dataset with a known effect
    Simulate {
        /// Output CSV path
        #[arg(long, value_name = "FILE")]
        output: PathBuf,

        #[arg(long)]
        rows: Option<usize>,

        /// True effect of X on Y
        #[arg(long)]
        effect: Option<f64>,

        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// CSV file with a header row
    #[arg(long, value_name = "FILE")]
    data: PathBuf,

    /// File holding the parameter literal
    #[arg(long, value_name = "FILE", conflicts_with = "params_text", required_unless_present = "params_text")]
    params: Option<PathBuf>,

    /// Parameter literal given inline
    #[arg(long, value_name = "TEXT")]
    params_text: Option<String>,

    /// File holding the DOT digraph
    #[arg(long, value_name = "FILE", conflicts_with = "graph_text")]
    graph: Option<PathBuf>,

    /// DOT digraph given inline
    #[arg(long, value_name = "TEXT")]
    graph_text: Option<String>,

    /// TOML options file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Estimation method, e.g. backdoor.propensity_score_stratification
    #[arg(long)]
    method: Option<EstimationMethod>,

    /// Refuter random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Simulations per refuter
    #[arg(long)]
    simulations: Option<usize>,

    /// Fail instead of proceeding when the effect is not identifiable
    #[arg(long)]
    strict: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Markdown)]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Markdown,
    Json,
}

fn read_text(path: &Path, what: &str) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {what} file {}", path.display()))
}

fn load_dataset(path: &Path) -> Result<Dataset> {
    Dataset::from_csv_path(path).with_context(|| format!("failed to load dataset {}", path.display()))
}

fn run(args: RunArgs) -> Result<()> {
    let dataset = load_dataset(&args.data)?;

    let literal = match (&args.params, &args.params_text) {
        (Some(path), _) => read_text(path, "params")?,
        (None, Some(text)) => text.clone(),
        (None, None) => anyhow::bail!("one of --params or --params-text is required"),
    };
    let graph_text = match (&args.graph, &args.graph_text) {
        (Some(path), _) => Some(read_text(path, "graph")?),
        (None, text) => text.clone(),
    };
    let params = parse_params(&literal, graph_text.as_deref()).context("invalid parameters")?;

    let mut options = match &args.config {
        Some(path) => AnalysisOptions::from_toml_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => AnalysisOptions::default(),
    };
    if let Some(v) = args.method {
        options.method = v;
    }
    if let Some(v) = args.seed {
        options.refutation.random_seed = v;
    }
    if let Some(v) = args.simulations {
        options.refutation.num_simulations = v;
    }
    if args.strict {
        options.identify_policy = IdentifyPolicy::Strict;
    }
    options.validate().context("invalid options")?;

    let runner = AnalysisRunner::new();
    let handle = runner.try_start(dataset, params, options)?;
    let report = handle.join().context("analysis failed")?;

    match args.format {
        OutputFormat::Markdown => println!("{}", report.to_markdown()),
        OutputFormat::Json => println!("{}", report.to_json()?),
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Preview { data, rows } => {
            let dataset = load_dataset(&data)?;
            println!("{}", dataset.preview(rows));
        }
        Command::Run(args) => run(args)?,
        Command::Simulate {
            output,
            rows,
            effect,
            seed,
        } => {
            let mut cfg = SimConfig::default();
            if let Some(v) = rows {
                cfg.n_rows = v;
            }
            if let Some(v) = effect {
                cfg.effect = v;
            }
            if let Some(v) = seed {
                cfg.seed = v;
            }
            let generated = sim::generate(&cfg)?;
            sim::write_csv(&generated, &output)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!(
                "Wrote {} rows to {} (true effect {}, naive difference {:.3})",
                generated.len(),
                output.display(),
                cfg.effect,
                sim::naive_difference(&generated)
            );
            println!("Graph: {}", sim::SIM_GRAPH);
        }
    }

    Ok(())
}
