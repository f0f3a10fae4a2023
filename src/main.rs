use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use clap::{Args, Parser, Subcommand};
use dialoguer::Confirm;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use exp_harness::config::{Config, ExperimentSettings};
use exp_harness::experiment::{ExperimentLayout, Experimenter};
use exp_harness::model::RegressionExperiment;

type Backend = Autodiff<NdArray<f32>>;

#[derive(Debug, Parser)]
#[command(author, version, about = "Experiment runner: fingerprinted runs, sweeps and resumable training")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Train one configuration, or a sweep with --multirun
    Run(RunArgs),
    /// Print the fingerprint of every resolved configuration
    Hash(ExperimentArgs),
    /// Find trained experiments whose config matches key=v1,v2 conditions
    Search(ExperimentArgs),
    /// Remove every experiment under the save path
    Clear(ClearArgs),
}

#[derive(Debug, Args)]
struct ExperimentArgs {
    /// Base YAML configuration
    #[arg(long)]
    config: PathBuf,
    /// Root folder of all experiments
    #[arg(long)]
    save_path: String,
    /// Keys ignored by the fingerprint (dot paths, comma separated)
    #[arg(long, value_delimiter = ',')]
    exclude_keys: Vec<String>,
    /// Overrides (key=value or key=v1,v2) or search conditions
    overrides: Vec<String>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    experiment: ExperimentArgs,
    /// Expand multi-valued overrides into one job per combination
    #[arg(short, long)]
    multirun: bool,
    /// Worker threads for a sweep
    #[arg(long)]
    ncpu: Option<usize>,
    /// Skip the MD5 check of saved models before resuming
    #[arg(long)]
    no_consistent_model: bool,
    /// Hide the progress bar
    #[arg(long)]
    quiet: bool,
}

#[derive(Debug, Args)]
struct ClearArgs {
    /// Root folder of all experiments
    #[arg(long)]
    save_path: String,
    /// Do not ask for confirmation
    #[arg(long)]
    yes: bool,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_command(args),
        Commands::Hash(args) => hash_command(args),
        Commands::Search(args) => search_command(args),
        Commands::Clear(args) => clear_command(args),
    }
}

fn experimenter(
    args: &ExperimentArgs,
    consistent_model: bool,
    show_progress: bool,
) -> Result<Experimenter<RegressionExperiment<Backend>>> {
    info!("Loading configuration from: {:?}", args.config);
    let base = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config file: {:?}", args.config))?;
    let settings = ExperimentSettings::new(args.save_path.clone())
        .with_exclude_keys(args.exclude_keys.iter().cloned())
        .with_consistent_model(consistent_model);
    let hooks = RegressionExperiment::<Backend>::new(Default::default()).with_progress(show_progress);
    Ok(Experimenter::new(settings, base, hooks)?)
}

fn run_command(args: RunArgs) -> Result<()> {
    let exp = experimenter(&args.experiment, !args.no_consistent_model, !args.quiet)?;
    let results = exp.run(&args.experiment.overrides, args.multirun, args.ncpu)?;

    let mut failed = 0;
    for (index, result) in results.iter().enumerate() {
        match result {
            Ok(outcome) => info!(
                "#{index} exp_{}: {:?} after {} iterations, best valid loss {}",
                outcome.fingerprint,
                outcome.output.reason,
                outcome.output.n_iter,
                outcome
                    .output
                    .best_valid_loss
                    .map_or_else(|| "n/a".to_string(), |v| format!("{v:.6}")),
            ),
            Err(e) => {
                failed += 1;
                error!("#{index} failed: {e}");
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} jobs failed", results.len());
    }
    Ok(())
}

fn hash_command(args: ExperimentArgs) -> Result<()> {
    let exp = experimenter(&args, true, false)?;
    for fingerprint in exp.hash(&args.overrides)? {
        println!("{fingerprint}");
    }
    Ok(())
}

fn search_command(args: ExperimentArgs) -> Result<()> {
    let exp = experimenter(&args, true, false)?;
    let models = exp.search(&args.overrides)?;
    info!("Found {} models", models.len());
    for task in &models {
        match &task.trainer {
            Some(trainer) => println!("{} (n_iter={})", trainer.logdir.display(), trainer.n_iter),
            None => println!("<no trainer state>"),
        }
    }
    Ok(())
}

fn clear_command(args: ClearArgs) -> Result<()> {
    let layout = ExperimentLayout::new(&args.save_path, Vec::new())?;
    let removed = layout.clear_all(|root: &Path| {
        args.yes
            || Confirm::new()
                .with_prompt(format!("Remove all experiments under {}?", root.display()))
                .default(false)
                .interact()
                .unwrap_or(false)
    })?;
    info!("Removed {} entries", removed.len());
    Ok(())
}
