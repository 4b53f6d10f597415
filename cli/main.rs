#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use ichol_rls::IcholRls;
use ichol_rls::data::{load_matrix, write_matrix};
use ichol_rls::wrapper::DEFAULT_RESIDUAL_FLOOR;

#[derive(Args)]
pub struct TrainArgs {
    /// Path to the training feature matrix (CSV, or TSV by extension)
    pub features: PathBuf,

    /// Path to the training target matrix, one row per sample
    pub targets: PathBuf,

    /// Held-out feature matrix used to score checkpoints
    #[arg(long)]
    pub val_features: PathBuf,

    /// Held-out target matrix used to score checkpoints
    #[arg(long)]
    pub val_targets: PathBuf,

    /// Maximum rank of the incomplete Cholesky factor
    #[arg(long, value_name = "M")]
    pub rank_max: usize,

    /// Number of checkpoints, spaced geometrically up to the rank budget
    #[arg(long, default_value = "10")]
    pub n_rank: usize,

    /// RBF kernel bandwidth
    #[arg(long)]
    pub sigma: f64,

    /// Held-out performance metric (macroavg, precrec, rmse)
    #[arg(long, default_value = "macroavg")]
    pub perf: String,

    /// Reduction of per-output scores (mean, min, max, median)
    #[arg(long, default_value = "mean")]
    pub reduce: String,

    /// Residual at or below which the decomposition stops early
    #[arg(long, default_value_t = DEFAULT_RESIDUAL_FLOOR)]
    pub residual_floor: f64,

    /// Input files start with a header row
    #[arg(long)]
    pub header: bool,

    /// Output path for the trained model
    #[arg(long, default_value = "model.toml")]
    pub model: PathBuf,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Path to the feature matrix to predict
    pub features: PathBuf,

    /// Path to a trained model file
    #[arg(long, default_value = "model.toml")]
    pub model: PathBuf,

    /// Output path for predictions
    #[arg(long, default_value = "predictions.csv")]
    pub output: PathBuf,

    /// Input file starts with a header row
    #[arg(long)]
    pub header: bool,
}

#[derive(Parser)]
#[command(
    name = "ichol-rls",
    about = "Kernel regularized least squares by pivoted incomplete Cholesky",
    long_about = "Fits an RBF-kernel least-squares model by growing a pivoted incomplete \
                 Cholesky factor and keeping the rank that scores best on held-out data."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Train a model with checkpoint rank selection (outputs: model.toml)")]
    Train(TrainArgs),
    #[command(about = "Apply a trained model to new data (outputs: predictions.csv)")]
    Predict(PredictArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Predict(args)) => predict(args),
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn train(args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    let x = load_matrix(&args.features, args.header)?;
    let y = load_matrix(&args.targets, args.header)?;
    let xva = load_matrix(&args.val_features, args.header)?;
    let yva = load_matrix(&args.val_targets, args.header)?;
    println!(
        "Loaded {} training and {} held-out samples with {} features",
        x.nrows(),
        xva.nrows(),
        x.ncols()
    );

    let mut rls = IcholRls::new("ichol");
    rls.set_rank_max(args.rank_max);
    rls.set_n_rank(args.n_rank);
    rls.set_sigma(args.sigma);
    rls.set_residual_floor(args.residual_floor);
    rls.set_perf_metric(&args.perf)?;
    rls.set_perf_reduce(&args.reduce)?;
    rls.set_validation(xva.view(), yva.view());

    rls.train(x.view(), y.view())?;

    if let (Some(ranks), Some(scores)) = (rls.checkpoint_ranks(), rls.performance()) {
        for (rank, score) in ranks.iter().zip(scores.iter()) {
            println!("  rank {rank:>6}  {}: {score:.6}", args.perf);
        }
    }
    match (rls.best_rank(), rls.best_score()) {
        (Some(rank), Some(score)) if rls.trained_model() => {
            println!("Selected rank {rank} ({} = {score:.6})", args.perf)
        }
        _ => println!("No checkpoint produced a model"),
    }

    rls.save(&args.model)?;
    println!("Model saved to: {}", args.model.display());
    Ok(())
}

fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let rls = IcholRls::load(&args.model)?;
    let x = load_matrix(&args.features, args.header)?;
    let predictions = rls.evaluate(x.view())?;
    write_matrix(&args.output, predictions.view())?;
    println!(
        "Wrote {} predictions to: {}",
        predictions.nrows(),
        args.output.display()
    );
    Ok(())
}
