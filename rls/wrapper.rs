//! # Incomplete-Cholesky Kernel RLS
//!
//! `IcholRls` is the public entry point. Parameters are read from, and results
//! published to, its option tree:
//!
//! | Path                      | Kind     | Meaning                                  |
//! |---------------------------|----------|------------------------------------------|
//! | `paramsel.rank_max`       | number   | rank budget `m`                          |
//! | `paramsel.n_rank`         | number   | number of checkpoints                    |
//! | `paramsel.sigma`          | number   | RBF bandwidth                            |
//! | `paramsel.residual_floor` | number   | residual at or below which the loop stops|
//! | `paramsel.perf_reduce`    | function | reduction of the accuracy matrix         |
//! | `hoperf`                  | string   | performance metric name                  |
//! | `split.Xva`, `split.yva`  | matrix   | held-out features and targets            |
//!
//! After `train`: `paramsel.alpha`, `paramsel.acc`, `paramsel.times`,
//! `paramsel.ranks`, `paramsel.maxRank`, `paramsel.maxPerf`,
//! `paramsel.rank_reached`, `optimizer.X` and `optimizer.sigma`.

use crate::aggregate::{Aggregate, AggregateError};
use crate::checkpoint::{
    CheckpointEvaluator, CheckpointSchedule, ModelSelector, Selection, SelectionError,
};
use crate::factor::{PivotedFactor, Step};
use crate::kernel::{KernelError, RbfKernel};
use crate::options::{OptionError, OptionList};
use crate::perf::{PerfError, PerfMetric};
use ndarray::{Array2, ArrayView2};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_RESIDUAL_FLOOR: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("Option store error: {0}")]
    Options(#[from] OptionError),

    #[error("{0}")]
    Aggregate(#[from] AggregateError),

    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("Performance evaluation failed: {0}")]
    Perf(#[from] PerfError),

    #[error("Model selection failed: {0}")]
    Selection(#[from] SelectionError),

    #[error("The training set has no samples.")]
    EmptyTrainingSet,

    #[error("{what} has {found} {axis}, but {expected} were expected.")]
    DimensionMismatch {
        what: &'static str,
        axis: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Parameter '{name}' is invalid: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("No trained model is available. Call train() first.")]
    NotTrained,
}

/// Errors from saving or loading a model file.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Failed to read or write model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Parameters of one training run, resolved from the option tree up front.
struct RunConfig {
    rank_max: usize,
    n_rank: usize,
    residual_floor: f64,
    metric: PerfMetric,
    reduce: Aggregate,
    kernel: RbfKernel,
}

#[derive(Debug, Clone)]
pub struct IcholRls {
    opt: OptionList,
}

impl IcholRls {
    pub fn new(name: &str) -> Self {
        let mut opt = OptionList::new(name);
        let paramsel = opt.ensure_list("paramsel");
        paramsel.add_opt("perf_reduce", Aggregate::Mean);
        paramsel.add_opt("residual_floor", DEFAULT_RESIDUAL_FLOOR);
        opt.ensure_list("split");
        opt.add_opt("hoperf", PerfMetric::MacroAvg.name());
        Self { opt }
    }

    pub fn options(&self) -> &OptionList {
        &self.opt
    }

    pub fn options_mut(&mut self) -> &mut OptionList {
        &mut self.opt
    }

    pub fn set_rank_max(&mut self, rank: usize) {
        self.opt.ensure_list("paramsel").add_opt("rank_max", rank as f64);
    }

    pub fn set_n_rank(&mut self, n_rank: usize) {
        self.opt.ensure_list("paramsel").add_opt("n_rank", n_rank as f64);
    }

    pub fn set_sigma(&mut self, sigma: f64) {
        self.opt.ensure_list("paramsel").add_opt("sigma", sigma);
    }

    pub fn set_residual_floor(&mut self, floor: f64) {
        self.opt.ensure_list("paramsel").add_opt("residual_floor", floor);
    }

    pub fn set_xva(&mut self, xva: ArrayView2<f64>) {
        self.opt.ensure_list("split").add_opt("Xva", xva.to_owned());
    }

    pub fn set_yva(&mut self, yva: ArrayView2<f64>) {
        self.opt.ensure_list("split").add_opt("yva", yva.to_owned());
    }

    pub fn set_validation(&mut self, xva: ArrayView2<f64>, yva: ArrayView2<f64>) {
        self.set_xva(xva);
        self.set_yva(yva);
    }

    /// Selects the held-out metric by name; unknown names are rejected here.
    pub fn set_perf_metric(&mut self, name: &str) -> Result<(), PerfError> {
        let metric: PerfMetric = name.parse()?;
        self.opt.add_opt("hoperf", metric.name());
        Ok(())
    }

    /// Selects how the accuracy matrix is reduced to a score.
    pub fn set_perf_reduce(&mut self, name: &str) -> Result<(), AggregateError> {
        let reduce: Aggregate = name.parse()?;
        self.opt.ensure_list("paramsel").add_opt("perf_reduce", reduce);
        Ok(())
    }

    fn run_config(&self) -> Result<RunConfig, TrainError> {
        let residual_floor = self.opt.get_opt_as_number("paramsel.residual_floor")?;
        if !residual_floor.is_finite() || residual_floor < 0.0 {
            return Err(TrainError::InvalidParameter {
                name: "paramsel.residual_floor",
                reason: format!("must be finite and non-negative, got {residual_floor}"),
            });
        }
        Ok(RunConfig {
            rank_max: self.opt.get_opt_as_count("paramsel.rank_max")?,
            n_rank: self.opt.get_opt_as_count("paramsel.n_rank")?,
            residual_floor,
            metric: self.opt.get_opt_as_string("hoperf")?.parse()?,
            reduce: self.opt.get_opt_as_function("paramsel.perf_reduce")?,
            kernel: RbfKernel::new(self.opt.get_opt_as_number("paramsel.sigma")?)?,
        })
    }

    /// Runs the pivoted decomposition with checkpoint selection and publishes
    /// the best model into the option tree.
    pub fn train(&mut self, features: ArrayView2<f64>, targets: ArrayView2<f64>) -> Result<(), TrainError> {
        let config = self.run_config()?;
        let xva = self.opt.get_opt_as_matrix("split.Xva")?;
        let yva = self.opt.get_opt_as_matrix("split.yva")?;
        validate_inputs(
            features,
            targets,
            xva.view(),
            yva.view(),
            config.rank_max,
            config.n_rank,
        )?;

        log::info!(
            "Training incomplete-Cholesky RLS: {} samples, {} features, {} outputs, rank budget {}, {} checkpoints, sigma {}, metric {} ({}).",
            features.nrows(),
            features.ncols(),
            targets.ncols(),
            config.rank_max,
            config.n_rank,
            config.kernel.sigma(),
            config.metric,
            config.reduce
        );

        let validation_kernel = config.kernel.matrix(xva.view(), features)?;
        let (selection, rank_reached) =
            run_selection(features, targets, validation_kernel.view(), yva.view(), &config)?;

        self.publish(features, selection, rank_reached, config.kernel.sigma());
        Ok(())
    }

    fn publish(&mut self, features: ArrayView2<f64>, selection: Selection, rank_reached: usize, sigma: f64) {
        let paramsel = self.opt.ensure_list("paramsel");
        paramsel.add_opt("acc", row_matrix(&selection.performance));
        paramsel.add_opt("times", row_matrix(&selection.times));
        paramsel.add_opt(
            "ranks",
            selection.ranks.iter().map(|&r| r as f64).collect::<Vec<f64>>(),
        );
        paramsel.add_opt("maxRank", selection.best_rank as f64);
        paramsel.add_opt("maxPerf", selection.best_score);
        paramsel.add_opt("rank_reached", rank_reached as f64);

        match selection.coefficients {
            Some(alpha) => {
                log::info!(
                    "Selected rank {} with held-out score {:.6}.",
                    selection.best_rank,
                    selection.best_score
                );
                paramsel.add_opt("alpha", alpha);
            }
            None => {
                log::warn!("No checkpoint produced a usable score; no model was stored.");
                paramsel.remove_opt("alpha");
            }
        }

        let optimizer = self.opt.ensure_list("optimizer");
        optimizer.add_opt("X", features.to_owned());
        optimizer.add_opt("sigma", sigma);
    }

    pub fn trained_model(&self) -> bool {
        self.opt.get_opt_as_matrix("paramsel.alpha").is_ok()
            && self.opt.get_opt_as_matrix("optimizer.X").is_ok()
    }

    /// Predicts with the selected coefficients: `K(features, X_train) . alpha`.
    pub fn evaluate(&self, features: ArrayView2<f64>) -> Result<Array2<f64>, TrainError> {
        if !self.trained_model() {
            return Err(TrainError::NotTrained);
        }
        let alpha = self.opt.get_opt_as_matrix("paramsel.alpha")?;
        let training = self.opt.get_opt_as_matrix("optimizer.X")?;
        if features.ncols() != training.ncols() {
            return Err(TrainError::DimensionMismatch {
                what: "prediction features",
                axis: "columns",
                expected: training.ncols(),
                found: features.ncols(),
            });
        }
        let kernel = RbfKernel::new(self.opt.get_opt_as_number("optimizer.sigma")?)?;
        Ok(kernel.predict(features, training.view(), alpha.view())?)
    }

    pub fn best_rank(&self) -> Option<usize> {
        self.opt.get_opt_as_count("paramsel.maxRank").ok()
    }

    pub fn best_score(&self) -> Option<f64> {
        self.opt.get_opt_as_number("paramsel.maxPerf").ok()
    }

    pub fn rank_reached(&self) -> Option<usize> {
        self.opt.get_opt_as_count("paramsel.rank_reached").ok()
    }

    pub fn checkpoint_ranks(&self) -> Option<Vec<usize>> {
        self.opt
            .get_opt_as_number_list("paramsel.ranks")
            .ok()
            .map(|ranks| ranks.iter().map(|&r| r as usize).collect())
    }

    pub fn performance(&self) -> Option<Vec<f64>> {
        self.opt
            .get_opt_as_matrix("paramsel.acc")
            .ok()
            .map(|acc| acc.iter().copied().collect())
    }

    pub fn times(&self) -> Option<Vec<f64>> {
        self.opt
            .get_opt_as_matrix("paramsel.times")
            .ok()
            .map(|times| times.iter().copied().collect())
    }

    /// Saves the whole option tree, including any trained model, as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let toml_string = toml::to_string_pretty(&self.opt)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let toml_string = fs::read_to_string(path)?;
        let opt: OptionList = toml::from_str(&toml_string)?;
        Ok(Self { opt })
    }
}

fn row_matrix(values: &[f64]) -> Array2<f64> {
    Array2::from_shape_fn((1, values.len()), |(_, j)| values[j])
}

fn validate_inputs(
    features: ArrayView2<f64>,
    targets: ArrayView2<f64>,
    xva: ArrayView2<f64>,
    yva: ArrayView2<f64>,
    rank_max: usize,
    n_rank: usize,
) -> Result<(), TrainError> {
    let n = features.nrows();
    if n == 0 {
        return Err(TrainError::EmptyTrainingSet);
    }
    if targets.nrows() != n {
        return Err(TrainError::DimensionMismatch {
            what: "targets",
            axis: "rows",
            expected: n,
            found: targets.nrows(),
        });
    }
    if xva.ncols() != features.ncols() {
        return Err(TrainError::DimensionMismatch {
            what: "validation features",
            axis: "columns",
            expected: features.ncols(),
            found: xva.ncols(),
        });
    }
    if yva.ncols() != targets.ncols() {
        return Err(TrainError::DimensionMismatch {
            what: "validation targets",
            axis: "columns",
            expected: targets.ncols(),
            found: yva.ncols(),
        });
    }
    if yva.nrows() != xva.nrows() {
        return Err(TrainError::DimensionMismatch {
            what: "validation targets",
            axis: "rows",
            expected: xva.nrows(),
            found: yva.nrows(),
        });
    }
    if rank_max == 0 || rank_max > n {
        return Err(TrainError::InvalidParameter {
            name: "paramsel.rank_max",
            reason: format!("must be between 1 and the number of samples ({n}), got {rank_max}"),
        });
    }
    if n_rank > 0 && xva.nrows() == 0 {
        return Err(TrainError::InvalidParameter {
            name: "split.Xva",
            reason: "checkpoints need at least one held-out sample".to_string(),
        });
    }
    Ok(())
}

/// The decomposition loop. Returns the frozen selection and the rank the
/// factor actually reached.
fn run_selection<'a>(
    features: ArrayView2<f64>,
    targets: ArrayView2<f64>,
    validation_kernel: ArrayView2<'a, f64>,
    validation_targets: ArrayView2<'a, f64>,
    config: &RunConfig,
) -> Result<(Selection, usize), TrainError> {
    let schedule = CheckpointSchedule::geometric(config.rank_max, config.n_rank);
    log::debug!("Checkpoint ranks: {:?}", schedule.ranks());

    let mut factor = PivotedFactor::new(targets, config.rank_max, config.residual_floor);
    let mut evaluator = CheckpointEvaluator::new(
        validation_kernel,
        validation_targets,
        config.metric,
        config.reduce,
    );
    let mut selector = ModelSelector::new();
    selector.start()?;
    evaluator.start_clock();

    for iteration in 0..config.rank_max {
        match factor.extend(features, &config.kernel) {
            Step::Extended { sample, diagonal } => {
                log::debug!(
                    "Rank {}: pivoted sample {sample}, diagonal {diagonal:.3e}",
                    iteration + 1
                );
            }
            Step::Exhausted { residual } => {
                log::warn!(
                    "Residual collapsed to {residual:.3e} at rank {} of {}; stopping early.",
                    factor.rank(),
                    config.rank_max
                );
                break;
            }
        }

        if schedule.contains(iteration) {
            let result = evaluator.evaluate(&factor)?;
            log::info!(
                "Checkpoint rank {}: score {:.6} ({:.1} ms)",
                result.rank,
                result.score,
                result.elapsed_ms
            );
            if selector.record(result)? {
                log::debug!("New best model at rank {}", iteration + 1);
            }
        }
    }

    let selection = selector.finalize()?;
    Ok((selection, factor.rank()))
}
