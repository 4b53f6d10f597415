//! # Rank Checkpoints and Model Selection
//!
//! A checkpoint is an iteration of the decomposition at which the partial
//! model is scored on held-out data. The schedule is fixed before the loop
//! starts; the `ModelSelector` keeps the best-scoring coefficients seen so far
//! together with the full performance and timing trace.

use crate::aggregate::Aggregate;
use crate::factor::PivotedFactor;
use crate::perf::{PerfError, PerfMetric};
use ndarray::{Array2, ArrayView2};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;
use thiserror::Error;

/// Iteration indices (0-based) at which the model is evaluated.
///
/// For a rank budget `m` and `count` checkpoints, checkpoint `c` sits at
/// iteration `round(m^((c + 1) / count)) - 1`, so ranks are spread
/// geometrically and the last one is always the full budget. Collisions at
/// small ranks collapse, so the set may hold fewer than `count` entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSchedule {
    iterations: BTreeSet<usize>,
}

impl CheckpointSchedule {
    pub fn geometric(rank_max: usize, count: usize) -> Self {
        let iterations = if rank_max == 0 {
            BTreeSet::new()
        } else {
            (0..count)
                .map(|c| {
                    let rank = (rank_max as f64).powf((c as f64 + 1.0) / count as f64).round();
                    (rank as usize).clamp(1, rank_max) - 1
                })
                .collect()
        };
        Self { iterations }
    }

    pub fn contains(&self, iteration: usize) -> bool {
        self.iterations.contains(&iteration)
    }

    pub fn len(&self) -> usize {
        self.iterations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iterations.is_empty()
    }

    /// Checkpoint ranks (number of factor columns) in ascending order.
    pub fn ranks(&self) -> Vec<usize> {
        self.iterations.iter().map(|&i| i + 1).collect()
    }
}

/// Score of the partial model at one checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointResult {
    pub rank: usize,
    pub score: f64,
    pub elapsed_ms: f64,
    pub coefficients: Array2<f64>,
}

/// Scores partial models against a held-out split through a precomputed
/// validation kernel (`n_va x n`, columns in original sample order).
pub struct CheckpointEvaluator<'a> {
    validation_kernel: ArrayView2<'a, f64>,
    validation_targets: ArrayView2<'a, f64>,
    metric: PerfMetric,
    reduce: Aggregate,
    started: Instant,
}

impl<'a> CheckpointEvaluator<'a> {
    pub fn new(
        validation_kernel: ArrayView2<'a, f64>,
        validation_targets: ArrayView2<'a, f64>,
        metric: PerfMetric,
        reduce: Aggregate,
    ) -> Self {
        Self {
            validation_kernel,
            validation_targets,
            metric,
            reduce,
            started: Instant::now(),
        }
    }

    /// Resets the clock that elapsed times are measured from.
    pub fn start_clock(&mut self) {
        self.started = Instant::now();
    }

    /// Derives the coefficients at the factor's current rank and scores them.
    /// The factor is only read.
    pub fn evaluate(&self, factor: &PivotedFactor) -> Result<CheckpointResult, PerfError> {
        let coefficients = factor.coefficients();
        let predictions = self.validation_kernel.dot(&coefficients);
        let acc = self.metric.score(predictions.view(), self.validation_targets)?;
        let score = match acc.as_slice() {
            Some(values) => self.reduce.apply(values),
            None => self.reduce.apply(&acc.iter().copied().collect::<Vec<_>>()),
        };
        Ok(CheckpointResult {
            rank: factor.rank(),
            score,
            elapsed_ms: self.started.elapsed().as_secs_f64() * 1e3,
            coefficients,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorState {
    Initialized,
    Iterating,
    Checkpointed,
    Finalized,
}

impl fmt::Display for SelectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialized => "initialized",
            Self::Iterating => "iterating",
            Self::Checkpointed => "checkpointed",
            Self::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Model selector cannot {action} while {state}.")]
    InvalidTransition {
        action: &'static str,
        state: SelectorState,
    },
}

/// Frozen result of a selection run.
#[derive(Debug, Clone)]
pub struct Selection {
    /// Coefficients of the best checkpoint, `None` if nothing was scored or no
    /// score beat the initial floor.
    pub coefficients: Option<Array2<f64>>,
    pub best_rank: usize,
    pub best_score: f64,
    pub ranks: Vec<usize>,
    pub performance: Vec<f64>,
    pub times: Vec<f64>,
}

/// Tracks the best checkpoint. A later checkpoint replaces the current best
/// only with a strictly larger score, so the lowest rank wins ties.
#[derive(Debug)]
pub struct ModelSelector {
    state: SelectorState,
    best: Option<Array2<f64>>,
    best_rank: usize,
    best_score: f64,
    ranks: Vec<usize>,
    performance: Vec<f64>,
    times: Vec<f64>,
}

impl Default for ModelSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelSelector {
    pub fn new() -> Self {
        Self {
            state: SelectorState::Initialized,
            best: None,
            best_rank: 0,
            best_score: -f64::MAX,
            ranks: Vec::new(),
            performance: Vec::new(),
            times: Vec::new(),
        }
    }

    pub fn state(&self) -> SelectorState {
        self.state
    }

    pub fn start(&mut self) -> Result<(), SelectionError> {
        self.expect_state(SelectorState::Initialized, "start")?;
        self.state = SelectorState::Iterating;
        Ok(())
    }

    /// Appends a checkpoint to the trace and keeps it if it is the new best.
    /// Returns whether it was kept.
    pub fn record(&mut self, result: CheckpointResult) -> Result<bool, SelectionError> {
        self.expect_state(SelectorState::Iterating, "record a checkpoint")?;
        self.state = SelectorState::Checkpointed;

        self.ranks.push(result.rank);
        self.performance.push(result.score);
        self.times.push(result.elapsed_ms);
        let improved = result.score > self.best_score;
        if improved {
            self.best_score = result.score;
            self.best_rank = result.rank;
            self.best = Some(result.coefficients);
        }

        self.state = SelectorState::Iterating;
        Ok(improved)
    }

    pub fn finalize(&mut self) -> Result<Selection, SelectionError> {
        self.expect_state(SelectorState::Iterating, "finalize")?;
        self.state = SelectorState::Finalized;
        Ok(Selection {
            coefficients: self.best.take(),
            best_rank: self.best_rank,
            best_score: self.best_score,
            ranks: std::mem::take(&mut self.ranks),
            performance: std::mem::take(&mut self.performance),
            times: std::mem::take(&mut self.times),
        })
    }

    fn expect_state(&self, expected: SelectorState, action: &'static str) -> Result<(), SelectionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SelectionError::InvalidTransition {
                action,
                state: self.state,
            })
        }
    }
}
