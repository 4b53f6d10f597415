//! Held-out performance metrics.
//!
//! Every metric maps `(predictions, ground truth)` to a `1 x c` accuracy
//! matrix where larger is better. Callers reduce it to a scalar with an
//! `Aggregate`.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PerfError {
    #[error("Unknown performance metric '{0}'. Expected one of: macroavg, precrec, rmse.")]
    UnknownMetric(String),

    #[error("Predictions have shape {predicted:?}, but the ground truth has shape {truth:?}.")]
    ShapeMismatch {
        predicted: (usize, usize),
        truth: (usize, usize),
    },

    #[error("Cannot score an empty prediction set.")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerfMetric {
    /// Per-class accuracy of one-vs-all classification.
    MacroAvg,
    /// Per-output average precision.
    PrecRec,
    /// Per-output negated root-mean-square error.
    Rmse,
}

impl PerfMetric {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MacroAvg => "macroavg",
            Self::PrecRec => "precrec",
            Self::Rmse => "rmse",
        }
    }

    pub fn score(
        &self,
        predictions: ArrayView2<f64>,
        truth: ArrayView2<f64>,
    ) -> Result<Array2<f64>, PerfError> {
        if predictions.dim() != truth.dim() {
            return Err(PerfError::ShapeMismatch {
                predicted: predictions.dim(),
                truth: truth.dim(),
            });
        }
        if predictions.is_empty() {
            return Err(PerfError::Empty);
        }
        let acc = match self {
            Self::MacroAvg => macro_average(predictions, truth),
            Self::PrecRec => truth
                .axis_iter(Axis(1))
                .zip(predictions.axis_iter(Axis(1)))
                .map(|(y, pred)| average_precision(pred, y))
                .collect(),
            Self::Rmse => truth
                .axis_iter(Axis(1))
                .zip(predictions.axis_iter(Axis(1)))
                .map(|(y, pred)| {
                    let sse: f64 = y.iter().zip(pred.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
                    -(sse / y.len() as f64).sqrt()
                })
                .collect(),
        };
        Ok(Array1::from(acc).insert_axis(Axis(0)))
    }
}

impl FromStr for PerfMetric {
    type Err = PerfError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "macroavg" => Ok(Self::MacroAvg),
            "precrec" => Ok(Self::PrecRec),
            "rmse" => Ok(Self::Rmse),
            other => Err(PerfError::UnknownMetric(other.to_string())),
        }
    }
}

impl fmt::Display for PerfMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Class label of one row. Single-output problems are binary: positive
/// values are class 0, everything else class 1.
fn class_of(row: ArrayView1<f64>) -> usize {
    if row.len() == 1 {
        return if row[0] > 0.0 { 0 } else { 1 };
    }
    let mut best = 0;
    for (j, &value) in row.iter().enumerate().skip(1) {
        if value > row[best] {
            best = j;
        }
    }
    best
}

fn macro_average(predictions: ArrayView2<f64>, truth: ArrayView2<f64>) -> Vec<f64> {
    let n_classes = truth.ncols().max(2);
    let mut seen = vec![0usize; n_classes];
    let mut hits = vec![0usize; n_classes];
    for (y, pred) in truth.axis_iter(Axis(0)).zip(predictions.axis_iter(Axis(0))) {
        let actual = class_of(y);
        seen[actual] += 1;
        if class_of(pred) == actual {
            hits[actual] += 1;
        }
    }
    seen.iter()
        .zip(hits.iter())
        .filter(|(count, _)| **count > 0)
        .map(|(count, hit)| *hit as f64 / *count as f64)
        .collect()
}

fn average_precision(pred: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
    let mut order: Vec<usize> = (0..pred.len()).collect();
    order.sort_by(|&a, &b| pred[b].total_cmp(&pred[a]));
    let mut positives = 0usize;
    let mut precision_sum = 0.0;
    for (rank, &idx) in order.iter().enumerate() {
        if y[idx] > 0.0 {
            positives += 1;
            precision_sum += positives as f64 / (rank + 1) as f64;
        }
    }
    if positives == 0 {
        0.0
    } else {
        precision_sum / positives as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn macroavg_scores_each_class_separately() {
        // class 0 rows: 0, 1 ; class 1 rows: 2 ; class 2 rows: 3
        let truth = array![
            [1.0, -1.0, -1.0],
            [1.0, -1.0, -1.0],
            [-1.0, 1.0, -1.0],
            [-1.0, -1.0, 1.0]
        ];
        let pred = array![
            [0.9, 0.1, 0.0],
            [0.1, 0.8, 0.0],
            [0.0, 0.7, 0.2],
            [0.5, 0.1, 0.2]
        ];
        let acc = PerfMetric::MacroAvg.score(pred.view(), truth.view()).unwrap();
        assert_eq!(acc, array![[0.5, 1.0, 0.0]]);
    }

    #[test]
    fn macroavg_single_output_uses_sign() {
        let truth = array![[1.0], [1.0], [-1.0], [-1.0]];
        let pred = array![[0.3], [-0.2], [-0.9], [-0.1]];
        let acc = PerfMetric::MacroAvg.score(pred.view(), truth.view()).unwrap();
        assert_eq!(acc, array![[0.5, 1.0]]);
    }

    #[test]
    fn macroavg_skips_absent_classes() {
        let truth = array![[1.0, -1.0], [1.0, -1.0]];
        let pred = array![[1.0, 0.0], [0.0, 1.0]];
        let acc = PerfMetric::MacroAvg.score(pred.view(), truth.view()).unwrap();
        assert_eq!(acc, array![[0.5]]);
    }

    #[test]
    fn average_precision_of_perfect_and_interleaved_rankings() {
        let truth = array![[1.0], [-1.0], [1.0], [-1.0]];
        let perfect = array![[0.9], [0.1], [0.8], [0.2]];
        let acc = PerfMetric::PrecRec.score(perfect.view(), truth.view()).unwrap();
        assert_abs_diff_eq!(acc[[0, 0]], 1.0, epsilon = 1e-12);

        // ranking: neg, pos, neg, pos -> (1/2 + 2/4) / 2
        let interleaved = array![[0.8], [0.9], [0.1], [0.2]];
        let acc = PerfMetric::PrecRec.score(interleaved.view(), truth.view()).unwrap();
        assert_abs_diff_eq!(acc[[0, 0]], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn rmse_is_negated() {
        let truth = array![[1.0, 0.0], [3.0, 0.0]];
        let pred = array![[2.0, 0.0], [2.0, 2.0]];
        let acc = PerfMetric::Rmse.score(pred.view(), truth.view()).unwrap();
        assert_abs_diff_eq!(acc[[0, 0]], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(acc[[0, 1]], -(2.0f64).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn configuration_errors() {
        assert_eq!(
            "auc".parse::<PerfMetric>().unwrap_err(),
            PerfError::UnknownMetric("auc".to_string())
        );
        assert_eq!("precrec".parse::<PerfMetric>().unwrap(), PerfMetric::PrecRec);
        let err = PerfMetric::Rmse
            .score(array![[1.0]].view(), array![[1.0, 2.0]].view())
            .unwrap_err();
        assert!(matches!(err, PerfError::ShapeMismatch { .. }));
    }
}
