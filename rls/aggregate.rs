use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Reduction used to turn a vector of scores into a single number.
///
/// Resolved once from its name when the option is configured, so an unknown
/// name never survives into a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    Mean,
    Min,
    Max,
    Median,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
    #[error("Unknown aggregation function '{0}'. Expected one of: mean, min, max, median.")]
    UnknownFunction(String),
}

impl Aggregate {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Min => "min",
            Self::Max => "max",
            Self::Median => "median",
        }
    }

    /// Applies the reduction. An empty input yields NaN.
    pub fn apply(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return f64::NAN;
        }
        match self {
            Self::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Self::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_unstable_by(|a, b| a.total_cmp(b));
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    0.5 * (sorted[mid - 1] + sorted[mid])
                } else {
                    sorted[mid]
                }
            }
        }
    }
}

impl FromStr for Aggregate {
    type Err = AggregateError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "mean" => Ok(Self::Mean),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "median" => Ok(Self::Median),
            other => Err(AggregateError::UnknownFunction(other.to_string())),
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reductions_match_hand_computed_values() {
        let values = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(Aggregate::Mean.apply(&values), 2.5);
        assert_eq!(Aggregate::Min.apply(&values), 1.0);
        assert_eq!(Aggregate::Max.apply(&values), 4.0);
        assert_eq!(Aggregate::Median.apply(&values), 2.5);
        assert_eq!(Aggregate::Median.apply(&[5.0, -1.0, 2.0]), 2.0);
    }

    #[test]
    fn empty_input_is_nan() {
        assert!(Aggregate::Mean.apply(&[]).is_nan());
        assert!(Aggregate::Median.apply(&[]).is_nan());
    }

    #[test]
    fn names_parse_back_and_unknown_names_are_rejected() {
        for f in [Aggregate::Mean, Aggregate::Min, Aggregate::Max, Aggregate::Median] {
            assert_eq!(f.name().parse::<Aggregate>().unwrap(), f);
        }
        match "mode".parse::<Aggregate>().unwrap_err() {
            AggregateError::UnknownFunction(name) => assert_eq!(name, "mode"),
        }
    }
}
