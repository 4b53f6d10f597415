use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("Kernel bandwidth must be positive and finite, but was {0}.")]
    InvalidBandwidth(f64),

    #[error("Point sets have {left} and {right} features; both sides of a kernel need the same dimension.")]
    DimensionMismatch { left: usize, right: usize },

    #[error("Coefficient matrix has {found} rows, but the kernel was built against {expected} training points.")]
    CoefficientRows { expected: usize, found: usize },
}

/// Gaussian kernel `k(x, z) = exp(-|x - z|^2 / sigma^2)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RbfKernel {
    sigma: f64,
}

impl RbfKernel {
    pub fn new(sigma: f64) -> Result<Self, KernelError> {
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(KernelError::InvalidBandwidth(sigma));
        }
        Ok(Self { sigma })
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    #[inline]
    fn from_square_distance(&self, dist2: f64) -> f64 {
        (-dist2 / (self.sigma * self.sigma)).exp()
    }

    /// Kernel values between the rows `pivots[start..]` of `features` and the
    /// row `pivots[start - 1]`, in pivot order.
    ///
    /// This is the fresh column the Cholesky step needs after pivoting
    /// position `start - 1`.
    pub fn column(&self, features: ArrayView2<f64>, pivots: &[usize], start: usize) -> Array1<f64> {
        debug_assert!(start >= 1 && start <= pivots.len());
        let anchor = features.row(pivots[start - 1]);
        pivots[start..]
            .iter()
            .map(|&row| self.from_square_distance(square_distance(features.row(row), anchor)))
            .collect()
    }

    /// Full kernel matrix with `a.nrows()` rows and `b.nrows()` columns.
    /// Rows are filled in parallel.
    pub fn matrix(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<Array2<f64>, KernelError> {
        if a.ncols() != b.ncols() {
            return Err(KernelError::DimensionMismatch {
                left: a.ncols(),
                right: b.ncols(),
            });
        }
        let mut k = Array2::zeros((a.nrows(), b.nrows()));
        Zip::from(k.axis_iter_mut(Axis(0)))
            .and(a.axis_iter(Axis(0)))
            .par_for_each(|mut k_row, a_row| {
                for (value, b_row) in k_row.iter_mut().zip(b.axis_iter(Axis(0))) {
                    *value = self.from_square_distance(square_distance(a_row, b_row));
                }
            });
        Ok(k)
    }

    /// Applies dual coefficients: `K(features, training) . coefficients`.
    pub fn predict(
        &self,
        features: ArrayView2<f64>,
        training: ArrayView2<f64>,
        coefficients: ArrayView2<f64>,
    ) -> Result<Array2<f64>, KernelError> {
        if coefficients.nrows() != training.nrows() {
            return Err(KernelError::CoefficientRows {
                expected: training.nrows(),
                found: coefficients.nrows(),
            });
        }
        let k = self.matrix(features, training)?;
        Ok(k.dot(&coefficients))
    }
}

pub fn square_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}
