//! # Pivoted Incomplete Cholesky with an Incremental QR
//!
//! Builds `K ≈ G Gᵀ` for the RBF kernel matrix of the training set one column
//! at a time, always absorbing the row with the largest residual diagonal next.
//! Alongside `G` it keeps an orthonormal basis `Q` and `RR = (R Rᵀ)⁻¹` for the
//! implicit `G = Q R`, so the least-squares dual coefficients at the current
//! rank are available in closed form as `Q RR Qᵀ y` without refactorizing.
//!
//! Every row-indexed buffer (`G`, `Q`, residual diagonal, targets) is kept in
//! *pivot order*: row `j` of each refers to training sample `pivots[j]`.

use crate::kernel::RbfKernel;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ShapeBuilder, Zip, s};
use ndarray_linalg::Norm;

/// Outcome of one extension step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    /// A column was added. `sample` is the training row that was pivoted in.
    Extended { sample: usize, diagonal: f64 },
    /// The residual (or the orthogonalized basis column) collapsed; nothing was
    /// added and the factor keeps its previous rank.
    Exhausted { residual: f64 },
}

/// Working state of one decomposition. All buffers are sized up front from
/// the sample count and the rank budget.
#[derive(Debug, Clone)]
pub struct PivotedFactor {
    g: Array2<f64>,
    q: Array2<f64>,
    rr: Array2<f64>,
    diag: Array1<f64>,
    pivots: Vec<usize>,
    y_perm: Array2<f64>,
    rank: usize,
    residual_floor: f64,
}

impl PivotedFactor {
    /// The residual diagonal starts at one, the diagonal of any RBF kernel.
    pub fn new(targets: ArrayView2<f64>, max_rank: usize, residual_floor: f64) -> Self {
        let n = targets.nrows();
        let max_rank = max_rank.min(n);
        Self {
            g: Array2::zeros((n, max_rank).f()),
            q: Array2::zeros((n, max_rank).f()),
            rr: Array2::zeros((max_rank, max_rank).f()),
            diag: Array1::ones(n),
            pivots: (0..n).collect(),
            y_perm: targets.to_owned(),
            rank: 0,
            residual_floor,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn capacity(&self) -> usize {
        self.g.ncols()
    }

    pub fn is_full(&self) -> bool {
        self.rank == self.capacity()
    }

    pub fn pivots(&self) -> &[usize] {
        &self.pivots
    }

    /// Absorbed columns of `G`, rows in pivot order.
    pub fn factor(&self) -> ArrayView2<'_, f64> {
        self.g.slice(s![.., ..self.rank])
    }

    pub fn basis(&self) -> ArrayView2<'_, f64> {
        self.q.slice(s![.., ..self.rank])
    }

    pub fn inverse_gram(&self) -> ArrayView2<'_, f64> {
        self.rr.slice(s![..self.rank, ..self.rank])
    }

    pub fn residual_diagonal(&self) -> ArrayView1<'_, f64> {
        self.diag.view()
    }

    pub fn permuted_targets(&self) -> ArrayView2<'_, f64> {
        self.y_perm.view()
    }

    /// Position in `[rank, n)` of the largest residual; the first one wins ties.
    pub fn select_pivot(&self) -> usize {
        let start = self.rank;
        let mut best = start;
        for j in (start + 1)..self.diag.len() {
            if self.diag[j] > self.diag[best] {
                best = j;
            }
        }
        best
    }

    /// Moves position `jast` to the current rank in every row-indexed buffer.
    fn apply_pivot(&mut self, jast: usize) {
        let i = self.rank;
        if jast == i {
            return;
        }
        self.pivots.swap(i, jast);
        self.diag.swap(i, jast);
        for c in 0..self.y_perm.ncols() {
            self.y_perm.swap([i, c], [jast, c]);
        }
        for c in 0..=i {
            self.g.swap([i, c], [jast, c]);
        }
        for c in 0..i {
            self.q.swap([i, c], [jast, c]);
        }
    }

    /// Pivots, then extends `G`, `Q` and `RR` by one column.
    ///
    /// At rank 0 the correction terms are empty and this is exactly the base
    /// case: unit diagonal, the raw kernel column, residual `1 - k²`.
    pub fn extend(&mut self, features: ArrayView2<f64>, kernel: &RbfKernel) -> Step {
        let i = self.rank;
        debug_assert!(i < self.capacity(), "factor is already at its rank budget");
        let n = self.diag.len();

        let jast = self.select_pivot();
        let residual = self.diag[jast];
        if !residual.is_finite() || residual <= self.residual_floor {
            return Step::Exhausted { residual };
        }
        self.apply_pivot(jast);

        // Schur complement step: G[i+1.., i] = (k - G[i+1.., ..i] G[i, ..i]ᵀ) / G[i, i]
        let g_ii = residual.sqrt();
        let mut below = kernel.column(features, &self.pivots, i + 1);
        below -= &self
            .g
            .slice(s![i + 1.., ..i])
            .dot(&self.g.slice(s![i, ..i]));
        below /= g_ii;

        let mut g_col = Array1::<f64>::zeros(n);
        g_col[i] = g_ii;
        g_col.slice_mut(s![i + 1..]).assign(&below);

        // Gram-Schmidt against the current basis
        let q_prev = self.q.slice(s![.., ..i]);
        let r_col = q_prev.t().dot(&g_col);
        let mut q_col = &g_col - &q_prev.dot(&r_col);
        let rho = q_col.norm_l2();
        if !rho.is_finite() || rho <= self.residual_floor {
            return Step::Exhausted { residual: rho * rho };
        }
        q_col /= rho;

        // Bordering update of (R Rᵀ)⁻¹
        let rr_r = self.rr.slice(s![..i, ..i]).dot(&r_col);
        let corner = (r_col.dot(&rr_r) + 1.0) / (rho * rho);
        let border = rr_r.mapv(|v| -v / rho);

        self.g.column_mut(i).assign(&g_col);
        self.diag[i] = 0.0;
        Zip::from(self.diag.slice_mut(s![i + 1..]))
            .and(&below)
            .for_each(|d, &g| *d -= g * g);
        self.q.column_mut(i).assign(&q_col);
        self.rr.slice_mut(s![..i, i]).assign(&border);
        self.rr.slice_mut(s![i, ..i]).assign(&border);
        self.rr[[i, i]] = corner;
        self.rank += 1;

        Step::Extended {
            sample: self.pivots[i],
            diagonal: g_ii,
        }
    }

    /// Dual coefficients `Q RR Qᵀ y` at the current rank, rows returned to
    /// the original sample order.
    pub fn coefficients(&self) -> Array2<f64> {
        let q = self.basis();
        let qty = q.t().dot(&self.y_perm);
        let permuted = q.dot(&self.inverse_gram().dot(&qty));
        let mut alpha = Array2::zeros(permuted.raw_dim());
        for (j, &sample) in self.pivots.iter().enumerate() {
            alpha.row_mut(sample).assign(&permuted.row(j));
        }
        alpha
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_points(n: usize, d: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((n, d), |_| rng.gen_range(-1.0..1.0))
    }

    fn run(x: &Array2<f64>, y: &Array2<f64>, max_rank: usize, sigma: f64) -> PivotedFactor {
        let kernel = RbfKernel::new(sigma).unwrap();
        let mut factor = PivotedFactor::new(y.view(), max_rank, 1e-12);
        while !factor.is_full() {
            if let Step::Exhausted { residual } = factor.extend(x.view(), &kernel) {
                panic!("unexpected exhaustion at rank {} (residual {residual})", factor.rank());
            }
        }
        factor
    }

    fn max_abs_diff(a: ArrayView2<f64>, b: ArrayView2<f64>) -> f64 {
        assert_eq!(a.dim(), b.dim());
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f64::max)
    }

    fn is_permutation(pivots: &[usize]) -> bool {
        let mut seen = vec![false; pivots.len()];
        for &p in pivots {
            if p >= pivots.len() || seen[p] {
                return false;
            }
            seen[p] = true;
        }
        true
    }

    #[test]
    fn first_step_is_the_base_case() {
        let x = array![[0.0, 0.0], [1.0, 0.0], [0.0, 2.0]];
        let y = array![[1.0], [-1.0], [1.0]];
        let kernel = RbfKernel::new(1.5).unwrap();
        let mut factor = PivotedFactor::new(y.view(), 2, 1e-12);

        let step = factor.extend(x.view(), &kernel);
        assert_eq!(
            step,
            Step::Extended {
                sample: 0,
                diagonal: 1.0
            }
        );
        let k = kernel.matrix(x.view(), x.view()).unwrap();
        let g = factor.factor();
        assert_eq!(g[[0, 0]], 1.0);
        assert_abs_diff_eq!(g[[1, 0]], k[[1, 0]], epsilon = 1e-15);
        assert_abs_diff_eq!(g[[2, 0]], k[[2, 0]], epsilon = 1e-15);
        let diag = factor.residual_diagonal();
        assert_abs_diff_eq!(diag[1], 1.0 - k[[1, 0]].powi(2), epsilon = 1e-15);
        assert_abs_diff_eq!(diag[2], 1.0 - k[[2, 0]].powi(2), epsilon = 1e-15);

        let norm2 = 1.0 + k[[1, 0]].powi(2) + k[[2, 0]].powi(2);
        assert_abs_diff_eq!(factor.inverse_gram()[[0, 0]], 1.0 / norm2, epsilon = 1e-14);
    }

    #[test]
    fn second_pivot_is_largest_residual() {
        // Sample 2 is farthest from sample 0, so it has the largest residual.
        let x = array![[0.0], [0.5], [3.0], [0.2]];
        let y = Array2::zeros((4, 1));
        let kernel = RbfKernel::new(1.0).unwrap();
        let mut factor = PivotedFactor::new(y.view(), 3, 1e-12);
        factor.extend(x.view(), &kernel);
        assert_eq!(factor.select_pivot(), 2);
        assert!(matches!(
            factor.extend(x.view(), &kernel),
            Step::Extended { sample: 2, .. }
        ));
        assert_eq!(&factor.pivots()[..2], &[0, 2]);
    }

    #[test]
    fn ties_go_to_the_first_position() {
        // Samples 1 and 2 are symmetric around sample 0.
        let x = array![[0.0], [-1.0], [1.0]];
        let y = Array2::zeros((3, 1));
        let kernel = RbfKernel::new(1.0).unwrap();
        let mut factor = PivotedFactor::new(y.view(), 2, 1e-12);
        factor.extend(x.view(), &kernel);
        assert_eq!(factor.select_pivot(), 1);
    }

    #[test]
    fn pivots_stay_a_permutation_and_targets_follow_them() {
        let n = 15;
        let x = random_points(n, 3, 11);
        let y = Array2::from_shape_fn((n, 2), |(i, j)| (i * 10 + j) as f64);
        let kernel = RbfKernel::new(0.7).unwrap();
        let mut factor = PivotedFactor::new(y.view(), n, 1e-12);
        while !factor.is_full() {
            assert!(matches!(factor.extend(x.view(), &kernel), Step::Extended { .. }));
            assert!(is_permutation(factor.pivots()));
            for (row, &sample) in factor.pivots().iter().enumerate() {
                assert_eq!(factor.permuted_targets().row(row), y.row(sample));
            }
        }
    }

    #[test]
    fn full_rank_reconstructs_the_permuted_kernel() {
        let n = 12;
        let x = random_points(n, 3, 3);
        let y = random_points(n, 1, 4);
        let factor = run(&x, &y, n, 0.5);

        let kernel = RbfKernel::new(0.5).unwrap();
        let k = kernel.matrix(x.view(), x.view()).unwrap();
        let p = factor.pivots();
        let k_perm = Array2::from_shape_fn((n, n), |(a, b)| k[[p[a], p[b]]]);
        let g = factor.factor();
        let approx = g.dot(&g.t());
        let rel = (&approx - &k_perm).norm_l2() / k_perm.norm_l2();
        assert!(rel < 1e-6, "relative reconstruction error {rel:e}");

        // Lower-trapezoidal in pivot order.
        for col in 0..n {
            for row in 0..col {
                assert_eq!(g[[row, col]], 0.0);
            }
        }
    }

    #[test]
    fn basis_is_orthonormal_and_rr_inverts_r_rt() {
        let n = 20;
        let x = random_points(n, 2, 21);
        let y = random_points(n, 1, 22);
        let kernel = RbfKernel::new(0.6).unwrap();
        let mut factor = PivotedFactor::new(y.view(), 8, 1e-12);
        while !factor.is_full() {
            factor.extend(x.view(), &kernel);
            let k = factor.rank();
            let q = factor.basis();
            let eye = Array2::<f64>::eye(k);
            assert!(max_abs_diff(q.t().dot(&q).view(), eye.view()) < 1e-10);

            let r = q.t().dot(&factor.factor());
            let rrt = r.dot(&r.t());
            let product = factor.inverse_gram().dot(&rrt);
            assert!(
                max_abs_diff(product.view(), eye.view()) < 1e-8,
                "RR is not (R Rᵀ)⁻¹ at rank {k}"
            );
        }
    }

    #[test]
    fn full_rank_coefficients_interpolate_the_targets() {
        let n = 10;
        let x = random_points(n, 2, 5);
        let y = random_points(n, 2, 6);
        let factor = run(&x, &y, n, 0.5);
        let alpha = factor.coefficients();
        let k = RbfKernel::new(0.5)
            .unwrap()
            .matrix(x.view(), x.view())
            .unwrap();
        let fitted = k.dot(&alpha);
        assert!(max_abs_diff(fitted.view(), y.view()) < 1e-6);
    }

    #[test]
    fn decomposition_is_deterministic() {
        let x = random_points(18, 4, 9);
        let y = random_points(18, 1, 10);
        let first = run(&x, &y, 7, 0.9);
        let second = run(&x, &y, 7, 0.9);
        assert_eq!(first.pivots(), second.pivots());
        assert_eq!(first.factor(), second.factor());
        assert_eq!(first.coefficients(), second.coefficients());
    }

    #[test]
    fn duplicate_points_exhaust_the_residual() {
        let x = array![[0.0], [0.0], [1.0]];
        let y = array![[1.0], [1.0], [-1.0]];
        let kernel = RbfKernel::new(1.0).unwrap();
        let mut factor = PivotedFactor::new(y.view(), 3, 1e-12);
        assert!(matches!(factor.extend(x.view(), &kernel), Step::Extended { sample: 0, .. }));
        assert!(matches!(factor.extend(x.view(), &kernel), Step::Extended { sample: 2, .. }));
        match factor.extend(x.view(), &kernel) {
            Step::Exhausted { residual } => assert!(residual.abs() <= 1e-12),
            other => panic!("Expected exhaustion, got {other:?}"),
        }
        assert_eq!(factor.rank(), 2);
        assert!(factor.coefficients().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn collapsed_basis_column_leaves_the_factor_unchanged() {
        // the residual diagonal is still 1, but the NaN row poisons the
        // kernel column and with it the orthogonalized column norm
        let x = array![[0.0], [f64::NAN], [1.0]];
        let y = array![[1.0], [-1.0], [1.0]];
        let kernel = RbfKernel::new(1.0).unwrap();
        let mut factor = PivotedFactor::new(y.view(), 3, 1e-12);
        let before = factor.clone();

        match factor.extend(x.view(), &kernel) {
            Step::Exhausted { residual } => assert!(!residual.is_finite()),
            other => panic!("Expected exhaustion, got {other:?}"),
        }
        assert_eq!(factor.rank(), 0);
        assert_eq!(factor.pivots(), &[0, 1, 2]);
        assert_eq!(factor.factor(), before.factor());
        assert_eq!(factor.basis(), before.basis());
        assert_eq!(factor.inverse_gram(), before.inverse_gram());
        assert_eq!(factor.residual_diagonal(), before.residual_diagonal());
        assert_eq!(factor.permuted_targets(), before.permuted_targets());
    }
}
