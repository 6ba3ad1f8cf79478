//! Dense tensor kernels for the admixture SVI engine.
//!
//! Everything here is a thin, allocation-aware wrapper around `Vec<f64>`
//! rows. Matrices are stored row-major as one `Vec<f64>` per row (rather
//! than one flat buffer) so that a row can be moved out of its container
//! and handed to another thread by value — the ownership-transfer scheme
//! `svi-engine`/`svi-worker` use to partition writes to gamma/theta across
//! worker threads without a mutex.

mod digamma;

pub use digamma::digamma;

/// Dense N x K matrix, stored as one owned row per individual/locus.
#[derive(Debug, Clone)]
pub struct Matrix {
    rows: Vec<Vec<f64>>,
    k: usize,
}

impl Matrix {
    pub fn new(n: usize, k: usize) -> Self {
        Self {
            rows: vec![vec![0.0; k]; n],
            k,
        }
    }

    pub fn n(&self) -> usize {
        self.rows.len()
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn row(&self, n: usize) -> &[f64] {
        &self.rows[n]
    }

    pub fn row_mut(&mut self, n: usize) -> &mut [f64] {
        &mut self.rows[n]
    }

    pub fn rows_iter(&self) -> impl Iterator<Item = &[f64]> {
        self.rows.iter().map(|r| r.as_slice())
    }

    /// Set every entry of row `n` to `value`.
    pub fn fill_row(&mut self, n: usize, value: f64) {
        self.rows[n].iter_mut().for_each(|x| *x = value);
    }

    /// Overwrite row `n` with `values` (lengths must match).
    pub fn set_row(&mut self, n: usize, values: &[f64]) {
        debug_assert_eq!(values.len(), self.k);
        self.rows[n].copy_from_slice(values);
    }

    /// Move row `n` out, leaving a zeroed placeholder behind. Pairs with
    /// [`Matrix::put_row`] to hand exclusive ownership of one row to a
    /// worker thread for the duration of an iteration.
    pub fn take_row(&mut self, n: usize) -> Vec<f64> {
        std::mem::replace(&mut self.rows[n], vec![0.0; self.k])
    }

    /// Restore a row previously removed with [`Matrix::take_row`].
    pub fn put_row(&mut self, n: usize, row: Vec<f64>) {
        debug_assert_eq!(row.len(), self.k);
        self.rows[n] = row;
    }
}

/// Dense L x K x T tensor (T=2 for the biallelic Beta parameters).
/// Each locus row is stored flat as `k * t` contiguous entries, `(k, t)`
/// in row-major order: `row[k * t + t_idx]`.
#[derive(Debug, Clone)]
pub struct Tensor3 {
    rows: Vec<Vec<f64>>,
    k: usize,
    t: usize,
}

impl Tensor3 {
    pub fn new(l: usize, k: usize, t: usize) -> Self {
        Self {
            rows: vec![vec![0.0; k * t]; l],
            k,
            t,
        }
    }

    pub fn l(&self) -> usize {
        self.rows.len()
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn t(&self) -> usize {
        self.t
    }

    #[inline]
    pub fn get(&self, l: usize, k: usize, t: usize) -> f64 {
        self.rows[l][k * self.t + t]
    }

    #[inline]
    pub fn set(&mut self, l: usize, k: usize, t: usize, value: f64) {
        self.rows[l][k * self.t + t] = value;
    }

    /// Flat `(k, t)` view of locus `l`.
    pub fn row(&self, l: usize) -> &[f64] {
        &self.rows[l]
    }

    pub fn row_mut(&mut self, l: usize) -> &mut [f64] {
        &mut self.rows[l]
    }

    pub fn set_row(&mut self, l: usize, values: &[f64]) {
        debug_assert_eq!(values.len(), self.k * self.t);
        self.rows[l].copy_from_slice(values);
    }
}

/// `v <- exp(v - max(v)); v /= sum(v)`. Stable log-domain normalization of
/// a single simplex-valued vector (a K-length responsibility or posterior
/// row). Idempotent on inputs that are already a simplex.
pub fn lognormalize(v: &mut [f64]) {
    let max = v.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for x in v.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    for x in v.iter_mut() {
        *x /= sum;
    }
}

/// Dirichlet expected-log-weight for one row: `e[k] = psi(d[k]) - psi(sum(d))`.
pub fn set_dir_exp_row(d_row: &[f64], e_row: &mut [f64]) {
    debug_assert_eq!(d_row.len(), e_row.len());
    let sum: f64 = d_row.iter().sum();
    debug_assert!(sum > 0.0, "Dirichlet row sum must stay positive");
    let psi_sum = digamma(sum);
    for (e, &d) in e_row.iter_mut().zip(d_row) {
        debug_assert!(d > 0.0, "Dirichlet parameter must stay positive");
        *e = digamma(d) - psi_sum;
    }
}

/// Apply [`set_dir_exp_row`] to every row of a Dirichlet matrix (gamma ->
/// Elog theta).
pub fn set_dir_exp(d: &Matrix, e: &mut Matrix) {
    for n in 0..d.n() {
        set_dir_exp_row(d.row(n), e.row_mut(n));
    }
}

/// Beta two-parameter expected-log-weight for one locus row:
/// `e[k,t] = psi(lambda[k,t]) - psi(lambda[k,0] + lambda[k,1])`.
pub fn set_dir_exp_beta_row(l_row: &[f64], k: usize, t: usize, e_row: &mut [f64]) {
    debug_assert_eq!(l_row.len(), k * t);
    debug_assert_eq!(e_row.len(), k * t);
    for kk in 0..k {
        let mut s = 0.0;
        for tt in 0..t {
            s += l_row[kk * t + tt];
        }
        debug_assert!(s > 0.0, "Beta row sum must stay positive");
        let psi_sum = digamma(s);
        for tt in 0..t {
            let v = l_row[kk * t + tt];
            debug_assert!(v > 0.0, "Beta parameter must stay positive");
            e_row[kk * t + tt] = digamma(v) - psi_sum;
        }
    }
}

/// Apply [`set_dir_exp_beta_row`] to every locus of a lambda tensor
/// (lambda -> Elog beta).
pub fn set_dir_exp_beta(lambda: &Tensor3, elog: &mut Tensor3) {
    let (k, t) = (lambda.k(), lambda.t());
    for l in 0..lambda.l() {
        set_dir_exp_beta_row(lambda.row(l), k, t, elog.row_mut(l));
    }
}

/// `out <- a[loc, ·, ·] - b` where `b`/`out` are flat `k * t` rows.
pub fn sub(loc: usize, a: &Tensor3, b: &[f64], out: &mut [f64]) {
    let a_row = a.row(loc);
    debug_assert_eq!(a_row.len(), b.len());
    debug_assert_eq!(a_row.len(), out.len());
    for i in 0..out.len() {
        out[i] = a_row[i] - b[i];
    }
}

/// Mean absolute value across a flat buffer.
pub fn abs_mean(v: &[f64]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    v.iter().map(|x| x.abs()).sum::<f64>() / v.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lognormalize_produces_simplex() {
        let mut v = vec![1.0, 2.0, 3.0];
        lognormalize(&mut v);
        let sum: f64 = v.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(v.iter().all(|&x| x > 0.0));
    }

    #[test]
    fn lognormalize_is_idempotent_on_a_simplex() {
        let mut v = vec![0.2, 0.3, 0.5];
        let before = v.clone();
        // log-then-renormalize a vector that is already a simplex should
        // reproduce it (it is not a fixed point of the raw transform, but
        // applying it to its own log recovers the same simplex).
        let mut logged: Vec<f64> = before.iter().map(|x| x.ln()).collect();
        lognormalize(&mut logged);
        for (a, b) in logged.iter().zip(before.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn lognormalize_avoids_overflow_for_large_inputs() {
        let mut v = vec![1000.0, 1000.5, 999.0];
        lognormalize(&mut v);
        assert!(v.iter().all(|x| x.is_finite()));
        let sum: f64 = v.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn digamma_is_stable_across_wide_dynamic_range() {
        // K=2 gamma row with a very small and a very large value (spec 8.6).
        let d_row = [1e-4, 1e6];
        let mut e_row = [0.0; 2];
        set_dir_exp_row(&d_row, &mut e_row);
        assert!(e_row.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn set_dir_exp_rows_are_independent_of_processing_order() {
        let mut d = Matrix::new(3, 2);
        d.set_row(0, &[1.0, 2.0]);
        d.set_row(1, &[5.0, 0.5]);
        d.set_row(2, &[10.0, 10.0]);

        let mut e_forward = Matrix::new(3, 2);
        set_dir_exp(&d, &mut e_forward);

        // process rows out of order explicitly
        let mut e_shuffled = Matrix::new(3, 2);
        for &n in &[2usize, 0, 1] {
            set_dir_exp_row(d.row(n), e_shuffled.row_mut(n));
        }

        for n in 0..3 {
            for k in 0..2 {
                assert!((e_forward.row(n)[k] - e_shuffled.row(n)[k]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn take_row_then_put_row_round_trips() {
        let mut m = Matrix::new(2, 3);
        m.set_row(0, &[1.0, 2.0, 3.0]);
        let taken = m.take_row(0);
        assert_eq!(taken, vec![1.0, 2.0, 3.0]);
        assert_eq!(m.row(0), &[0.0, 0.0, 0.0]);
        m.put_row(0, taken);
        assert_eq!(m.row(0), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn set_dir_exp_beta_matches_two_parameter_form() {
        let mut lambda = Tensor3::new(1, 2, 2);
        lambda.set_row(0, &[3.0, 1.0, 2.0, 2.0]);
        let mut elog = Tensor3::new(1, 2, 2);
        set_dir_exp_beta(&lambda, &mut elog);
        let expected_k0_t0 = digamma(3.0) - digamma(4.0);
        assert!((elog.get(0, 0, 0) - expected_k0_t0).abs() < 1e-12);
    }

    #[test]
    fn sub_computes_elementwise_difference_against_flat_row() {
        let mut a = Tensor3::new(1, 2, 2);
        a.set_row(0, &[1.0, 2.0, 3.0, 4.0]);
        let b = [0.5, 0.5, 0.5, 0.5];
        let mut out = [0.0; 4];
        sub(0, &a, &b, &mut out);
        assert_eq!(out, [0.5, 1.5, 2.5, 3.5]);
    }

    #[test]
    fn abs_mean_of_empty_is_zero() {
        assert_eq!(abs_mean(&[]), 0.0);
    }
}
