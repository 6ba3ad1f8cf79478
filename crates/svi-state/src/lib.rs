//! Owns the variational parameters, their derived views, and the
//! per-individual/per-locus learning-rate schedules.
//!
//! Everything here is single-owner state: the coordinator mutates `lambda`
//! globally, workers mutate `gamma` one row at a time under the
//! ownership-transfer discipline `svi-tensor::Matrix::take_row`/`put_row`
//! provides. Nothing in this crate takes a lock.

use svi_data::GenotypeProvider;
use svi_heldout::HeldoutSets;
use svi_rng::Rng;
use svi_tensor::{set_dir_exp, set_dir_exp_beta, Matrix, Tensor3};

/// Dirichlet/Beta priors, fixed after construction.
#[derive(Debug, Clone)]
pub struct Priors {
    /// Scalar Dirichlet prior broadcast to all K components of alpha.
    pub alpha: Vec<f64>,
    /// Beta prior, shared across loci/populations: `(eta0, eta1)`.
    pub eta: (f64, f64),
}

impl Priors {
    pub fn new(k: usize, alpha0: f64, eta0: f64, eta1: f64) -> Self {
        Self {
            alpha: vec![alpha0; k],
            eta: (eta0, eta1),
        }
    }
}

/// Robbins-Monro schedule parameters: `rho(c) = (tau0 + c) ^ (-kappa)`.
#[derive(Debug, Clone, Copy)]
pub struct RateSchedule {
    pub tau0: f64,
    pub kappa: f64,
}

impl RateSchedule {
    pub fn rho(&self, c: u64) -> f64 {
        (self.tau0 + c as f64).powf(-self.kappa)
    }
}

/// All mutable variational state: gamma/lambda, their Elog/normalized
/// derived views, and the two independent step-count schedules.
pub struct StateStore {
    k: usize,
    priors: Priors,
    indiv_schedule: RateSchedule,
    loc_schedule: RateSchedule,

    gamma: Matrix,
    lambda: Tensor3,
    elog_theta: Matrix,
    elog_beta: Tensor3,
    etheta: Matrix,
    ebeta: Matrix,

    c_indiv: Vec<u64>,
    c_loc: Vec<u64>,
    rho_indiv: Vec<f64>,
    rho_loc: Vec<f64>,
}

impl StateStore {
    /// Allocate and Gamma-initialize gamma/lambda per spec §4.C: `gamma_nk
    /// <- Gamma(100*v, 0.01)` with `v = 1` if `k < 100` else `100/k`, and
    /// `lambda_lkt <- eta_t + Gamma(100*v, 0.01)` with the same `v`.
    pub fn new(n: usize, l: usize, k: usize, t: usize, priors: Priors, indiv_schedule: RateSchedule, loc_schedule: RateSchedule, rng: &mut Rng) -> Self {
        let v = if k < 100 { 1.0 } else { 100.0 / k as f64 };

        let mut gamma = Matrix::new(n, k);
        for ni in 0..n {
            let row = gamma.row_mut(ni);
            for x in row.iter_mut() {
                *x = rng.gamma(100.0 * v, 0.01).max(1e-6);
            }
        }
        let mut elog_theta = Matrix::new(n, k);
        set_dir_exp(&gamma, &mut elog_theta);

        let mut lambda = Tensor3::new(l, k, t);
        for li in 0..l {
            let row = lambda.row_mut(li);
            for kk in 0..k {
                row[kk * t] = priors.eta.0 + rng.gamma(100.0 * v, 0.01).max(1e-6);
                if t > 1 {
                    row[kk * t + 1] = priors.eta.1 + rng.gamma(100.0 * v, 0.01).max(1e-6);
                }
            }
        }
        let mut elog_beta = Tensor3::new(l, k, t);
        set_dir_exp_beta(&lambda, &mut elog_beta);

        let mut etheta = Matrix::new(n, k);
        for ni in 0..n {
            Self::normalize_theta_row(gamma.row(ni), etheta.row_mut(ni));
        }
        let mut ebeta = Matrix::new(l, k);
        for li in 0..l {
            Self::normalize_beta_row(lambda.row(li), k, t, ebeta.row_mut(li));
        }

        Self {
            k,
            priors,
            indiv_schedule,
            loc_schedule,
            gamma,
            lambda,
            elog_theta,
            elog_beta,
            etheta,
            ebeta,
            c_indiv: vec![0; n],
            c_loc: vec![0; l],
            rho_indiv: vec![indiv_schedule.rho(0); n],
            rho_loc: vec![loc_schedule.rho(0); l],
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn priors(&self) -> &Priors {
        &self.priors
    }

    pub fn gamma(&self) -> &Matrix {
        &self.gamma
    }

    pub fn gamma_mut(&mut self) -> &mut Matrix {
        &mut self.gamma
    }

    pub fn lambda(&self) -> &Tensor3 {
        &self.lambda
    }

    pub fn lambda_mut(&mut self) -> &mut Tensor3 {
        &mut self.lambda
    }

    pub fn elog_theta(&self) -> &Matrix {
        &self.elog_theta
    }

    pub fn elog_theta_mut(&mut self) -> &mut Matrix {
        &mut self.elog_theta
    }

    pub fn elog_beta(&self) -> &Tensor3 {
        &self.elog_beta
    }

    pub fn etheta(&self) -> &Matrix {
        &self.etheta
    }

    pub fn ebeta(&self) -> &Matrix {
        &self.ebeta
    }

    pub fn c_indiv(&self, n: usize) -> u64 {
        self.c_indiv[n]
    }

    pub fn c_loc(&self, l: usize) -> u64 {
        self.c_loc[l]
    }

    pub fn rho_indiv(&self, n: usize) -> f64 {
        self.rho_indiv[n]
    }

    pub fn rho_loc(&self, l: usize) -> f64 {
        self.rho_loc[l]
    }

    /// Move gamma row `n` out to hand exclusive ownership to a worker
    /// thread for the duration of one chunk (spec §9's row-partitioned
    /// ownership discipline).
    pub fn take_gamma_row(&mut self, n: usize) -> Vec<f64> {
        self.gamma.take_row(n)
    }

    /// Restore a gamma row previously removed with [`StateStore::take_gamma_row`].
    pub fn put_gamma_row(&mut self, n: usize, row: Vec<f64>) {
        self.gamma.put_row(n, row);
    }

    pub fn take_elog_theta_row(&mut self, n: usize) -> Vec<f64> {
        self.elog_theta.take_row(n)
    }

    pub fn put_elog_theta_row(&mut self, n: usize, row: Vec<f64>) {
        self.elog_theta.set_row(n, &row);
    }

    pub fn set_etheta_row(&mut self, n: usize, row: &[f64]) {
        self.etheta.set_row(n, row);
    }

    /// Overwrite individual `n`'s step counter and rate directly, used
    /// when applying a worker's already-computed update.
    pub fn set_counter_rho_indiv(&mut self, n: usize, c_indiv: u64, rho_indiv: f64) {
        self.c_indiv[n] = c_indiv;
        self.rho_indiv[n] = rho_indiv;
    }

    /// Advance individual `n`'s step counter and recompute its rate.
    /// Must be called exactly once per gamma-row update (spec §3/§8.6).
    pub fn update_rho_indiv(&mut self, n: usize) {
        self.c_indiv[n] += 1;
        self.rho_indiv[n] = self.indiv_schedule.rho(self.c_indiv[n]);
    }

    /// Advance locus `l`'s step counter and recompute its rate.
    pub fn update_rho_loc(&mut self, l: usize) {
        self.c_loc[l] += 1;
        self.rho_loc[l] = self.loc_schedule.rho(self.c_loc[l]);
    }

    /// Recompute `etheta`/`elog_theta` row `n` from the current gamma row.
    /// Called by the worker owning `n` after every gamma update.
    pub fn estimate_theta_row(&mut self, n: usize) {
        let gamma_row = self.gamma.row(n).to_vec();
        svi_tensor::set_dir_exp_row(&gamma_row, self.elog_theta.row_mut(n));
        Self::normalize_theta_row(&gamma_row, self.etheta.row_mut(n));
    }

    fn normalize_theta_row(gamma_row: &[f64], etheta_row: &mut [f64]) {
        let sum: f64 = gamma_row.iter().sum();
        debug_assert!(sum > 0.0, "gamma row sum must stay positive");
        for (e, &g) in etheta_row.iter_mut().zip(gamma_row) {
            *e = g / sum;
        }
    }

    /// Recompute `ebeta`/`elog_beta` row `l` from the current lambda row
    /// (spec §4.F's `estimate_beta`). Runtime counterpart to
    /// `normalize_beta_row`'s init-time `debug_assert`: this path runs every
    /// iteration against data-dependent accumulations, so a degenerate row
    /// is reported as a typed error rather than silently dividing by zero.
    pub fn estimate_beta_row(&mut self, l: usize) -> Result<(), String> {
        let t = self.lambda.t();
        let lambda_row = self.lambda.row(l).to_vec();
        for (kk, chunk) in lambda_row.chunks(t).enumerate() {
            for (tt, &v) in chunk.iter().enumerate() {
                if !(v.is_finite() && v > 0.0) {
                    return Err(format!(
                        "lambda[locus={l}, population={kk}, allele_state={tt}] = {v} is not a positive finite value"
                    ));
                }
            }
        }
        svi_tensor::set_dir_exp_beta_row(&lambda_row, self.k, t, self.elog_beta.row_mut(l));
        Self::normalize_beta_row(&lambda_row, self.k, t, self.ebeta.row_mut(l));
        Ok(())
    }

    fn normalize_beta_row(lambda_row: &[f64], k: usize, t: usize, ebeta_row: &mut [f64]) {
        for kk in 0..k {
            let a = lambda_row[kk * t];
            let b = if t > 1 { lambda_row[kk * t + 1] } else { 0.0 };
            let s = a + b;
            debug_assert!(s > 0.0, "Beta row sum must stay positive");
            ebeta_row[kk] = a / s;
        }
    }

    /// `true` iff `(n, l)` is usable for training: not missing and not
    /// claimed by either held-out set.
    pub fn kv_ok(&self, data: &dyn GenotypeProvider, heldout: &HeldoutSets, n: usize, l: usize) -> bool {
        heldout.kv_ok(data, n as u32, l as u32)
    }
}

/// `digamma` re-exported for callers (e.g. `svi-likelihood`) that need it
/// without depending on `svi-tensor` directly.
pub use svi_tensor::digamma as psi;

#[cfg(test)]
mod tests {
    use super::*;
    use svi_data::InMemoryGenotypes;
    use svi_heldout::HeldoutConfig;

    fn priors(k: usize) -> Priors {
        Priors::new(k, 1.0, 1.0, 1.0)
    }

    fn schedules() -> (RateSchedule, RateSchedule) {
        (
            RateSchedule { tau0: 1.0, kappa: 0.5 },
            RateSchedule { tau0: 1.0, kappa: 0.7 },
        )
    }

    #[test]
    fn gamma_and_lambda_are_positive_after_init() {
        let mut rng = Rng::seeded(1);
        let (is, ls) = schedules();
        let store = StateStore::new(20, 30, 3, 2, priors(3), is, ls, &mut rng);
        for n in 0..20 {
            assert!(store.gamma().row(n).iter().all(|&x| x > 0.0));
        }
        for l in 0..30 {
            assert!(store.lambda().row(l).iter().all(|&x| x > 0.0));
        }
    }

    #[test]
    fn etheta_rows_sum_to_one() {
        let mut rng = Rng::seeded(2);
        let (is, ls) = schedules();
        let store = StateStore::new(10, 5, 4, 2, priors(4), is, ls, &mut rng);
        for n in 0..10 {
            let sum: f64 = store.etheta().row(n).iter().sum();
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn ebeta_values_are_in_unit_interval() {
        let mut rng = Rng::seeded(3);
        let (is, ls) = schedules();
        let store = StateStore::new(10, 5, 4, 2, priors(4), is, ls, &mut rng);
        for l in 0..5 {
            for &b in store.ebeta().row(l) {
                assert!(b > 0.0 && b < 1.0);
            }
        }
    }

    #[test]
    fn elog_theta_matches_digamma_formula() {
        let mut rng = Rng::seeded(4);
        let (is, ls) = schedules();
        let store = StateStore::new(5, 5, 3, 2, priors(3), is, ls, &mut rng);
        for n in 0..5 {
            let row = store.gamma().row(n);
            let sum: f64 = row.iter().sum();
            for k in 0..3 {
                let expected = psi(row[k]) - psi(sum);
                assert!((store.elog_theta().row(n)[k] - expected).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn counters_increment_exactly_once_per_call() {
        let mut rng = Rng::seeded(5);
        let (is, ls) = schedules();
        let mut store = StateStore::new(5, 5, 2, 2, priors(2), is, ls, &mut rng);
        assert_eq!(store.c_indiv(0), 0);
        store.update_rho_indiv(0);
        store.update_rho_indiv(0);
        assert_eq!(store.c_indiv(0), 2);
        assert_eq!(store.c_indiv(1), 0);
    }

    #[test]
    fn rho_is_monotonically_non_increasing() {
        let mut rng = Rng::seeded(6);
        let (is, ls) = schedules();
        let mut store = StateStore::new(3, 3, 2, 2, priors(2), is, ls, &mut rng);
        let mut prev = store.rho_indiv(0);
        for _ in 0..20 {
            store.update_rho_indiv(0);
            let next = store.rho_indiv(0);
            assert!(next <= prev);
            prev = next;
        }
    }

    #[test]
    fn kv_ok_delegates_to_heldout_set() {
        let y = vec![Some(1), Some(0), Some(2), Some(1)];
        let data = InMemoryGenotypes::new(2, 2, y, vec!["a".into(), "b".into()]);
        let mut rng = Rng::seeded(7);
        let heldout = HeldoutSets::build(
            &data,
            &mut rng,
            HeldoutConfig {
                validation_ratio: 0.0,
                test_ratio: 0.0,
                simulation: false,
                use_test_set: false,
            },
        );
        let (is, ls) = schedules();
        let store = StateStore::new(2, 2, 2, 2, priors(2), is, ls, &mut rng);
        assert!(store.kv_ok(&data, &heldout, 0, 0));
    }
}
