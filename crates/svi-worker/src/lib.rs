//! The phi-worker thread body (spec §4.E).
//!
//! A worker never touches the coordinator's `Matrix`/`Tensor3` storage
//! directly: every row it needs arrives inside a [`svi_sync::Chunk`] and
//! every row it produces leaves inside a [`svi_sync::ChunkResult`]. The
//! only thing a worker reads directly is the (read-only, `Send + Sync`)
//! genotype provider.

use std::sync::Arc;

use svi_data::GenotypeProvider;
use svi_sync::{Barrier, Chunk, ChunkResult, GammaUpdate, IndivPayload, InQueue, OutQueue};
use svi_state::RateSchedule;
use svi_tensor::{lognormalize, set_dir_exp_row};

struct PendingIndiv {
    id: u32,
    gamma_row: Vec<f64>,
    c_indiv: u64,
    phimom_row: Vec<f64>,
    phidad_row: Vec<f64>,
}

/// Per-thread worker state: retains just enough from the previous chunk
/// to perform the init-phase deferred gamma update described in spec
/// §4.E step 2.
pub struct PhiWorker {
    id: usize,
    k: usize,
    t: usize,
    data: Arc<dyn GenotypeProvider>,
    last_locus: Option<u32>,
    pending_locus: Option<u32>,
    pending: Vec<PendingIndiv>,
    pending_schedule: Option<RateSchedule>,
    pending_alpha: Vec<f64>,
}

impl PhiWorker {
    pub fn new(id: usize, k: usize, t: usize, data: Arc<dyn GenotypeProvider>) -> Self {
        Self {
            id,
            k,
            t,
            data,
            last_locus: None,
            pending_locus: None,
            pending: Vec::new(),
            pending_schedule: None,
            pending_alpha: Vec::new(),
        }
    }

    /// Process one chunk, returning the report the coordinator reduces.
    /// Pure and deterministic given the chunk's contents and the worker's
    /// own retained state — exercised directly (no threads) in the tests
    /// below.
    pub fn process_chunk(&mut self, chunk: Chunk) -> ChunkResult {
        let locus_changed = chunk.force_flush || self.last_locus.is_some_and(|l| l != chunk.locus);
        let mut gamma_updates = Vec::new();

        if locus_changed && !self.pending.is_empty() {
            let old_locus = self.pending_locus.expect("pending set implies pending_locus");
            let schedule = self
                .pending_schedule
                .expect("pending set implies pending_schedule");
            let alpha = std::mem::take(&mut self.pending_alpha);
            let l_total = self.data.l() as f64;

            for p in self.pending.drain(..) {
                let Some(y) = self.data.get(p.id as usize, old_locus as usize) else {
                    continue;
                };
                gamma_updates.push(update_gamma_row(
                    p.id,
                    &p.gamma_row,
                    p.c_indiv,
                    schedule,
                    &alpha,
                    l_total,
                    y as f64,
                    &p.phimom_row,
                    &p.phidad_row,
                ));
            }
        }

        let mut lambda_acc = vec![0.0; self.k * self.t];
        let l_total = self.data.l() as f64;

        for payload in &chunk.indivs {
            let Some(y) = self.data.get(payload.id as usize, chunk.locus as usize) else {
                continue;
            };
            let y = y as f64;

            let mut phimom_row = vec![0.0; self.k];
            let mut phidad_row = vec![0.0; self.k];
            for kk in 0..self.k {
                phimom_row[kk] = payload.elog_theta_row[kk] + chunk.elog_beta_row[kk * self.t];
                phidad_row[kk] = payload.elog_theta_row[kk] + chunk.elog_beta_row[kk * self.t + 1];
            }
            lognormalize(&mut phimom_row);
            lognormalize(&mut phidad_row);

            for kk in 0..self.k {
                lambda_acc[kk * self.t] += phimom_row[kk] * y;
                lambda_acc[kk * self.t + 1] += phidad_row[kk] * (2.0 - y);
            }

            if chunk.init_phase {
                self.pending.push(PendingIndiv {
                    id: payload.id,
                    gamma_row: payload.gamma_row.clone(),
                    c_indiv: payload.c_indiv,
                    phimom_row,
                    phidad_row,
                });
            } else {
                gamma_updates.push(update_gamma_row(
                    payload.id,
                    &payload.gamma_row,
                    payload.c_indiv,
                    chunk.indiv_schedule,
                    &chunk.alpha,
                    l_total,
                    y,
                    &phimom_row,
                    &phidad_row,
                ));
            }
        }

        if chunk.init_phase {
            self.pending_locus = Some(chunk.locus);
            self.pending_schedule = Some(chunk.indiv_schedule);
            self.pending_alpha = chunk.alpha.clone();
        }
        self.last_locus = Some(chunk.locus);

        ChunkResult {
            worker_id: self.id,
            gamma_updates,
            lambda_acc,
        }
    }
}

/// `gamma_nk <- gamma_nk + rho_n * (alpha_k + L * (y*phimom_k + (2-y)*phidad_k) - gamma_nk)`,
/// after advancing the individual's step counter (spec §4.E's
/// `update_gamma`/`update_rho_indiv`).
fn update_gamma_row(
    id: u32,
    gamma_row: &[f64],
    c_indiv: u64,
    schedule: RateSchedule,
    alpha: &[f64],
    l_total: f64,
    y: f64,
    phimom_row: &[f64],
    phidad_row: &[f64],
) -> GammaUpdate {
    let new_c = c_indiv + 1;
    let rho = schedule.rho(new_c);
    let k = gamma_row.len();

    let mut new_gamma = vec![0.0; k];
    for kk in 0..k {
        let target = alpha[kk] + l_total * (y * phimom_row[kk] + (2.0 - y) * phidad_row[kk]);
        new_gamma[kk] = gamma_row[kk] + rho * (target - gamma_row[kk]);
    }

    let mut new_elog_theta = vec![0.0; k];
    set_dir_exp_row(&new_gamma, &mut new_elog_theta);

    let sum: f64 = new_gamma.iter().sum();
    debug_assert!(sum > 0.0, "gamma row sum must stay positive after update");
    let new_etheta: Vec<f64> = new_gamma.iter().map(|g| g / sum).collect();

    GammaUpdate {
        id,
        gamma_row: new_gamma,
        elog_theta_row: new_elog_theta,
        etheta_row: new_etheta,
        c_indiv: new_c,
        rho_indiv: rho,
    }
}

/// The worker's long-lived loop: pop a chunk, process it, publish the
/// result, wait for the coordinator's barrier to advance. Returns when
/// `out_q`/`in_q` are disconnected (process shutdown).
pub fn run(mut worker: PhiWorker, out_q: OutQueue, in_q: InQueue, barrier: Arc<Barrier>) {
    loop {
        let observed = barrier.current();
        let chunk = match out_q.pop() {
            Ok(chunk) => chunk,
            Err(_) => return,
        };
        let result = worker.process_chunk(chunk);
        if in_q.push(result).is_err() {
            return;
        }
        barrier.wait_for_advance(observed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svi_data::InMemoryGenotypes;
    use svi_tensor::digamma;

    fn schedule() -> RateSchedule {
        RateSchedule {
            tau0: 1.0,
            kappa: 0.5,
        }
    }

    fn data_with(n: usize, l: usize, fill: u8) -> Arc<dyn GenotypeProvider> {
        let y = vec![Some(fill); n * l];
        let labels = (0..n).map(|i| i.to_string()).collect();
        Arc::new(InMemoryGenotypes::new(n, l, y, labels))
    }

    fn payload(id: u32, k: usize) -> IndivPayload {
        IndivPayload {
            id,
            gamma_row: vec![1.0; k],
            elog_theta_row: vec![digamma(1.0) - digamma(k as f64); k],
            c_indiv: 0,
        }
    }

    #[test]
    fn main_phase_chunk_returns_one_gamma_update_per_individual() {
        let k = 2;
        let data = data_with(3, 5, 1);
        let mut worker = PhiWorker::new(0, k, 2, data);
        let chunk = Chunk {
            locus: 0,
            elog_beta_row: vec![-0.1, -0.2, -0.3, -0.4],
            alpha: vec![1.0, 1.0],
            indiv_schedule: schedule(),
            init_phase: false,
            force_flush: false,
            indivs: vec![payload(0, k), payload(1, k)],
        };
        let result = worker.process_chunk(chunk);
        assert_eq!(result.gamma_updates.len(), 2);
        for upd in &result.gamma_updates {
            assert!(upd.gamma_row.iter().all(|&g| g > 0.0));
            assert_eq!(upd.c_indiv, 1);
        }
        assert_eq!(result.lambda_acc.len(), 4);
    }

    #[test]
    fn init_phase_defers_gamma_update_until_locus_changes() {
        let k = 2;
        let data = data_with(3, 5, 1);
        let mut worker = PhiWorker::new(0, k, 2, data);

        let chunk_locus0 = Chunk {
            locus: 0,
            elog_beta_row: vec![-0.1, -0.2, -0.3, -0.4],
            alpha: vec![1.0, 1.0],
            indiv_schedule: schedule(),
            init_phase: true,
            force_flush: false,
            indivs: vec![payload(0, k)],
        };
        let first = worker.process_chunk(chunk_locus0);
        assert!(first.gamma_updates.is_empty(), "no prior chunk to defer from");

        let chunk_locus0_again = Chunk {
            locus: 0,
            elog_beta_row: vec![-0.1, -0.2, -0.3, -0.4],
            alpha: vec![1.0, 1.0],
            indiv_schedule: schedule(),
            init_phase: true,
            force_flush: false,
            indivs: vec![payload(0, k)],
        };
        let second = worker.process_chunk(chunk_locus0_again);
        assert!(
            second.gamma_updates.is_empty(),
            "same locus must not trigger a deferred update"
        );

        let chunk_locus1 = Chunk {
            locus: 1,
            elog_beta_row: vec![-0.1, -0.2, -0.3, -0.4],
            alpha: vec![1.0, 1.0],
            indiv_schedule: schedule(),
            init_phase: true,
            force_flush: false,
            indivs: vec![payload(0, k)],
        };
        let third = worker.process_chunk(chunk_locus1);
        assert_eq!(
            third.gamma_updates.len(),
            1,
            "locus change must flush the deferred gamma update"
        );
    }

    #[test]
    fn missing_genotype_is_skipped_without_a_gamma_update() {
        let k = 2;
        let n = 3;
        let l = 5;
        let mut y = vec![Some(1u8); n * l];
        y[0] = None;
        let labels = (0..n).map(|i| i.to_string()).collect();
        let data: Arc<dyn GenotypeProvider> = Arc::new(InMemoryGenotypes::new(n, l, y, labels));
        let mut worker = PhiWorker::new(0, k, 2, data);
        let chunk = Chunk {
            locus: 0,
            elog_beta_row: vec![-0.1, -0.2, -0.3, -0.4],
            alpha: vec![1.0, 1.0],
            indiv_schedule: schedule(),
            init_phase: false,
            force_flush: false,
            indivs: vec![payload(0, k)],
        };
        let result = worker.process_chunk(chunk);
        assert!(result.gamma_updates.is_empty());
    }
}
