//! The coordinator (spec §4.F): drives iterations, dispatches chunks to
//! the phi-worker pool, reduces their contributions, applies the global
//! lambda step, and owns the held-out reporting and stop rule.
//!
//! Per spec §9's row-partitioned ownership discipline, main-phase chunks
//! literally move gamma/Elog-theta rows out of [`StateStore`] via
//! [`StateStore::take_gamma_row`]/[`StateStore::take_elog_theta_row`] for
//! the duration of a dispatch — safe here because `get_subsample` only
//! ever includes individuals the sampled locus's `kv_ok` allows, so every
//! taken row round-trips through exactly one [`svi_sync::GammaUpdate`]
//! before the next dispatch. Init phase defers some individuals' updates
//! across locus changes (spec §4.E step 2), so its chunks carry cloned
//! snapshots instead — taking rows there would leave a zeroed row in
//! [`StateStore`] for as long as a worker holds the update pending.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use svi_data::GenotypeProvider;
use svi_heldout::{HeldoutConfig, HeldoutSets};
use svi_likelihood::{compute_likelihood, LikelihoodRow, StopReason, StopRule};
use svi_rng::Rng;
use svi_state::{Priors, StateStore};
use svi_sync::{Barrier, Chunk, GammaUpdate, IndivPayload, InQueue, OutQueue};
use svi_tensor::{abs_mean, sub};
use svi_worker::PhiWorker;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::output::{self, OutputPaths};

/// Fixed per spec §4.G: the stop rule never activates before iteration
/// 2000 regardless of configuration.
const STOP_RULE_MIN_ITER: u64 = 2000;

/// Why [`Coordinator::run`] returned.
#[derive(Debug, Clone, Copy)]
pub enum EngineOutcome {
    /// `terminate` was observed between iterations; state was checkpointed.
    Terminated { iter: u64 },
    /// The validation stop rule fired and `use_validation_stop` was set.
    Stopped { iter: u64, why: StopReason },
    /// `max_iterations` was reached (ambient test-tooling bound, not in spec §6).
    MaxIterationsReached { iter: u64 },
}

/// Drives the whole inference run: owns the authoritative [`StateStore`],
/// the coordinator-exclusive PRNG, the held-out sets, and the worker pool's
/// queues/barrier.
pub struct Coordinator {
    config: EngineConfig,
    data: Arc<dyn GenotypeProvider>,
    heldout: HeldoutSets,
    state: StateStore,
    rng: Rng,
    shuffled_nodes: Vec<u32>,
    out_q: OutQueue,
    in_q: InQueue,
    barrier: Arc<Barrier>,
    terminate: Arc<AtomicBool>,
    paths: OutputPaths,
    stop_rule: StopRule,
    iter: u64,
    threads_used: u64,
    start: Instant,
}

impl Coordinator {
    /// Builds the engine: validates `config`, seeds the PRNG, constructs
    /// the held-out sets and initial variational state, writes the
    /// held-out diagnostic files, and spawns the worker pool.
    pub fn new(
        config: EngineConfig,
        data: Arc<dyn GenotypeProvider>,
        out_dir: impl Into<PathBuf>,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::Configuration)?;

        let out_dir = out_dir.into();
        std::fs::create_dir_all(&out_dir).map_err(|source| EngineError::OutputIo {
            path: out_dir.display().to_string(),
            source,
        })?;

        let mut rng = match config.seed {
            Some(seed) => Rng::seeded(seed),
            None => Rng::from_entropy(),
        };

        let heldout_cfg = HeldoutConfig {
            validation_ratio: config.validation_ratio,
            test_ratio: config.test_ratio,
            simulation: config.simulation,
            use_test_set: config.use_test_set,
        };
        let heldout = HeldoutSets::build(data.as_ref(), &mut rng, heldout_cfg);

        let priors = Priors::new(config.k, config.alpha, config.eta0, config.eta1);
        let state = StateStore::new(
            config.n,
            config.l,
            config.k,
            config.t,
            priors,
            config.indiv_schedule(),
            config.loc_schedule(),
            &mut rng,
        );

        // Shuffled once at construction (spec §4.F's `get_subsample` scans
        // a *fixed* shuffled array from a random aligned offset; it is the
        // offset, not the array, that varies per call).
        let mut shuffled_nodes: Vec<u32> = (0..config.n as u32).collect();
        rng.shuffle(&mut shuffled_nodes);

        let queue_capacity = config.nthreads * 2 + 1;
        let out_q = OutQueue::bounded(queue_capacity);
        let in_q = InQueue::bounded(queue_capacity);
        let barrier = Barrier::new();

        for worker_id in 0..config.nthreads {
            let worker = PhiWorker::new(worker_id, config.k, config.t, Arc::clone(&data));
            let worker_out_q = out_q.clone();
            let worker_in_q = in_q.clone();
            let worker_barrier = Arc::clone(&barrier);
            thread::Builder::new()
                .name(format!("phi-worker-{worker_id}"))
                .spawn(move || svi_worker::run(worker, worker_out_q, worker_in_q, worker_barrier))
                .map_err(EngineError::ThreadSpawn)?;
        }

        let paths = OutputPaths::new(out_dir, config.file_suffix);
        output::write_lines(&paths.heldout_locs(), &heldout.heldout_locs_lines())?;
        output::write_lines(&paths.validation_locs(), &heldout.validation_locs_lines())?;
        output::write_lines(&paths.training_locs(), &heldout.training_locs_lines(config.l))?;

        let terminate = Arc::new(AtomicBool::new(false));

        Ok(Self {
            config,
            data,
            heldout,
            state,
            rng,
            shuffled_nodes,
            out_q,
            in_q,
            barrier,
            terminate,
            paths,
            stop_rule: StopRule::new(STOP_RULE_MIN_ITER),
            iter: 0,
            threads_used: 0,
            start: Instant::now(),
        })
    }

    /// A shared handle external callers (signal handlers, tests, the CLI)
    /// can set to request a clean stop between iterations (spec §5).
    pub fn terminate_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminate)
    }

    pub fn iter(&self) -> u64 {
        self.iter
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn heldout(&self) -> &HeldoutSets {
        &self.heldout
    }

    /// Runs to completion: one warm-start report, an optional init phase,
    /// then the main phase until a stop condition fires.
    pub fn run(&mut self) -> Result<EngineOutcome, EngineError> {
        self.warm_start_report()?;

        if self.config.init_phase {
            if let Some(outcome) = self.init_phase_loop()? {
                return Ok(outcome);
            }
        }

        loop {
            if self.terminate.load(Ordering::SeqCst) {
                self.checkpoint()?;
                return Ok(EngineOutcome::Terminated { iter: self.iter });
            }

            let locus = self.rng.uniform_int(self.data.l()) as u32;
            let sample = self.get_subsample(locus);
            if sample.is_empty() {
                // Sampling exhaustion (spec §7): no kv_ok individual found
                // for this locus in a full scan; resample next iteration.
                continue;
            }

            let chunks = self.partition_chunks(&sample);
            let lambda_acc = self.dispatch_and_reduce(locus, &chunks, false, false)?;
            self.apply_global_lambda_update(locus, &lambda_acc, sample.len(), false)?;

            self.iter += 1;

            if self.config.reportfreq > 0 && self.iter % self.config.reportfreq == 0 {
                if let Some(outcome) = self.periodic_report()? {
                    return Ok(outcome);
                }
            }

            if let Some(max_iter) = self.config.max_iterations {
                if self.iter >= max_iter {
                    self.checkpoint()?;
                    return Ok(EngineOutcome::MaxIterationsReached { iter: self.iter });
                }
            }
        }
    }

    /// Optional warm-start (spec §4.F / §9): a full per-locus coordinate
    /// ascent before any gamma update for that locus, run for a bounded
    /// number of outer steps (see `EngineConfig::init_phase_outer_steps`)
    /// before handing off to the main phase.
    fn init_phase_loop(&mut self) -> Result<Option<EngineOutcome>, EngineError> {
        let chunks = self.split_all_indivs();
        let outer_steps = self
            .config
            .init_phase_outer_steps
            .unwrap_or(self.data.l());

        for _ in 0..outer_steps {
            if self.terminate.load(Ordering::SeqCst) {
                self.checkpoint()?;
                return Ok(Some(EngineOutcome::Terminated { iter: self.iter }));
            }

            let locus = self.rng.uniform_int(self.data.l()) as u32;
            let mut x = 0usize;
            loop {
                let lambda_before = self.state.lambda().row(locus as usize).to_vec();
                let lambda_acc = self.dispatch_and_reduce(locus, &chunks, true, false)?;
                self.apply_global_lambda_update(locus, &lambda_acc, 1, true)?;

                let mut v = vec![0.0; lambda_before.len()];
                sub(locus as usize, self.state.lambda(), &lambda_before, &mut v);
                let change = abs_mean(&v);

                x += 1;
                if change < self.config.meanchangethresh || x >= self.config.online_iterations {
                    break;
                }
            }

            self.iter += 1;
            if self.config.reportfreq > 0 && self.iter % self.config.reportfreq == 0 {
                if let Some(outcome) = self.periodic_report()? {
                    return Ok(Some(outcome));
                }
            }
        }

        // No worker is left holding a deferred gamma update for the last
        // locus visited (spec §9's `force_flush`).
        let flush_chunks = vec![Vec::new(); self.config.nthreads];
        let _ = self.dispatch_and_reduce(0, &flush_chunks, true, true)?;

        Ok(None)
    }

    /// `get_subsample` (spec §4.F): scan the fixed shuffled node array
    /// from a random block-aligned offset, skipping individuals the
    /// sampled locus can't train on, until `indiv_sample_size` are found
    /// or a full pass of the array is exhausted.
    fn get_subsample(&mut self, locus: u32) -> Vec<u32> {
        let n = self.data.n();
        let sample_size = self.config.indiv_sample_size.min(n).max(1);

        let block = self.rng.uniform_int(n) / sample_size;
        let mut q = (block * sample_size) % n;

        let mut picked = Vec::with_capacity(sample_size);
        let mut scanned = 0usize;
        while picked.len() < sample_size && scanned < n {
            let candidate = self.shuffled_nodes[q];
            if self
                .state
                .kv_ok(self.data.as_ref(), &self.heldout, candidate as usize, locus as usize)
            {
                picked.push(candidate);
            }
            q = (q + 1) % n;
            scanned += 1;
        }
        picked
    }

    /// Partition a subsample into `nthreads` chunks of ~equal size, the
    /// last absorbing the remainder (spec §4.F step 3).
    fn partition_chunks(&self, sample: &[u32]) -> Vec<Vec<u32>> {
        let t = self.config.nthreads;
        let base = sample.len() / t;
        let mut chunks = Vec::with_capacity(t);
        let mut idx = 0usize;
        for i in 0..t {
            let len = if i == t - 1 { sample.len() - idx } else { base };
            chunks.push(sample[idx..idx + len].to_vec());
            idx += len;
        }
        chunks
    }

    /// Static partition of every individual across `nthreads` workers,
    /// used only by init phase (spec §4.F's `split_all_indivs`).
    fn split_all_indivs(&self) -> Vec<Vec<u32>> {
        let t = self.config.nthreads;
        let n = self.data.n();
        let chunk_size = (n / t).max(1);
        let mut chunks: Vec<Vec<u32>> = vec![Vec::new(); t];
        let mut tt = 0usize;
        let mut c = 0usize;
        for i in 0..n as u32 {
            chunks[tt].push(i);
            c += 1;
            if c >= chunk_size && tt < t - 1 {
                c = 0;
                tt += 1;
            }
        }
        chunks
    }

    /// Dispatches one round of chunks, blocks until all `chunks.len()`
    /// workers report back, applies every returned gamma update, and
    /// returns the summed local lambda accumulator for the caller to fold
    /// into the global lambda step. Advances the barrier exactly once,
    /// after every contribution has been reduced (spec §5's discipline).
    fn dispatch_and_reduce(
        &mut self,
        locus: u32,
        chunks: &[Vec<u32>],
        init_phase: bool,
        force_flush: bool,
    ) -> Result<Vec<f64>, EngineError> {
        let k = self.state.k();
        let t = self.config.t;
        let elog_beta_row = self.state.elog_beta().row(locus as usize).to_vec();
        let alpha = self.state.priors().alpha.clone();
        let indiv_schedule = self.config.indiv_schedule();

        self.barrier.notify();

        for chunk in chunks {
            let indivs = chunk
                .iter()
                .map(|&n| self.build_payload(n, init_phase))
                .collect();
            let msg = Chunk {
                locus,
                elog_beta_row: elog_beta_row.clone(),
                alpha: alpha.clone(),
                indiv_schedule,
                init_phase,
                force_flush,
                indivs,
            };
            self.out_q
                .push(msg)
                .map_err(|_| EngineError::WorkerPoolDisconnected("out_q send failed".into()))?;
        }

        let mut lambda_acc = vec![0.0; k * t];
        for _ in 0..chunks.len() {
            let result = self
                .in_q
                .pop()
                .map_err(|_| EngineError::WorkerPoolDisconnected("in_q recv failed".into()))?;
            for upd in result.gamma_updates {
                self.apply_gamma_update(upd);
            }
            for (acc, v) in lambda_acc.iter_mut().zip(result.lambda_acc) {
                *acc += v;
            }
            self.threads_used += 1;
        }

        self.barrier.advance();
        Ok(lambda_acc)
    }

    /// Builds one worker's input for individual `n`. Main-phase payloads
    /// literally move the row out of `StateStore` (see module docs);
    /// init-phase payloads clone it, since a deferred update can leave the
    /// row unreturned across a locus change.
    fn build_payload(&mut self, n: u32, init_phase: bool) -> IndivPayload {
        let c_indiv = self.state.c_indiv(n as usize);
        if init_phase {
            IndivPayload {
                id: n,
                gamma_row: self.state.gamma().row(n as usize).to_vec(),
                elog_theta_row: self.state.elog_theta().row(n as usize).to_vec(),
                c_indiv,
            }
        } else {
            IndivPayload {
                id: n,
                gamma_row: self.state.take_gamma_row(n as usize),
                elog_theta_row: self.state.take_elog_theta_row(n as usize),
                c_indiv,
            }
        }
    }

    fn apply_gamma_update(&mut self, upd: GammaUpdate) {
        self.state.put_gamma_row(upd.id as usize, upd.gamma_row);
        self.state.put_elog_theta_row(upd.id as usize, upd.elog_theta_row);
        self.state.set_etheta_row(upd.id as usize, &upd.etheta_row);
        self.state
            .set_counter_rho_indiv(upd.id as usize, upd.c_indiv, upd.rho_indiv);
    }

    /// Global `update_lambda` + `estimate_beta` (spec §4.F). `c_loc` is
    /// advanced unconditionally, matching the original: init phase's
    /// full M-step still counts as a lambda update for that locus even
    /// though it doesn't use `rho_loc`.
    fn apply_global_lambda_update(
        &mut self,
        locus: u32,
        lambda_acc: &[f64],
        sample_size: usize,
        init_phase: bool,
    ) -> Result<(), EngineError> {
        let k = self.state.k();
        let t = self.config.t;
        let (eta0, eta1) = self.state.priors().eta;
        let eta = [eta0, eta1];
        let scale = if init_phase {
            1.0
        } else {
            self.data.n() as f64 / sample_size as f64
        };

        self.state.update_rho_loc(locus as usize);
        let rho = self.state.rho_loc(locus as usize);

        let mut new_row = self.state.lambda().row(locus as usize).to_vec();
        for kk in 0..k {
            for tt in 0..t {
                let cur = new_row[kk * t + tt];
                let delta = eta[tt] + scale * lambda_acc[kk * t + tt] - cur;
                new_row[kk * t + tt] = if init_phase { cur + delta } else { cur + rho * delta };
            }
        }
        self.state.lambda_mut().set_row(locus as usize, &new_row);
        self.state
            .estimate_beta_row(locus as usize)
            .map_err(|detail| EngineError::NumericDegeneracy { where_: "estimate_beta_row", detail })
    }

    fn evaluate_likelihood(&self, validation: bool, elapsed_secs: f64) -> Result<LikelihoodRow, EngineError> {
        let etheta_row = |n: u32| self.state.etheta().row(n as usize).to_vec();
        let ebeta_row = |l: u32| self.state.ebeta().row(l as usize).to_vec();
        compute_likelihood(
            &self.heldout,
            validation,
            self.data.as_ref(),
            etheta_row,
            ebeta_row,
            self.iter,
            elapsed_secs,
        )
        .map_err(|detail| EngineError::NumericDegeneracy { where_: "compute_likelihood", detail })
    }

    /// Computed and logged once before the first iteration (spec §9 /
    /// `SPEC_FULL.md` §4 item 1): the original's initial held-out
    /// likelihood plus a pre-inference gamma/theta snapshot.
    fn warm_start_report(&mut self) -> Result<(), EngineError> {
        let elapsed = self.start.elapsed().as_secs_f64();
        let val_row = self.evaluate_likelihood(true, elapsed)?;
        output::append_likelihood_row(&self.paths.validation(), &val_row)?;
        if self.config.use_test_set {
            let test_row = self.evaluate_likelihood(false, elapsed)?;
            output::append_likelihood_row(&self.paths.test(), &test_row)?;
        }
        self.checkpoint()
    }

    /// `reportfreq`-gated likelihood computation plus a model save
    /// (`SPEC_FULL.md` §4 item 2), followed by the validation-only stop
    /// rule. Returns `Some(outcome)` when the run should end.
    fn periodic_report(&mut self) -> Result<Option<EngineOutcome>, EngineError> {
        let elapsed = self.start.elapsed().as_secs_f64();
        let val_row = self.evaluate_likelihood(true, elapsed)?;
        output::append_likelihood_row(&self.paths.validation(), &val_row)?;
        if self.config.use_test_set {
            let test_row = self.evaluate_likelihood(false, elapsed)?;
            output::append_likelihood_row(&self.paths.test(), &test_row)?;
        }

        let mean_threads_used = self.threads_used as f64 / self.iter.max(1) as f64;
        tracing::info!(
            target: "coordinator",
            iter = self.iter,
            elapsed_secs = elapsed,
            mean_threads_used,
            mean_validation_loglik = val_row.mean_loglik,
            "periodic_report"
        );

        self.checkpoint()?;

        if let Some(why) = self.stop_rule.observe(self.iter, val_row.mean_loglik) {
            // `train`/`val` mirror the original's own dead-code placeholders
            // (see DESIGN.md): `snpsamplingd.cc`'s stop-path never actually
            // recomputes them, it writes the commented-out `0`s it declared.
            output::write_max_row(
                &self.paths.max(),
                self.iter,
                elapsed,
                val_row.mean_loglik,
                0.0,
                0.0,
                self.stop_rule.max_h(),
                why as u8,
            )?;

            if self.config.use_validation_stop {
                self.checkpoint()?;
                return Ok(Some(EngineOutcome::Stopped { iter: self.iter, why }));
            }
        }

        Ok(None)
    }

    fn checkpoint(&self) -> Result<(), EngineError> {
        output::write_indiv_matrix(&self.paths.gamma(self.iter), self.state.gamma(), self.data.as_ref())?;
        output::write_indiv_matrix(&self.paths.theta(self.iter), self.state.etheta(), self.data.as_ref())?;
        if self.config.save_beta {
            output::write_beta(&self.paths.beta(self.iter), self.state.ebeta())?;
        }
        Ok(())
    }
}
