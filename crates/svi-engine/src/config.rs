use svi_state::RateSchedule;

/// The recognized option set from spec §6, plus the `init_phase` flag
/// resolved by Open Question #1 (`SPEC_FULL.md` §6).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub n: usize,
    pub l: usize,
    pub k: usize,
    pub t: usize,

    pub nthreads: usize,

    pub alpha: f64,
    pub eta0: f64,
    pub eta1: f64,

    /// Per-locus Robbins-Monro schedule.
    pub tau0: f64,
    pub kappa: f64,
    /// Per-individual Robbins-Monro schedule.
    pub nodetau0: f64,
    pub nodekappa: f64,

    pub validation_ratio: f64,
    pub test_ratio: f64,
    pub heldout_indiv_ratio: f64,
    pub simulation: bool,

    pub indiv_sample_size: usize,
    pub online_iterations: usize,
    pub meanchangethresh: f64,

    pub reportfreq: u64,
    pub use_test_set: bool,
    pub use_validation_stop: bool,
    pub save_beta: bool,
    pub file_suffix: bool,
    pub seed: Option<u64>,
    pub compute_logl: bool,

    /// Disabled by default; init phase is fully implemented but must be
    /// requested explicitly (spec §9's open question).
    pub init_phase: bool,
    /// Number of outer (per-locus warm-start) steps run before init phase
    /// hands off to the main phase. `None` defaults to one pass over `l`
    /// at runtime. Not part of spec §6's option set; the original never
    /// chains the two phases (see `DESIGN.md`), so this knob exists only
    /// to give the flag a concrete, testable stopping point.
    pub init_phase_outer_steps: Option<usize>,
    /// Hard iteration cap, ambient test-tooling addition absent from spec
    /// §6 (the original only stops via the validation rule or `terminate`).
    /// `None` runs until one of those two conditions fires.
    pub max_iterations: Option<u64>,
}

impl EngineConfig {
    pub fn loc_schedule(&self) -> RateSchedule {
        RateSchedule {
            tau0: self.tau0,
            kappa: self.kappa,
        }
    }

    pub fn indiv_schedule(&self) -> RateSchedule {
        RateSchedule {
            tau0: self.nodetau0,
            kappa: self.nodekappa,
        }
    }

    /// Basic shape/range checks (spec §7's "configuration errors").
    pub fn validate(&self) -> Result<(), String> {
        if self.k < 1 {
            return Err("k must be at least 1".into());
        }
        if self.n == 0 || self.l == 0 {
            return Err("n and l must be positive".into());
        }
        if self.t != 2 {
            return Err("t must be 2 (biallelic)".into());
        }
        if self.nthreads == 0 {
            return Err("nthreads must be at least 1".into());
        }
        if self.indiv_sample_size == 0 || self.indiv_sample_size > self.n {
            return Err("indiv_sample_size must be in 1..=n".into());
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n: 0,
            l: 0,
            k: 2,
            t: 2,
            nthreads: 4,
            alpha: 1.0,
            eta0: 1.0,
            eta1: 1.0,
            tau0: 1024.0,
            kappa: 0.5,
            nodetau0: 1.0,
            nodekappa: 0.5,
            validation_ratio: 0.01,
            test_ratio: 0.0,
            heldout_indiv_ratio: 5.0,
            simulation: false,
            indiv_sample_size: 100,
            online_iterations: 10,
            meanchangethresh: 1e-3,
            reportfreq: 100,
            use_test_set: false,
            use_validation_stop: true,
            save_beta: true,
            file_suffix: false,
            seed: None,
            compute_logl: true,
            init_phase: false,
            init_phase_outer_steps: None,
            max_iterations: None,
        }
    }
}
