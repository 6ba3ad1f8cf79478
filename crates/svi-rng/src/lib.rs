//! Seedable PRNG used exclusively by the coordinator.
//!
//! Per the engine's concurrency model, only one thread ever samples:
//! workers are pure functions of the chunk they are handed. Keeping a
//! single owned `Rng` (rather than a shared/thread-local generator) is
//! what makes the `nthreads = 1` determinism property in spec §8 hold
//! without any extra bookkeeping.

use rand::{Rng as _, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Gamma};

/// A seedable uniform PRNG with Gamma and uniform-integer sampling.
pub struct Rng {
    inner: ChaCha8Rng,
}

impl Rng {
    /// Deterministic PRNG from a fixed seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Seed from OS entropy when no fixed seed was configured.
    pub fn from_entropy() -> Self {
        Self {
            inner: ChaCha8Rng::from_entropy(),
        }
    }

    /// `Gamma(shape, scale)` draw (`shape`, `scale` > 0).
    pub fn gamma(&mut self, shape: f64, scale: f64) -> f64 {
        debug_assert!(shape > 0.0 && scale > 0.0);
        let dist = Gamma::new(shape, scale).expect("gamma params must be positive");
        dist.sample(&mut self.inner)
    }

    /// Uniform integer in `[0, bound)`. `bound` must be > 0.
    pub fn uniform_int(&mut self, bound: usize) -> usize {
        debug_assert!(bound > 0);
        self.inner.gen_range(0..bound)
    }

    /// Uniform float in `[0, 1)`.
    pub fn uniform(&mut self) -> f64 {
        self.inner.gen_range(0.0..1.0)
    }

    /// Fisher-Yates shuffle in place.
    pub fn shuffle<T>(&mut self, slice: &mut [T]) {
        use rand::seq::SliceRandom;
        slice.shuffle(&mut self.inner);
    }
}
