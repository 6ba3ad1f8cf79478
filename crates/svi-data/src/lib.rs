//! Read-only genotype access.
//!
//! `spec.md` §1 treats the genotype loader as an external collaborator:
//! this crate only defines the trait the engine programs against
//! ([`GenotypeProvider`]) plus two implementations that make the rest of
//! the workspace runnable without a real PLINK/VCF parser — a plain
//! in-memory matrix and a synthetic admixture-like generator used by
//! tests, benches, and `simulation = true` runs.

use svi_rng::Rng;

/// Read-only view over an N x L genotype matrix plus per-individual
/// labels and per-locus minor allele frequencies.
///
/// `maf` is part of the documented external interface (spec §6) purely
/// because an optional nonuniform subsampler could use it; this engine's
/// coordinator never calls it (see `SPEC_FULL.md` §4 item 6).
pub trait GenotypeProvider: Send + Sync {
    fn n(&self) -> usize;
    fn l(&self) -> usize;
    /// `None` marks a missing genotype; `Some(0|1|2)` is a valid count of
    /// the reference allele.
    fn get(&self, n: usize, l: usize) -> Option<u8>;
    fn maf(&self, l: usize) -> f64;
    fn label(&self, n: usize) -> &str;
}

/// Dense in-memory genotype matrix.
pub struct InMemoryGenotypes {
    n: usize,
    l: usize,
    y: Vec<Option<u8>>,
    labels: Vec<String>,
}

impl InMemoryGenotypes {
    /// `y` must be `n * l` long, row-major over (individual, locus).
    pub fn new(n: usize, l: usize, y: Vec<Option<u8>>, labels: Vec<String>) -> Self {
        assert_eq!(y.len(), n * l, "genotype buffer must be n*l long");
        assert_eq!(labels.len(), n, "one label per individual required");
        Self { n, l, y, labels }
    }

    fn maf_cache(&self, l: usize) -> f64 {
        let mut total = 0u32;
        let mut count = 0u32;
        for n in 0..self.n {
            if let Some(v) = self.get(n, l) {
                total += v as u32;
                count += 1;
            }
        }
        if count == 0 {
            return 0.0;
        }
        let freq = total as f64 / (2.0 * count as f64);
        freq.min(1.0 - freq)
    }
}

impl GenotypeProvider for InMemoryGenotypes {
    fn n(&self) -> usize {
        self.n
    }

    fn l(&self) -> usize {
        self.l
    }

    fn get(&self, n: usize, l: usize) -> Option<u8> {
        self.y[n * self.l + l]
    }

    fn maf(&self, l: usize) -> f64 {
        self.maf_cache(l)
    }

    fn label(&self, n: usize) -> &str {
        &self.labels[n]
    }
}

/// Draw a synthetic admixture-like genotype matrix: each individual gets
/// a Dirichlet-ish population mixture, each locus/population a random
/// allele frequency, and genotypes are drawn `Binomial(2, theta . beta)`.
/// Used by `simulation` mode, tests, and the tiny-fit scenario in spec §8.
pub fn simulate(n: usize, l: usize, k: usize, rng: &mut Rng) -> InMemoryGenotypes {
    let mut theta = vec![vec![0.0f64; k]; n];
    for row in theta.iter_mut() {
        for v in row.iter_mut() {
            *v = rng.gamma(1.0, 1.0).max(1e-6);
        }
        let s: f64 = row.iter().sum();
        row.iter_mut().for_each(|v| *v /= s);
    }

    let mut beta = vec![vec![0.0f64; k]; l];
    for row in beta.iter_mut() {
        for v in row.iter_mut() {
            *v = rng.uniform().clamp(0.01, 0.99);
        }
    }

    let mut y = vec![None; n * l];
    for ni in 0..n {
        for li in 0..l {
            let p: f64 = (0..k).map(|kk| theta[ni][kk] * beta[li][kk]).sum();
            let p = p.clamp(0.0, 1.0);
            let mut count = 0u8;
            for _ in 0..2 {
                if rng.uniform() < p {
                    count += 1;
                }
            }
            y[ni * l + li] = Some(count);
        }
    }

    let labels = (0..n).map(|i| format!("indiv_{i}")).collect();
    InMemoryGenotypes::new(n, l, y, labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_round_trips_values() {
        let y = vec![Some(0), Some(1), None, Some(2)];
        let data = InMemoryGenotypes::new(2, 2, y, vec!["a".into(), "b".into()]);
        assert_eq!(data.get(0, 0), Some(0));
        assert_eq!(data.get(0, 1), Some(1));
        assert_eq!(data.get(1, 0), None);
        assert_eq!(data.get(1, 1), Some(2));
        assert_eq!(data.label(0), "a");
    }

    #[test]
    fn maf_is_between_zero_and_half() {
        let y = vec![Some(2), Some(0), Some(1), Some(1)];
        let data = InMemoryGenotypes::new(4, 1, y, (0..4).map(|i| i.to_string()).collect());
        let maf = data.maf(0);
        assert!((0.0..=0.5).contains(&maf));
    }

    #[test]
    fn simulate_produces_valid_genotype_range() {
        let mut rng = Rng::seeded(11);
        let data = simulate(20, 30, 3, &mut rng);
        for n in 0..20 {
            for l in 0..30 {
                let v = data.get(n, l).expect("simulated data has no missing entries");
                assert!(v <= 2);
            }
        }
    }

    #[test]
    fn simulate_is_deterministic_for_a_fixed_seed() {
        let mut r1 = Rng::seeded(99);
        let mut r2 = Rng::seeded(99);
        let d1 = simulate(10, 10, 2, &mut r1);
        let d2 = simulate(10, 10, 2, &mut r2);
        for n in 0..10 {
            for l in 0..10 {
                assert_eq!(d1.get(n, l), d2.get(n, l));
            }
        }
    }
}
