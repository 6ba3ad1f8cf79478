//! Held-out validation/test SNP sets.
//!
//! Built once at startup and never mutated afterwards. See `spec.md` §4.B
//! for the density rules this reproduces exactly.

use std::collections::{BTreeMap, HashSet};

use svi_data::GenotypeProvider;
use svi_rng::Rng;

type Kv = (u32, u32);

/// Recognized held-out construction knobs (subset of spec §6's option set).
#[derive(Debug, Clone, Copy)]
pub struct HeldoutConfig {
    pub validation_ratio: f64,
    pub test_ratio: f64,
    pub simulation: bool,
    pub use_test_set: bool,
}

/// Disjoint validation and test SNP sets plus the machinery to query them.
pub struct HeldoutSets {
    validation: HashSet<Kv>,
    test: HashSet<Kv>,
}

/// Safety cap on redraw attempts per locus so pathological inputs (too few
/// eligible individuals) fail loudly instead of looping forever; mirrors
/// the bounded-retry policy spec §7 mandates for subsample exhaustion.
const MAX_ATTEMPTS_PER_PICK: u32 = 1_000_000;

impl HeldoutSets {
    /// Build the test set (if enabled) then the validation set, in that
    /// order — matching the original's `init_heldout_sets`, which matters
    /// because each set's `kv_ok` excludes pairs already claimed by sets
    /// built earlier.
    pub fn build(data: &dyn GenotypeProvider, rng: &mut Rng, cfg: HeldoutConfig) -> Self {
        let mut test = HashSet::new();
        if cfg.use_test_set {
            let per_loc_h = (data.n() as f64 * cfg.test_ratio * 20.0) as usize;
            Self::fill_set(data, rng, cfg.test_ratio, per_loc_h, &[], &mut test);
        }

        let mut validation = HashSet::new();
        let per_loc_h = if data.n() <= 2000 || cfg.simulation {
            (data.n() as f64 * cfg.validation_ratio * 20.0) as usize
        } else {
            (data.n() as f64 * cfg.validation_ratio * 2.0) as usize
        };
        Self::fill_set(data, rng, cfg.validation_ratio, per_loc_h, &[&test], &mut validation);

        Self { validation, test }
    }

    fn fill_set(
        data: &dyn GenotypeProvider,
        rng: &mut Rng,
        loc_ratio: f64,
        per_loc_h: usize,
        excluded: &[&HashSet<Kv>],
        out: &mut HashSet<Kv>,
    ) {
        if per_loc_h == 0 {
            return;
        }
        let nlocs = ((data.l() as f64) * loc_ratio) as usize;
        let mut chosen_locs: HashSet<u32> = HashSet::new();
        let mut attempts = 0u32;
        while chosen_locs.len() < nlocs && attempts < MAX_ATTEMPTS_PER_PICK {
            attempts += 1;
            let loc = rng.uniform_int(data.l()) as u32;
            if !chosen_locs.insert(loc) {
                continue;
            }

            let mut picked = 0usize;
            let mut loc_attempts = 0u32;
            while picked < per_loc_h && loc_attempts < MAX_ATTEMPTS_PER_PICK {
                loc_attempts += 1;
                let indiv = rng.uniform_int(data.n()) as u32;
                if Self::kv_ok_against(data, excluded, out, indiv, loc) {
                    out.insert((indiv, loc));
                    picked += 1;
                }
            }
            if loc_attempts >= MAX_ATTEMPTS_PER_PICK {
                tracing::warn!(
                    target: "heldout",
                    locus = loc,
                    wanted = per_loc_h,
                    got = picked,
                    "heldout_locus_exhausted"
                );
            }
        }
    }

    fn kv_ok_against(
        data: &dyn GenotypeProvider,
        excluded: &[&HashSet<Kv>],
        building: &HashSet<Kv>,
        n: u32,
        l: u32,
    ) -> bool {
        if data.get(n as usize, l as usize).is_none() {
            return false;
        }
        if building.contains(&(n, l)) {
            return false;
        }
        excluded.iter().all(|set| !set.contains(&(n, l)))
    }

    /// `true` iff `(n, l)` holds a valid genotype and is not held out by
    /// either the validation or test set.
    pub fn kv_ok(&self, data: &dyn GenotypeProvider, n: u32, l: u32) -> bool {
        data.get(n as usize, l as usize).is_some()
            && !self.validation.contains(&(n, l))
            && !self.test.contains(&(n, l))
    }

    pub fn is_validation(&self, n: u32, l: u32) -> bool {
        self.validation.contains(&(n, l))
    }

    pub fn is_test(&self, n: u32, l: u32) -> bool {
        self.test.contains(&(n, l))
    }

    pub fn validation_set(&self) -> &HashSet<Kv> {
        &self.validation
    }

    pub fn test_set(&self) -> &HashSet<Kv> {
        &self.test
    }

    /// Group a held-out set's individuals by locus, as
    /// `compute_likelihood` needs (one `snp_likelihood` call per locus).
    ///
    /// Loci and, within each locus, individuals are returned in sorted
    /// order so that summing over them is deterministic regardless of the
    /// underlying `HashSet`'s iteration order.
    pub fn by_locus(&self, validation: bool) -> BTreeMap<u32, Vec<u32>> {
        let set = if validation { &self.validation } else { &self.test };
        let mut grouped: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for &(n, l) in set {
            grouped.entry(l).or_default().push(n);
        }
        for indivs in grouped.values_mut() {
            indivs.sort_unstable();
        }
        grouped
    }

    /// Per-SNP diagnostic rows: `individual\tlocus\tset`.
    pub fn heldout_locs_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .validation
            .iter()
            .map(|(n, l)| format!("{n}\t{l}\tvalidation"))
            .chain(self.test.iter().map(|(n, l)| format!("{n}\t{l}\ttest")))
            .collect();
        lines.sort();
        lines
    }

    /// Per-SNP validation rows: `individual\tlocus`.
    pub fn validation_locs_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> =
            self.validation.iter().map(|(n, l)| format!("{n}\t{l}")).collect();
        lines.sort();
        lines
    }

    /// Loci untouched by either held-out set.
    pub fn training_locs_lines(&self, l_total: usize) -> Vec<String> {
        let held: HashSet<u32> = self
            .validation
            .iter()
            .chain(self.test.iter())
            .map(|&(_, l)| l)
            .collect();
        (0..l_total as u32)
            .filter(|l| !held.contains(l))
            .map(|l| l.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svi_data::simulate;

    #[test]
    fn validation_and_test_are_disjoint_and_valid() {
        let mut rng = Rng::seeded(42);
        let data = simulate(1000, 10_000, 3, &mut rng);
        let cfg = HeldoutConfig {
            validation_ratio: 0.05,
            test_ratio: 0.05,
            simulation: false,
            use_test_set: true,
        };
        let sets = HeldoutSets::build(&data, &mut rng, cfg);

        for kv in sets.validation_set() {
            assert!(!sets.test_set().contains(kv), "validation/test must be disjoint");
            assert!(data.get(kv.0 as usize, kv.1 as usize).is_some());
        }
        for kv in sets.test_set() {
            assert!(data.get(kv.0 as usize, kv.1 as usize).is_some());
        }
    }

    #[test]
    fn validation_size_matches_documented_formula() {
        let mut rng = Rng::seeded(7);
        let n = 1000;
        let l = 10_000;
        let data = simulate(n, l, 3, &mut rng);
        let cfg = HeldoutConfig {
            validation_ratio: 0.05,
            test_ratio: 0.05,
            simulation: false,
            use_test_set: false,
        };
        let sets = HeldoutSets::build(&data, &mut rng, cfg);
        let nlocs = ((l as f64) * cfg.validation_ratio) as usize;
        let per_loc_h = (n as f64 * cfg.validation_ratio * 2.0) as usize;
        let expected = nlocs * per_loc_h;
        let actual = sets.validation_set().len();
        assert!(
            (actual as i64 - expected as i64).unsigned_abs() <= nlocs as u64,
            "expected ~{expected}, got {actual}"
        );
    }

    #[test]
    fn kv_ok_rejects_missing_and_held_out_pairs() {
        let y = vec![Some(1), None, Some(0), Some(2)];
        let data = svi_data::InMemoryGenotypes::new(2, 2, y, vec!["a".into(), "b".into()]);
        let mut rng = Rng::seeded(1);
        let cfg = HeldoutConfig {
            validation_ratio: 0.0,
            test_ratio: 0.0,
            simulation: false,
            use_test_set: false,
        };
        let sets = HeldoutSets::build(&data, &mut rng, cfg);
        assert!(sets.kv_ok(&data, 0, 0));
        assert!(!sets.kv_ok(&data, 0, 1)); // missing genotype
    }

    #[test]
    fn by_locus_groups_correctly() {
        let mut rng = Rng::seeded(3);
        let data = simulate(200, 500, 2, &mut rng);
        let cfg = HeldoutConfig {
            validation_ratio: 0.1,
            test_ratio: 0.0,
            simulation: true,
            use_test_set: false,
        };
        let sets = HeldoutSets::build(&data, &mut rng, cfg);
        let grouped = sets.by_locus(true);
        let total: usize = grouped.values().map(|v| v.len()).sum();
        assert_eq!(total, sets.validation_set().len());
    }
}
