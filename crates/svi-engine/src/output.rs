//! Output-file writers (spec §6): plain tab-separated text, one row per
//! entity, written the way the original's `save_gamma`/`save_beta`/
//! `compute_likelihood` do (fixed column order, no header row).

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use svi_data::GenotypeProvider;
use svi_likelihood::LikelihoodRow;
use svi_tensor::Matrix;

use crate::error::EngineError;

/// Resolves output file paths under a base directory, honoring the
/// `file_suffix` toggle (spec §6 / `SPEC_FULL.md` §4 item 3): when
/// enabled, `gamma`/`theta`/`beta` snapshots are named with the current
/// iteration embedded, matching the original's `add_iter_suffix`.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    dir: PathBuf,
    file_suffix: bool,
}

impl OutputPaths {
    pub fn new(dir: impl Into<PathBuf>, file_suffix: bool) -> Self {
        Self {
            dir: dir.into(),
            file_suffix,
        }
    }

    fn versioned(&self, stem: &str, iter: u64) -> PathBuf {
        if self.file_suffix {
            self.dir.join(format!("{stem}_{iter}.txt"))
        } else {
            self.dir.join(format!("{stem}.txt"))
        }
    }

    pub fn gamma(&self, iter: u64) -> PathBuf {
        self.versioned("gamma", iter)
    }

    pub fn theta(&self, iter: u64) -> PathBuf {
        self.versioned("theta", iter)
    }

    pub fn beta(&self, iter: u64) -> PathBuf {
        self.versioned("beta", iter)
    }

    pub fn validation(&self) -> PathBuf {
        self.dir.join("validation.txt")
    }

    pub fn test(&self) -> PathBuf {
        self.dir.join("test.txt")
    }

    pub fn max(&self) -> PathBuf {
        self.dir.join("max.txt")
    }

    pub fn heldout_locs(&self) -> PathBuf {
        self.dir.join("heldout-locs.txt")
    }

    pub fn validation_locs(&self) -> PathBuf {
        self.dir.join("validation-locs.txt")
    }

    pub fn training_locs(&self) -> PathBuf {
        self.dir.join("training-locs.txt")
    }
}

fn open_write(path: &Path) -> Result<BufWriter<File>, EngineError> {
    let f = File::create(path).map_err(|source| EngineError::OutputIo {
        path: path.display().to_string(),
        source,
    })?;
    Ok(BufWriter::new(f))
}

fn open_append(path: &Path) -> Result<BufWriter<File>, EngineError> {
    let f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| EngineError::OutputIo {
            path: path.display().to_string(),
            source,
        })?;
    Ok(BufWriter::new(f))
}

/// `n \t label \t v_0 \t ... \t v_{K-1} \t argmax_k v` per row, matching
/// `save_gamma`'s layout for both `gamma.txt` and `theta.txt`.
pub fn write_indiv_matrix(
    path: &Path,
    matrix: &Matrix,
    data: &dyn GenotypeProvider,
) -> Result<(), EngineError> {
    let mut w = open_write(path)?;
    for n in 0..matrix.n() {
        let row = matrix.row(n);
        let label = data.label(n);
        let label = if label.is_empty() { "unknown" } else { label };
        write!(w, "{n}\t{label}\t").map_err(|source| io_err(path, source))?;

        let mut max = f64::NEG_INFINITY;
        let mut max_k = 0usize;
        for (k, &v) in row.iter().enumerate() {
            write!(w, "{v:.8}\t").map_err(|source| io_err(path, source))?;
            if v > max {
                max = v;
                max_k = k;
            }
        }
        writeln!(w, "{max_k}").map_err(|source| io_err(path, source))?;
    }
    Ok(())
}

/// `l \t b_{l,0} \t ... \t b_{l,K-1}` per row, matching `save_beta`.
pub fn write_beta(path: &Path, ebeta: &Matrix) -> Result<(), EngineError> {
    let mut w = open_write(path)?;
    for l in 0..ebeta.n() {
        write!(w, "{l}\t").map_err(|source| io_err(path, source))?;
        for &v in ebeta.row(l) {
            write!(w, "{v:.8}\t").map_err(|source| io_err(path, source))?;
        }
        writeln!(w).map_err(|source| io_err(path, source))?;
    }
    Ok(())
}

/// Appends one `iter \t secs \t mean_loglik \t count \t exp(mean_loglik)`
/// row to `validation.txt`/`test.txt`.
pub fn append_likelihood_row(path: &Path, row: &LikelihoodRow) -> Result<(), EngineError> {
    let mut w = open_append(path)?;
    writeln!(
        w,
        "{}\t{:.9}\t{:.9}\t{}\t{:.9}",
        row.iter, row.elapsed_secs, row.mean_loglik, row.count, row.exp_mean_loglik
    )
    .map_err(|source| io_err(path, source))
}

/// Writes the single stop-rule summary row: `iter secs a train val max_h why`
/// (spec §6). `train`/`val` mirror the original's dead-code placeholders —
/// see `DESIGN.md` for why they are not independently recomputed here.
#[allow(clippy::too_many_arguments)]
pub fn write_max_row(
    path: &Path,
    iter: u64,
    elapsed_secs: f64,
    a: f64,
    train: f64,
    val: f64,
    max_h: f64,
    why: u8,
) -> Result<(), EngineError> {
    let mut w = open_write(path)?;
    writeln!(
        w,
        "{iter}\t{elapsed_secs:.0}\t{a:.5}\t{train:.5}\t{val:.5}\t{max_h:.5}\t{why}"
    )
    .map_err(|source| io_err(path, source))
}

/// Writes a flat list of lines to a file, one per line.
pub fn write_lines(path: &Path, lines: &[String]) -> Result<(), EngineError> {
    let mut w = open_write(path)?;
    for line in lines {
        writeln!(w, "{line}").map_err(|source| io_err(path, source))?;
    }
    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> EngineError {
    EngineError::OutputIo {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svi_data::InMemoryGenotypes;

    #[test]
    fn versioned_paths_embed_iter_only_when_enabled() {
        let paths = OutputPaths::new("/tmp/out", true);
        assert_eq!(paths.gamma(42), PathBuf::from("/tmp/out/gamma_42.txt"));
        let paths = OutputPaths::new("/tmp/out", false);
        assert_eq!(paths.gamma(42), PathBuf::from("/tmp/out/gamma.txt"));
    }

    #[test]
    fn write_indiv_matrix_round_trips_through_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gamma.txt");
        let mut m = Matrix::new(2, 3);
        m.set_row(0, &[0.1, 0.5, 0.4]);
        m.set_row(1, &[0.9, 0.05, 0.05]);
        let data = InMemoryGenotypes::new(
            2,
            1,
            vec![Some(0), Some(1)],
            vec!["alice".into(), String::new()],
        );
        write_indiv_matrix(&path, &m, &data).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0\talice\t"));
        assert!(lines[0].ends_with('1'), "row 0's argmax should be column 1");
        assert!(lines[1].starts_with("1\tunknown\t"));
    }

    #[test]
    fn write_beta_has_no_label_or_argmax_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beta.txt");
        let mut m = Matrix::new(1, 2);
        m.set_row(0, &[0.25, 0.75]);
        write_beta(&path, &m).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.starts_with("0\t0.25000000\t0.75000000"));
    }
}
