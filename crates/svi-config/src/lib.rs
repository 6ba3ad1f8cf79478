//! TOML configuration loading for the SVI engine.
//!
//! Mirrors `core-config`'s resilience pattern: every field is optional in
//! the file and falls back to [`EngineConfig::default`]'s value, and a
//! missing or unparseable file silently yields defaults rather than
//! erroring (breadth-first resilience) — only a value present and
//! malformed inside an otherwise-valid TOML document is a hard error,
//! surfaced through `anyhow`.

use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use serde::Deserialize;
use svi_engine::EngineConfig;

/// The recognized option set from spec §6, every field optional so a
/// partial file only overrides what it mentions.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConfigFile {
    #[serde(default)]
    pub n: Option<usize>,
    #[serde(default)]
    pub l: Option<usize>,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub t: Option<usize>,

    #[serde(default)]
    pub nthreads: Option<usize>,

    #[serde(default)]
    pub alpha: Option<f64>,
    #[serde(default)]
    pub eta0: Option<f64>,
    #[serde(default)]
    pub eta1: Option<f64>,

    #[serde(default)]
    pub tau0: Option<f64>,
    #[serde(default)]
    pub kappa: Option<f64>,
    #[serde(default)]
    pub nodetau0: Option<f64>,
    #[serde(default)]
    pub nodekappa: Option<f64>,

    #[serde(default)]
    pub validation_ratio: Option<f64>,
    #[serde(default)]
    pub test_ratio: Option<f64>,
    #[serde(default)]
    pub heldout_indiv_ratio: Option<f64>,
    #[serde(default)]
    pub simulation: Option<bool>,

    #[serde(default)]
    pub indiv_sample_size: Option<usize>,
    #[serde(default)]
    pub online_iterations: Option<usize>,
    #[serde(default)]
    pub meanchangethresh: Option<f64>,

    #[serde(default)]
    pub reportfreq: Option<u64>,
    #[serde(default)]
    pub use_test_set: Option<bool>,
    #[serde(default)]
    pub use_validation_stop: Option<bool>,
    #[serde(default)]
    pub save_beta: Option<bool>,
    #[serde(default)]
    pub file_suffix: Option<bool>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub compute_logl: Option<bool>,

    #[serde(default)]
    pub init_phase: Option<bool>,
    #[serde(default)]
    pub init_phase_outer_steps: Option<usize>,
    #[serde(default)]
    pub max_iterations: Option<u64>,
}

impl ConfigFile {
    /// Overlay the parsed file onto the engine's defaults, field by field.
    pub fn into_engine_config(self) -> EngineConfig {
        let d = EngineConfig::default();
        EngineConfig {
            n: self.n.unwrap_or(d.n),
            l: self.l.unwrap_or(d.l),
            k: self.k.unwrap_or(d.k),
            t: self.t.unwrap_or(d.t),
            nthreads: self.nthreads.unwrap_or(d.nthreads),
            alpha: self.alpha.unwrap_or(d.alpha),
            eta0: self.eta0.unwrap_or(d.eta0),
            eta1: self.eta1.unwrap_or(d.eta1),
            tau0: self.tau0.unwrap_or(d.tau0),
            kappa: self.kappa.unwrap_or(d.kappa),
            nodetau0: self.nodetau0.unwrap_or(d.nodetau0),
            nodekappa: self.nodekappa.unwrap_or(d.nodekappa),
            validation_ratio: self.validation_ratio.unwrap_or(d.validation_ratio),
            test_ratio: self.test_ratio.unwrap_or(d.test_ratio),
            heldout_indiv_ratio: self.heldout_indiv_ratio.unwrap_or(d.heldout_indiv_ratio),
            simulation: self.simulation.unwrap_or(d.simulation),
            indiv_sample_size: self.indiv_sample_size.unwrap_or(d.indiv_sample_size),
            online_iterations: self.online_iterations.unwrap_or(d.online_iterations),
            meanchangethresh: self.meanchangethresh.unwrap_or(d.meanchangethresh),
            reportfreq: self.reportfreq.unwrap_or(d.reportfreq),
            use_test_set: self.use_test_set.unwrap_or(d.use_test_set),
            use_validation_stop: self.use_validation_stop.unwrap_or(d.use_validation_stop),
            save_beta: self.save_beta.unwrap_or(d.save_beta),
            file_suffix: self.file_suffix.unwrap_or(d.file_suffix),
            seed: self.seed.or(d.seed),
            compute_logl: self.compute_logl.unwrap_or(d.compute_logl),
            init_phase: self.init_phase.unwrap_or(d.init_phase),
            init_phase_outer_steps: self.init_phase_outer_steps.or(d.init_phase_outer_steps),
            max_iterations: self.max_iterations.or(d.max_iterations),
        }
    }
}

/// Best-effort config path: prefer `./svi.toml` in the working directory,
/// fall back to the platform config dir.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("svi.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("svi").join("svi.toml");
    }
    PathBuf::from("svi.toml")
}

/// Load an [`EngineConfig`] from `path` (or the discovered default path
/// when `None`). A missing file or one that fails to parse as TOML falls
/// back to [`EngineConfig::default`] silently; malformed values embedded
/// in an otherwise-valid document surface through the returned `Result`
/// via `serde`'s type errors re-wrapped by `toml`.
pub fn load_from(path: Option<PathBuf>) -> Result<EngineConfig> {
    let path = path.unwrap_or_else(discover);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(_) => {
            tracing::warn!(target: "config", path = %path.display(), "config_file_missing_using_defaults");
            return Ok(EngineConfig::default());
        }
    };

    match toml::from_str::<ConfigFile>(&content) {
        Ok(file) => Ok(file.into_engine_config()),
        // On parse error fall back to defaults (breadth-first resilience,
        // matching `core_config::load_from`).
        Err(e) => {
            tracing::warn!(target: "config", path = %path.display(), error = %e, "config_file_parse_error_using_defaults");
            Ok(EngineConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_when_file_missing() {
        let cfg = load_from(Some(PathBuf::from("__nonexistent_svi_config__.toml"))).unwrap();
        assert_eq!(cfg.k, EngineConfig::default().k);
    }

    #[test]
    fn default_config_on_parse_error() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "this is not valid toml = = =").unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.k, EngineConfig::default().k);
    }

    #[test]
    fn partial_file_only_overrides_mentioned_fields() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "k = 5\nnthreads = 8\n").unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.k, 5);
        assert_eq!(cfg.nthreads, 8);
        assert_eq!(cfg.alpha, EngineConfig::default().alpha);
    }

    #[test]
    fn full_option_set_parses() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            r#"
            n = 1000
            l = 20000
            k = 4
            t = 2
            nthreads = 16
            alpha = 0.5
            eta0 = 1.0
            eta1 = 1.0
            tau0 = 2048.0
            kappa = 0.6
            nodetau0 = 1.0
            nodekappa = 0.6
            validation_ratio = 0.02
            test_ratio = 0.01
            heldout_indiv_ratio = 5.0
            simulation = true
            indiv_sample_size = 200
            online_iterations = 20
            meanchangethresh = 0.0001
            reportfreq = 50
            use_test_set = true
            use_validation_stop = true
            save_beta = true
            file_suffix = true
            seed = 7
            compute_logl = true
            init_phase = true
            init_phase_outer_steps = 3
            max_iterations = 5000
            "#,
        )
        .unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.n, 1000);
        assert_eq!(cfg.k, 4);
        assert_eq!(cfg.seed, Some(7));
        assert_eq!(cfg.init_phase_outer_steps, Some(3));
        assert_eq!(cfg.max_iterations, Some(5000));
        assert!(cfg.validate().is_ok());
    }
}
