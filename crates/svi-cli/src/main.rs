//! Entrypoint: loads configuration and a genotype matrix, then runs the
//! coordinator to completion.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

use svi_data::{simulate, GenotypeProvider, InMemoryGenotypes};
use svi_engine::{Coordinator, EngineOutcome};
use svi_rng::Rng;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "svi", version, about = "Parallel stochastic variational inference for admixture models")]
struct Args {
    /// Optional path to a whitespace-separated genotype matrix (one
    /// individual per row: `label g_0 g_1 ... g_{L-1}`, `g` in `{0,1,2,NA}`).
    /// Omit to run against a synthetic matrix (requires `simulation = true`
    /// plus `n`/`l`/`k` in the configuration).
    path: Option<PathBuf>,
    /// Optional configuration file path (overrides discovery of `svi.toml`).
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// Output directory for gamma/theta/beta snapshots and likelihood logs.
    #[arg(long = "out-dir", default_value = "svi-out")]
    out_dir: PathBuf,
}

struct AppStartup {
    log_guard: Option<WorkerGuard>,
}

impl AppStartup {
    fn new() -> Self {
        Self { log_guard: None }
    }

    fn configure_logging(&mut self) -> Result<()> {
        let log_dir = Path::new(".");
        let log_path = log_dir.join("svi.log");
        if log_path.exists() {
            let _ = fs::remove_file(&log_path);
        }

        let file_appender = tracing_appender::rolling::never(log_dir, "svi.log");
        let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
        match tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(nb_writer)
            .try_init()
        {
            Ok(()) => self.log_guard = Some(guard),
            Err(_) => {
                // Global subscriber already installed (e.g. under test harnesses).
            }
        }
        Ok(())
    }

    fn install_panic_hook() {
        static HOOK: Once = Once::new();
        HOOK.call_once(|| {
            let default_panic = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                tracing::error!(target: "runtime.panic", ?info, "panic");
                default_panic(info);
            }));
        });
    }
}

/// Parse a whitespace-separated genotype matrix: one row per individual,
/// first column a label, remaining columns genotype counts (`0`, `1`, `2`)
/// or `NA` for missing.
fn load_genotype_matrix(path: &Path) -> Result<InMemoryGenotypes> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading genotype matrix {}", path.display()))?;

    let mut labels = Vec::new();
    let mut rows: Vec<Vec<Option<u8>>> = Vec::new();
    let mut l = None;

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let label = fields
            .next()
            .with_context(|| format!("{}:{}: missing label column", path.display(), lineno + 1))?
            .to_string();

        let row: Vec<Option<u8>> = fields
            .map(|tok| match tok {
                "NA" | "na" | "-" => Ok(None),
                _ => tok
                    .parse::<u8>()
                    .map(Some)
                    .with_context(|| format!("{}:{}: invalid genotype token {tok:?}", path.display(), lineno + 1)),
            })
            .collect::<Result<_>>()?;

        match l {
            None => l = Some(row.len()),
            Some(expected) => anyhow::ensure!(
                row.len() == expected,
                "{}:{}: expected {} loci, found {}",
                path.display(),
                lineno + 1,
                expected,
                row.len()
            ),
        }
        labels.push(label);
        rows.push(row);
    }

    let n = rows.len();
    let l = l.unwrap_or(0);
    anyhow::ensure!(n > 0 && l > 0, "{}: genotype matrix is empty", path.display());

    let y: Vec<Option<u8>> = rows.into_iter().flatten().collect();
    Ok(InMemoryGenotypes::new(n, l, y, labels))
}

fn main() -> Result<()> {
    let mut startup = AppStartup::new();
    startup.configure_logging()?;
    AppStartup::install_panic_hook();

    let args = Args::parse();
    info!(target: "runtime", path = ?args.path, out_dir = %args.out_dir.display(), "startup");

    let mut config = svi_config::load_from(args.config.clone())?;

    let data: Arc<dyn GenotypeProvider> = if let Some(path) = args.path.as_ref() {
        let genotypes = load_genotype_matrix(path)?;
        config.n = genotypes.n();
        config.l = genotypes.l();
        Arc::new(genotypes)
    } else {
        anyhow::ensure!(
            config.simulation,
            "no genotype matrix given; set simulation = true in the configuration to run against synthetic data"
        );
        let mut rng = match config.seed {
            Some(seed) => Rng::seeded(seed),
            None => Rng::from_entropy(),
        };
        Arc::new(simulate(config.n, config.l, config.k, &mut rng))
    };

    let mut coordinator = Coordinator::new(config, data, args.out_dir.clone())?;
    let outcome = coordinator.run();

    match outcome {
        Ok(EngineOutcome::Terminated { iter }) => {
            info!(target: "runtime", iter, "terminated");
            Ok(())
        }
        Ok(EngineOutcome::Stopped { iter, why }) => {
            info!(target: "runtime", iter, why = ?why, "stopped");
            Ok(())
        }
        Ok(EngineOutcome::MaxIterationsReached { iter }) => {
            info!(target: "runtime", iter, "max_iterations_reached");
            Ok(())
        }
        Err(e) => {
            error!(target: "runtime", error = %e, "engine_error");
            Err(e.into())
        }
    }
}
