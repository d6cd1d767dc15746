//! Ensemble builder.
//!
//! Catalogs source files into virtual grids and builds state vector
//! ensembles from them.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use config::{EnsembleDesign, GridDescription};
use state_vector::Ensemble;
use virtual_grid::GridConfig;

#[derive(Parser, Debug)]
#[command(name = "ensemble-builder")]
#[command(about = "Build state vector ensembles from virtual grids")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Catalog source files described in YAML into a grid file
    Grid {
        /// Grid description (YAML)
        description: PathBuf,

        /// Output catalog (JSON)
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Build an ensemble from a state vector design
    Build {
        /// Ensemble design (YAML)
        design: PathBuf,

        /// Output ensemble store
        #[arg(short, long)]
        output: PathBuf,

        /// Override the number of members in the design
        #[arg(short, long)]
        members: Option<usize>,

        /// Override the random seed in the design
        #[arg(long, env = "ENSEMBLE_SEED")]
        seed: Option<u64>,
    },

    /// Summarise a saved ensemble
    Info {
        /// Ensemble store
        ensemble: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    // Grid loads and ensemble draws are blocking file I/O and rayon work
    match args.command {
        Command::Grid { description, output } => {
            tokio::task::spawn_blocking(move || catalog_grid(&description, &output)).await?
        }
        Command::Build {
            design,
            output,
            members,
            seed,
        } => {
            tokio::task::spawn_blocking(move || build_ensemble(&design, &output, members, seed))
                .await?
        }
        Command::Info { ensemble } => {
            tokio::task::spawn_blocking(move || describe_ensemble(&ensemble)).await?
        }
    }
}

/// Directory that relative paths in a YAML file resolve against.
fn base_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn catalog_grid(description: &Path, output: &Path) -> Result<()> {
    info!(description = %description.display(), "Cataloging grid");

    let desc = GridDescription::from_file(description)?;
    let mut grid = desc.into_grid(&base_dir(description), GridConfig::from_env())?;

    let gaps = grid.coverage_gaps();
    for (dim, indices) in &gaps {
        tracing::warn!(dim = %dim, uncovered = indices.len(), "Grid has indices no source covers");
    }

    grid.save(output)
        .with_context(|| format!("Failed to write catalog {}", output.display()))?;

    info!(
        catalog = %output.display(),
        dims = ?grid.dim_names(),
        shape = ?grid.size(),
        sources = grid.num_sources(),
        "Grid catalog written"
    );
    Ok(())
}

fn build_ensemble(
    design_path: &Path,
    output: &Path,
    members: Option<usize>,
    seed: Option<u64>,
) -> Result<()> {
    let design = EnsembleDesign::from_file(design_path)?;
    let mut sv = design.state_vector(&base_dir(design_path))?;

    let mut config = design.build_config();
    if seed.is_some() {
        config.seed = seed;
    }
    let members = members.unwrap_or(design.members);

    info!(
        design = %design_path.display(),
        variables = ?sv.variable_names(),
        coupled = ?sv.coupled_sets(),
        rows = sv.length(),
        members,
        "Building ensemble"
    );

    let ensemble = sv.build(members, &config)?;
    ensemble
        .save(output)
        .with_context(|| format!("Failed to write ensemble {}", output.display()))?;

    info!(
        ensemble = %output.display(),
        rows = ensemble.rows(),
        members = ensemble.members(),
        "Ensemble written"
    );
    Ok(())
}

fn describe_ensemble(path: &Path) -> Result<()> {
    let ensemble = Ensemble::load(path)
        .with_context(|| format!("Failed to read ensemble {}", path.display()))?;

    for var in &ensemble.metadata.variables {
        let missing = ensemble.metadata.has_nan[var.row_range()]
            .iter()
            .filter(|f| **f)
            .count();
        info!(
            variable = var.name(),
            rows = ?var.rows,
            state_shape = ?var.state_shape,
            missing_rows = missing,
            "Ensemble variable"
        );
    }

    info!(
        ensemble = %path.display(),
        rows = ensemble.rows(),
        members = ensemble.members(),
        coupled = ?ensemble.metadata.coupling,
        "Ensemble summary"
    );
    Ok(())
}
