//! Headless runner: load a snapshot, advance it, write the result.

use anyhow::{bail, Context, Result};
use cellpond_snapshot::{
    export_statistics_csv, load_simulation, save_simulation, Serializer,
};
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cellpond", version, about = "Run a cellpond simulation headless")]
struct Args {
    /// Input snapshot file.
    #[arg(short = 'i', long = "input")]
    input: Option<PathBuf>,

    /// Output snapshot file.
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Number of timesteps to calculate.
    #[arg(short = 't', long = "timesteps", default_value_t = 1)]
    timesteps: u64,

    /// Optional CSV file for the statistics history of the run.
    #[arg(short = 's', long = "statistics")]
    statistics: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let Some(input) = args.input else {
        bail!("no input snapshot given (-i <file>)");
    };
    let Some(output) = args.output else {
        bail!("no output path given (-o <file>)");
    };

    let serialized = load_simulation(&input)
        .with_context(|| format!("reading snapshot {}", input.display()))?;
    let decoded = Serializer::deserialize(&serialized)
        .with_context(|| format!("decoding snapshot {}", input.display()))?;
    let mut controller =
        Serializer::build_controller(&decoded).context("restoring simulation state")?;

    info!(
        timesteps = args.timesteps,
        from_timestep = decoded.timestep,
        clusters = decoded.content.clusters.len(),
        particles = decoded.content.particles.len(),
        "simulation loaded"
    );

    let started = Instant::now();
    controller
        .calc_timesteps(args.timesteps)
        .context("advancing simulation")?;
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        timestep = controller.get_current_timestep(),
        "run finished"
    );

    let out = Serializer::serialize(&controller).context("serializing result")?;
    save_simulation(&output, &out)
        .with_context(|| format!("writing snapshot {}", output.display()))?;

    if let Some(stats_path) = args.statistics {
        export_statistics_csv(&stats_path, controller.get_statistics_history())
            .with_context(|| format!("writing statistics {}", stats_path.display()))?;
    }
    Ok(())
}
