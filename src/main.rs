use anyhow::Context;
use clap::Parser;
use env_logger::Builder;
use log::{info, LevelFilter};
use std::path::PathBuf;

use rust_ofdma_simulator::config::SimulationConfig;
use rust_ofdma_simulator::simulation::Simulator;

#[derive(Parser)]
#[command(name = "rust_ofdma_simulator")]
#[command(about = "Discrete-event simulator of the IEEE 802.11ax OFDMA MAC")]
#[command(version)]
struct Cli {
    /// TOML file with the run parameters; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Overrides the simulated time in microseconds
    #[arg(long)]
    sim_time: Option<f64>,

    /// Log every packet
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    Builder::new()
        .filter_level(LevelFilter::Warn)
        .filter(Some("rust_ofdma_simulator"), level)
        .parse_default_env()
        .init();

    let mut config = match &cli.config {
        Some(path) => SimulationConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SimulationConfig::default(),
    };
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(sim_time) = cli.sim_time {
        config.simulation_time = sim_time;
    }

    info!("App initialized. Starting simulation.");
    let mut simulator = Simulator::new(config)?;
    simulator.initialize();
    let summary = simulator.run()?;
    println!("{}", summary);
    Ok(())
}
