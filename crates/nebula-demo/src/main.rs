//! Headless replication demo: one server and several loopback clients,
//! driven for a fixed number of ticks with the configured strategy,
//! visibility policy and prediction settings.

mod sim;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use nebula_config::{CliArgs, Config};
use tracing::{error, info};

use crate::sim::Simulation;

fn main() -> ExitCode {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = args
        .config
        .clone()
        .or_else(Config::default_dir)
        .unwrap_or_else(|| PathBuf::from("config"));

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    nebula_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let ticks = config.debug.demo_ticks;
    let mut simulation = match Simulation::new(config) {
        Ok(simulation) => simulation,
        Err(e) => {
            error!("failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    match simulation.run(ticks) {
        Ok(totals) => {
            info!(
                "finished {} ticks: {} items sent, {} packets dropped, {} rollbacks",
                totals.ticks, totals.items_sent, totals.dropped_packets, totals.rollbacks
            );
            simulation.log_client_stats();
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("simulation aborted: {e}");
            simulation.log_client_stats();
            ExitCode::FAILURE
        }
    }
}
