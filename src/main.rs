mod cli;
mod cloud;
mod cluster_manager;
mod config;
mod ensure;
mod error;
mod job_manager;
mod kubectl;
mod manifest;
mod readiness;
mod stages;
#[cfg(test)]
mod testing;
mod utils;
mod volume_manager;

use clap::Parser;
use cli::Cli;
use tracing_subscriber::EnvFilter;
use utils::SystemRunner;

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    let config = cli.global.config();
    if let Err(e) = cli::run(cli.command, &config, &SystemRunner) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
