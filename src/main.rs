// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Arc::new(solva_config::load(cli.config.as_deref())?);

    match cli.command {
        Commands::Serve => solva_server::serve(config).await,
        Commands::Worker => solva_agents::supervisor::run(cli.config.clone()).await,
        Commands::Agent { role } => solva_agents::run_worker_role(&role, &config).await,
        Commands::ShowConfig => {
            println!(
                "{}",
                serde_yaml::to_string(config.as_ref()).unwrap_or_default()
            );
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}
