// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "solva",
    version,
    about = "Multi-agent orchestrator for an interactive math-tutoring service"
)]
pub struct Cli {
    /// Explicit config file (merged over the discovered layers)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (RUST_LOG still wins when set)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP orchestrator edge
    Serve,

    /// Supervise the five agent worker processes
    Worker,

    /// Run a single agent worker process (normally spawned by `worker`)
    Agent {
        /// classifier | improvement | generator | freetalker | observer
        role: String,
    },

    /// Print the merged configuration as YAML
    ShowConfig,
}
