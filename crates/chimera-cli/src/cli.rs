//! CLI argument definitions for the Chimera host.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use chimera_kernel::config::DEFAULT_CONFIG_PATH;
use clap::{Parser, Subcommand};

/// Chimera -- hybrid kernel control plane host.
#[derive(Parser)]
#[command(
    name = "chimera",
    version,
    about = "Chimera -- hybrid kernel control plane host",
    long_about = "Drives the Chimera hybrid kernel: boots simulated driver and subsystem \
                  modules, then schedules native and guest-domain tasks."
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Boot the simulated modules and run the scheduling loop.
    Run {
        /// Number of scheduling ticks to execute.
        #[arg(long, short, default_value_t = 500)]
        ticks: u32,

        /// Make the network driver fail its first load.
        #[arg(long)]
        flaky_network: bool,
    },

    /// Show the effective configuration and the module load order.
    Status,
}
