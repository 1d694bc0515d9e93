//! CLI entry point for the Chimera hybrid kernel host.
//!
//! This binary provides the `chimera` command: `run` boots the simulated
//! modules and drives the scheduler, `status` prints configuration and the
//! computed module load order.

mod cli;
mod host;
mod simulated;

use anyhow::{Context, Result};
use chimera_kernel::{KernelConfig, ModuleManager};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing("info");

    let config = KernelConfig::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    match cli.command {
        Commands::Run {
            ticks,
            flaky_network,
        } => cmd_run(config, ticks, flaky_network).await,
        Commands::Status => cmd_status(config),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(config: KernelConfig, ticks: u32, flaky_network: bool) -> Result<()> {
    info!(ticks, "starting Chimera host");

    let summary = host::Host::boot(config, flaky_network)
        .await
        .context("module boot failed")?
        .run(ticks);

    println!();
    println!("  Chimera v{}", env!("CARGO_PKG_VERSION"));
    println!("  ==============");
    println!();
    println!("  Modules active:     {}/{}", summary.active_modules, summary.total_modules);
    if !summary.failed_modules.is_empty() {
        println!("  Modules failed:     {}", summary.failed_modules.join(", "));
    }
    println!("  Ticks executed:     {}", summary.ticks_executed);
    println!("  Tasks completed:    {}", summary.tasks_completed);
    println!("  Native selections:  {}", summary.stats.native_selections);
    println!("  Guest A selections: {}", summary.stats.guest_a_selections);
    println!("  Guest B selections: {}", summary.stats.guest_b_selections);
    println!("  Guest fallbacks:    {}", summary.stats.fallbacks);
    println!("  Final guest ratio:  {:.3}", summary.final_ratio);
    println!("  Timer interrupts:   {}", summary.timer_interrupts);
    if let Some(split) = summary.sample_allocation {
        println!(
            "  Sample CPU split:   guest A {:.2} / guest B {:.2}",
            split.guest_a_quota, split.guest_b_quota
        );
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

fn cmd_status(config: KernelConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(&config).context("failed to render configuration")?;

    println!();
    println!("  Chimera Status");
    println!("  ==============");
    println!();
    println!("  Effective configuration:");
    for line in rendered.lines() {
        println!("    {line}");
    }
    println!();

    let manager = ModuleManager::with_config(config.modules.clone(), None);
    for module in simulated::catalog(false) {
        manager.register_module(module);
    }

    match manager.load_order() {
        Ok(order) => {
            println!("  Module load order:");
            for (position, id) in order.iter().enumerate() {
                println!("    {:>2}. {id}", position + 1);
            }
        }
        Err(e) => println!("  Module load order:  UNAVAILABLE ({e})"),
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
