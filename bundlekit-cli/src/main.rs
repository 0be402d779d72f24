use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "bundlekit", about = "Inspect, load and check plugin bundles")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of the user and project layers
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show configuration
    Config(commands::config::ConfigArgs),
    /// List factories a bundle provides for a type
    Factories(commands::factories::FactoriesArgs),
    /// Show what a bundle looks like on disk
    Inspect(commands::inspect::InspectArgs),
    /// Load a bundle and list the factories it registered
    Load(commands::load::LoadArgs),
    /// Check whether a bundle could be loaded
    Preflight(commands::preflight::PreflightArgs),
    /// List bundles in a directory
    Scan(commands::scan::ScanArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Config(args) => commands::config::run(args, config),
        Commands::Factories(args) => commands::factories::run(args, config),
        Commands::Inspect(args) => commands::inspect::run(args, config),
        Commands::Load(args) => commands::load::run(args, config),
        Commands::Preflight(args) => commands::preflight::run(args, config),
        Commands::Scan(args) => commands::scan::run(args, config),
    }
}
