use std::path::Path;

use anyhow::{Result, bail};
use bundlekit_core::{ConfigLoader, RuntimeConfig};
use clap::{Args, Subcommand};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Print the user and project config locations
    Path,
    /// Write the default configuration to the user config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn run(args: ConfigArgs, config: Option<&Path>) -> Result<()> {
    match args.command {
        ConfigCommands::Show => show(config),
        ConfigCommands::Path => paths(),
        ConfigCommands::Init { force } => init(force),
    }
}

fn show(config: Option<&Path>) -> Result<()> {
    let config = super::load_config(config)?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn paths() -> Result<()> {
    for (label, path) in [
        ("user", ConfigLoader::user_config_path()),
        ("project", ConfigLoader::project_config_path()),
    ] {
        let marker = if path.exists() { "" } else { " (missing)" };
        println!("{label:<8} {}{marker}", path.display());
    }
    Ok(())
}

fn init(force: bool) -> Result<()> {
    let path = ConfigLoader::user_config_path();
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    ConfigLoader::save_to_path(&RuntimeConfig::default(), &path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
