use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

#[derive(Args)]
pub struct LoadArgs {
    /// Bundle to load
    pub path: PathBuf,

    /// Make the bundle's symbols visible to later loads
    #[arg(long)]
    pub global: bool,
}

/// Load a bundle, run its registration and list the factories it provides.
pub fn run(args: LoadArgs, config: Option<&Path>) -> Result<()> {
    let runtime = super::runtime(config)?;
    let bundle = super::open_bundle(&runtime, &args.path)?;
    let global = args.global || runtime.config().loader.force_global_symbols;

    bundle
        .load_with(global)
        .with_context(|| format!("Failed to load {}", bundle.location().display()))?;

    println!(
        "Loaded {} ({})",
        bundle.name(),
        bundle.identifier().unwrap_or("no identifier")
    );

    let Some(plugin) = bundle.plugin() else {
        return Ok(());
    };
    let factories = plugin.owned_factories();
    if factories.is_empty() {
        println!("No factories registered");
        return Ok(());
    }
    for factory in factories {
        let types = factory.supported_types();
        println!("  {}", factory.id());
        for ty in types {
            println!("    type {ty}");
        }
    }
    Ok(())
}
