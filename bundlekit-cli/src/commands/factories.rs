use std::path::{Path, PathBuf};

use anyhow::Result;
use bundlekit_plugin_api::plugin_id;
use clap::Args;

#[derive(Args)]
pub struct FactoriesArgs {
    /// Plugin bundle to query
    pub path: PathBuf,

    /// Type to look up: a UUID or any name (hashed to a stable id)
    #[arg(long = "type", value_name = "TYPE")]
    pub type_id: String,
}

/// List the factories a plugin registers for a type.
pub fn run(args: FactoriesArgs, config: Option<&Path>) -> Result<()> {
    let runtime = super::runtime(config)?;
    let bundle = super::open_bundle(&runtime, &args.path)?;
    let type_id = plugin_id(&args.type_id);

    let found = runtime
        .factories()
        .find_factories_for_type_in_plugin(type_id, &bundle);
    if found.is_empty() {
        println!("No factories in {} for type {type_id}", bundle.name());
        return Ok(());
    }
    for id in found {
        let symbol = runtime
            .factories()
            .factory(id)
            .and_then(|f| f.symbol_name())
            .unwrap_or_default();
        println!("{id}  {symbol}");
    }
    Ok(())
}
