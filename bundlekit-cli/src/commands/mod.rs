//! CLI subcommands

pub mod config;
pub mod factories;
pub mod inspect;
pub mod load;
pub mod preflight;
pub mod scan;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use bundlekit_core::{Bundle, ConfigLoader, Runtime, RuntimeConfig};

/// Effective configuration: `path` alone if given, else the layered files.
pub fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => ConfigLoader::load_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => ConfigLoader::load().context("Failed to load configuration"),
    }
}

pub fn runtime(config: Option<&Path>) -> Result<Runtime> {
    Ok(Runtime::new(load_config(config)?))
}

/// Registered bundle at `path`, or an error naming the path.
pub fn open_bundle(runtime: &Runtime, path: &Path) -> Result<Arc<Bundle>> {
    runtime
        .bundle_with_path(path)
        .with_context(|| format!("No bundle at {}", path.display()))
}
