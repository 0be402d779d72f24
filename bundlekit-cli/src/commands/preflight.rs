use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::Args;

#[derive(Args)]
pub struct PreflightArgs {
    /// Bundle to check
    pub path: PathBuf,
}

/// Check that a bundle could be loaded, without loading it.
pub fn run(args: PreflightArgs, config: Option<&Path>) -> Result<()> {
    let runtime = super::runtime(config)?;
    let bundle = super::open_bundle(&runtime, &args.path)?;

    match bundle.preflight() {
        Ok(()) => {
            println!("{}: ok", bundle.name());
            Ok(())
        }
        Err(err) => {
            eprintln!("{}", err.description);
            if !err.reason.is_empty() {
                eprintln!("  reason:     {}", err.reason);
            }
            if !err.suggestion.is_empty() {
                eprintln!("  suggestion: {}", err.suggestion);
            }
            if let Some(detail) = &err.debug {
                tracing::debug!(detail = %detail, "Linker detail");
            }
            bail!("preflight failed ({} {})", err.domain(), err.code())
        }
    }
}
