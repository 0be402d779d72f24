use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use bundlekit_core::{Bundle, Runtime};
use clap::Args;
use serde::Serialize;

#[derive(Args)]
pub struct ScanArgs {
    /// Directory to scan; defaults to the configured search paths
    pub dir: Option<PathBuf>,

    /// Only consider entries with this extension
    #[arg(long, short)]
    pub extension: Option<String>,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct ScanEntry {
    pub location: PathBuf,
    pub identifier: Option<String>,
    pub version: u32,
    pub packaged: bool,
    pub plugin: bool,
}

impl ScanEntry {
    fn new(runtime: &Runtime, bundle: &Arc<Bundle>) -> Self {
        Self {
            location: bundle.location().to_path_buf(),
            identifier: bundle.identifier().map(str::to_string),
            version: bundle.version(),
            packaged: runtime.looks_like_bundle(bundle.location()),
            plugin: bundle.plugin().is_some(),
        }
    }
}

pub fn collect(runtime: &Runtime, dir: Option<&Path>, extension: Option<&str>) -> Vec<ScanEntry> {
    let bundles = match dir {
        Some(dir) => runtime.bundles_in_directory(dir, extension),
        None => runtime.discover(),
    };
    bundles.iter().map(|bundle| ScanEntry::new(runtime, bundle)).collect()
}

/// Register and list the bundles in a directory.
pub fn run(args: ScanArgs, config: Option<&Path>) -> Result<()> {
    let runtime = super::runtime(config)?;
    let entries = collect(&runtime, args.dir.as_deref(), args.extension.as_deref());

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No bundles found");
        return Ok(());
    }
    for entry in &entries {
        let mut flags = Vec::new();
        if entry.packaged {
            flags.push("packaged");
        }
        if entry.plugin {
            flags.push("plugin");
        }
        println!(
            "{:<40} {} [{}]",
            entry.identifier.as_deref().unwrap_or("-"),
            entry.location.display(),
            flags.join(",")
        );
    }
    Ok(())
}
