//! Describe a bundle without loading it

use std::path::{Path, PathBuf};

use anyhow::Result;
use bundlekit_core::{BuiltinDir, Bundle};
use clap::Args;
use serde::Serialize;

#[derive(Args)]
pub struct InspectArgs {
    /// Bundle directory or single-file image
    pub path: PathBuf,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct BundleReport {
    pub location: PathBuf,
    pub name: String,
    pub identifier: Option<String>,
    pub version: Option<String>,
    pub layout: u8,
    pub effective_layout: u8,
    pub loaded: bool,
    pub executable: Option<PathBuf>,
    pub format: String,
    pub architectures: Vec<String>,
    pub resources_dir: Option<PathBuf>,
    pub plugins_dir: Option<PathBuf>,
    pub plugin: Option<PluginReport>,
}

#[derive(Debug, Serialize)]
pub struct PluginReport {
    pub dynamic_registration: bool,
    pub register_function: Option<String>,
    pub factories: Vec<FactoryEntry>,
    pub types: Vec<TypeEntry>,
}

#[derive(Debug, Serialize)]
pub struct FactoryEntry {
    pub id: String,
    pub symbol: String,
}

#[derive(Debug, Serialize)]
pub struct TypeEntry {
    pub id: String,
    pub factories: Vec<String>,
}

impl BundleReport {
    pub fn from_bundle(bundle: &Bundle) -> Self {
        let plugin = bundle.manifest().plugin().map(|declaration| PluginReport {
            dynamic_registration: declaration.dynamic_registration,
            register_function: declaration.register_function,
            factories: declaration
                .factories
                .into_iter()
                .map(|(id, symbol)| FactoryEntry {
                    id: id.to_string(),
                    symbol,
                })
                .collect(),
            types: declaration
                .types
                .into_iter()
                .map(|(id, factories)| TypeEntry {
                    id: id.to_string(),
                    factories: factories.iter().map(ToString::to_string).collect(),
                })
                .collect(),
        });
        Self {
            location: bundle.location().to_path_buf(),
            name: bundle.name(),
            identifier: bundle.identifier().map(str::to_string),
            version: bundle.manifest().version_string(),
            layout: bundle.layout_version().as_u8(),
            effective_layout: bundle.effective_layout_version().as_u8(),
            loaded: bundle.is_loaded(),
            executable: bundle.executable_path(),
            format: bundle.binary_format().to_string(),
            architectures: bundle.architectures().iter().map(ToString::to_string).collect(),
            resources_dir: bundle.resources_dir(),
            plugins_dir: bundle.builtin_dir(BuiltinDir::PlugIns),
            plugin,
        }
    }
}

fn show(path: &Option<PathBuf>) -> String {
    path.as_deref()
        .map(Path::display)
        .map(|d| d.to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn run(args: InspectArgs, config: Option<&Path>) -> Result<()> {
    let runtime = super::runtime(config)?;
    let bundle = super::open_bundle(&runtime, &args.path)?;
    let report = BundleReport::from_bundle(&bundle);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Location:      {}", report.location.display());
    println!("Name:          {}", report.name);
    println!("Identifier:    {}", report.identifier.as_deref().unwrap_or("-"));
    println!("Version:       {}", report.version.as_deref().unwrap_or("-"));
    println!("Layout:        {} (effective {})", report.layout, report.effective_layout);
    println!("Executable:    {}", show(&report.executable));
    println!("Format:        {}", report.format);
    if !report.architectures.is_empty() {
        println!("Architectures: {}", report.architectures.join(", "));
    }
    println!("Resources:     {}", show(&report.resources_dir));
    println!("Plug-ins:      {}", show(&report.plugins_dir));

    match &report.plugin {
        None => println!("Plugin:        no"),
        Some(plugin) => {
            println!(
                "Plugin:        yes{}",
                if plugin.dynamic_registration { " (dynamic registration)" } else { "" }
            );
            for factory in &plugin.factories {
                println!("  factory {} -> {}", factory.id, factory.symbol);
            }
            for ty in &plugin.types {
                println!("  type {} <- {}", ty.id, ty.factories.join(", "));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundlekit_core::{Runtime, RuntimeConfig};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn report_lists_declared_factories() {
        let tmp = TempDir::new().unwrap();
        let location = tmp.path().join("Hello.bundle");
        fs::create_dir_all(location.join("Contents")).unwrap();
        fs::write(
            location.join("Contents/Info.toml"),
            r#"
identifier = "org.example.hello"
version = "1.0.0"

[plugin.factories]
"hello.factory" = "hello_create"

[plugin.types]
"hello.type" = ["hello.factory"]
"#,
        )
        .unwrap();

        let runtime = Runtime::new(RuntimeConfig::default());
        let bundle = runtime.unique_bundle_with_path(&location).unwrap();
        let report = BundleReport::from_bundle(&bundle);

        assert_eq!(report.identifier.as_deref(), Some("org.example.hello"));
        assert_eq!(report.version.as_deref(), Some("1.0.0"));
        assert_eq!(report.layout, 2);
        assert!(report.executable.is_none());
        assert_eq!(report.format, "none");
        let plugin = report.plugin.unwrap();
        assert_eq!(plugin.factories.len(), 1);
        assert_eq!(plugin.factories[0].symbol, "hello_create");
        assert_eq!(plugin.types[0].factories, vec![plugin.factories[0].id.clone()]);

        let json = serde_json::to_value(BundleReport::from_bundle(&bundle)).unwrap();
        assert_eq!(json["name"], "Hello");
    }
}
