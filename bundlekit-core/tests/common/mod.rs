//! Shared fixtures: bundles on disk backed by a MockLoader runtime.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use bundlekit_core::{MockImage, MockLoader, Runtime, RuntimeConfig};
use tempfile::TempDir;

pub const ELF_HEADER: &[u8] = b"\x7fELF\x02\x01\x01\0\0\0\0\0\0\0\0\0";

pub struct Fixture {
    pub tmp: TempDir,
    pub loader: Arc<MockLoader>,
    pub runtime: Runtime,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut RuntimeConfig)) -> Self {
        let mut config = RuntimeConfig::default();
        config.registry.scan_loaded_images = false;
        tweak(&mut config);
        let loader = Arc::new(MockLoader::new());
        let runtime = Runtime::with_loader(config, loader.clone());
        Self {
            tmp: TempDir::new().unwrap(),
            loader,
            runtime,
        }
    }

    /// Write `<name>.bundle/Contents/{Info.toml,<name>}` and return the
    /// bundle location and executable path, both canonical.
    pub fn write_bundle(&self, name: &str, manifest: &str) -> (PathBuf, PathBuf) {
        let location = self.tmp.path().join(format!("{name}.bundle"));
        fs::create_dir_all(location.join("Contents")).unwrap();
        fs::write(location.join("Contents/Info.toml"), manifest).unwrap();
        fs::write(location.join("Contents").join(name), ELF_HEADER).unwrap();
        let location = fs::canonicalize(location).unwrap();
        let executable = location.join("Contents").join(name);
        (location, executable)
    }

    /// Write a bundle and register its executable with the mock loader.
    pub fn install(&self, name: &str, manifest: &str, image: MockImage) -> PathBuf {
        let (location, executable) = self.write_bundle(name, manifest);
        self.loader.register_image(executable, image);
        location
    }
}
