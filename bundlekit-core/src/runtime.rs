//! The runtime: one loader, one bundle registry, one factory registry.
//!
//! Every public way of obtaining a registered [`Bundle`] goes through a
//! [`Runtime`]. Most programs use [`Runtime::global`]; tests and embedders
//! build their own with an injected loader.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::bundle::{Bundle, LayoutVersion, layout};
use crate::config::{ConfigLoader, RuntimeConfig};
use crate::loader::{PlatformLoader, platform_loader};
use crate::plugin::FactoryRegistry;
use crate::registry::BundleRegistry;

const FRAMEWORK_EXTENSION: &str = "framework";

pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) loader: Arc<dyn PlatformLoader>,
    pub(crate) bundles: BundleRegistry,
    pub(crate) factories: FactoryRegistry,
    main_bundle: OnceLock<Option<Arc<Bundle>>>,
}

/// Handle to a bundle runtime. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Build a runtime using the loader back end named in `config`.
    pub fn new(config: RuntimeConfig) -> Self {
        let loader = platform_loader(config.loader.backend);
        Self::with_loader(config, loader)
    }

    pub fn with_loader(config: RuntimeConfig, loader: Arc<dyn PlatformLoader>) -> Self {
        let inner = Arc::new_cyclic(|weak| RuntimeInner {
            bundles: BundleRegistry::new(config.registry.unretained_tables),
            factories: FactoryRegistry::new(weak.clone()),
            loader,
            config,
            main_bundle: OnceLock::new(),
        });
        tracing::debug!(loader = inner.loader.name(), "Runtime created");
        Self { inner }
    }

    /// The process-wide runtime, built once from the layered configuration.
    pub fn global() -> &'static Runtime {
        static GLOBAL: OnceLock<Runtime> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let config = ConfigLoader::load().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to load configuration, using defaults");
                RuntimeConfig::default()
            });
            Runtime::new(config)
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn loader(&self) -> &Arc<dyn PlatformLoader> {
        &self.inner.loader
    }

    pub fn bundles(&self) -> &BundleRegistry {
        &self.inner.bundles
    }

    pub fn factories(&self) -> &FactoryRegistry {
        &self.inner.factories
    }

    fn canonical(location: &Path) -> Option<PathBuf> {
        match std::fs::canonicalize(location) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::debug!(path = %location.display(), error = %e, "Cannot resolve bundle location");
                None
            }
        }
    }

    /// The registered bundle at `location`, constructing it on first use.
    ///
    /// Differently spelled paths to the same directory yield the same bundle.
    /// If two threads race to construct it, one insertion wins and both
    /// callers receive the winner with its static factories registered.
    pub fn bundle_with_path(&self, location: impl AsRef<Path>) -> Option<Arc<Bundle>> {
        let location = Self::canonical(location.as_ref())?;
        let bundle = match self.inner.bundles.lookup_by_location(&location) {
            Some(existing) => existing,
            None => {
                let bundle = Bundle::construct(Arc::downgrade(&self.inner), &location, false)?;
                self.inner.bundles.insert_or_fetch(bundle).0
            }
        };
        self.inner.factories.init_plugin(&bundle);
        Some(bundle)
    }

    /// A bundle that is never registered and never runs plugin setup.
    pub fn unique_bundle_with_path(&self, location: impl AsRef<Path>) -> Option<Arc<Bundle>> {
        let location = Self::canonical(location.as_ref())?;
        Bundle::construct(Arc::downgrade(&self.inner), &location, true).map(Arc::new)
    }

    /// Whether `location` has a packaged bundle structure.
    pub fn looks_like_bundle(&self, location: impl AsRef<Path>) -> bool {
        self.unique_bundle_with_path(location).is_some_and(|bundle| {
            matches!(
                bundle.effective_layout_version(),
                LayoutVersion::Flat | LayoutVersion::SupportFiles | LayoutVersion::Contents
            )
        })
    }

    /// Register every child of `dir`, optionally only those with `extension`.
    pub fn bundles_in_directory(&self, dir: impl AsRef<Path>, extension: Option<&str>) -> Vec<Arc<Bundle>> {
        let dir = dir.as_ref();
        let mut children: Vec<PathBuf> = match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .collect(),
            Err(e) => {
                tracing::debug!(path = %dir.display(), error = %e, "Cannot list directory");
                return Vec::new();
            }
        };
        children.sort();
        children
            .into_iter()
            .filter(|path| {
                extension.is_none_or(|wanted| {
                    let wanted = wanted.trim_start_matches('.');
                    path.extension()
                        .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case(wanted))
                })
            })
            .filter_map(|path| self.bundle_with_path(path))
            .collect()
    }

    /// Register bundles found in the configured search paths.
    pub fn discover(&self) -> Vec<Arc<Bundle>> {
        let discovery = &self.inner.config.discovery;
        discovery
            .search_paths
            .iter()
            .filter(|path| path.is_dir())
            .flat_map(|path| self.bundles_in_directory(path, Some(&discovery.extension)))
            .collect()
    }

    /// Best bundle declaring `identifier`, scanning mapped images if needed.
    pub fn bundle_with_identifier(&self, identifier: &str) -> Option<Arc<Bundle>> {
        if let Some(main) = self.main_bundle()
            && main.identifier() == Some(identifier)
        {
            return Some(main);
        }
        if let Some(bundle) = self.inner.bundles.lookup_by_identifier(identifier) {
            return Some(bundle);
        }
        if !self.inner.config.registry.scan_loaded_images {
            return None;
        }
        self.scan_loaded_images();
        self.inner.bundles.lookup_by_identifier(identifier)
    }

    /// The main program bundle followed by every registered bundle.
    pub fn all_bundles(&self) -> Vec<Arc<Bundle>> {
        if self.inner.config.registry.scan_loaded_images {
            self.scan_loaded_images();
        }
        let mut all: Vec<Arc<Bundle>> = self.main_bundle().into_iter().collect();
        all.extend(self.inner.bundles.all());
        all
    }

    /// The bundle at `path`, or the bundle containing the executable at `path`.
    pub fn bundle_for_path(&self, path: impl AsRef<Path>) -> Option<Arc<Bundle>> {
        let path = Self::canonical(path.as_ref())?;
        if let Some(bundle) = self.inner.bundles.lookup_by_location(&path) {
            return Some(bundle);
        }
        let location = layout::bundle_location_for_executable(&path, false)?;
        self.bundle_with_path(location)
    }

    /// Bundle for the running program. Never stored in the registry tables.
    pub fn main_bundle(&self) -> Option<Arc<Bundle>> {
        self.inner
            .main_bundle
            .get_or_init(|| self.build_main_bundle())
            .clone()
    }

    fn build_main_bundle(&self) -> Option<Arc<Bundle>> {
        let executable = match std::env::current_exe() {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot determine the running executable");
                return None;
            }
        };
        let executable = std::fs::canonicalize(&executable).unwrap_or(executable);
        let location = layout::bundle_location_for_executable(&executable, false)
            .or_else(|| executable.parent().map(Path::to_path_buf))?;
        let bundle = Bundle::construct(Arc::downgrade(&self.inner), &location, false)?;
        bundle.mark_loaded();
        Some(Arc::new(bundle))
    }

    /// Register framework bundles whose images are already mapped.
    pub fn scan_loaded_images(&self) {
        for image in self.inner.loader.loaded_images() {
            let Some(location) = layout::bundle_location_for_executable(&image, false) else {
                continue;
            };
            let is_framework = location
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(FRAMEWORK_EXTENSION));
            if !is_framework {
                continue;
            }
            if let Some(bundle) = self.bundle_with_path(&location)
                && !bundle.is_loaded()
            {
                tracing::debug!(bundle = %location.display(), "Found mapped framework");
                bundle.load_executable();
            }
        }
    }

    /// Unload every bundle whose last plugin instance went away.
    pub fn drain_scheduled_unloads(&self) {
        self.inner.bundles.drain_scheduled_unloads();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("loader", &self.inner.loader.name())
            .field("bundles", &self.inner.bundles.len())
            .finish_non_exhaustive()
    }
}
