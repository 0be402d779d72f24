//! Runtime configuration
//!
//! Configuration is layered: built-in defaults, then the user file in
//! [`bundlekit_paths::config_dir`], then a project file in `.bundlekit/`.
//! Each layer only overrides the keys it sets.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::loader::LoaderBackend;

const CONFIG_FILE: &str = "config.toml";
const DEFAULT_EXTENSION: &str = "bundle";

/// Environment variable overriding the project config directory.
pub const PROJECT_CONFIG_DIR_ENV: &str = "BUNDLEKIT_PROJECT_CONFIG_DIR";

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub loader: LoaderConfig,
    pub registry: RegistryConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub backend: LoaderBackend,
    /// Make symbols of loaded bundles visible to later images.
    pub force_global_symbols: bool,
    /// Reject bundles exporting a different plugin API version.
    pub check_api_version: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Allow evicting bundles from the registry indexes. Handles held by
    /// callers stay valid but stop being found by lookups.
    pub unretained_tables: bool,
    /// Consult the list of images already mapped into the process.
    pub scan_loaded_images: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub search_paths: Vec<PathBuf>,
    /// Directory extension that marks a bundle during discovery.
    pub extension: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        ConfigLoader::finalize(RawRuntimeConfig::default())
    }
}

/// One configuration layer as read from disk; unset keys stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRuntimeConfig {
    #[serde(default)]
    pub loader: RawLoaderConfig,
    #[serde(default)]
    pub registry: RawRegistryConfig,
    #[serde(default)]
    pub discovery: RawDiscoveryConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawLoaderConfig {
    pub backend: Option<LoaderBackend>,
    pub force_global_symbols: Option<bool>,
    pub check_api_version: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRegistryConfig {
    pub unretained_tables: Option<bool>,
    pub scan_loaded_images: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDiscoveryConfig {
    pub search_paths: Option<Vec<PathBuf>>,
    pub extension: Option<String>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration (user + project)
    pub fn load() -> Result<RuntimeConfig, ConfigError> {
        let mut raw = RawRuntimeConfig::default();

        // Layer 1: User config
        let user_path = Self::user_config_path();
        if user_path.exists() {
            raw = Self::merge_raw(raw, Self::read_raw(&user_path)?);
        }

        // Layer 2: Project config
        let project_path = Self::project_config_path();
        if project_path.exists() {
            raw = Self::merge_raw(raw, Self::read_raw(&project_path)?);
        }

        Ok(Self::finalize(raw))
    }

    /// Load a single file on top of the defaults.
    pub fn load_file(path: &Path) -> Result<RuntimeConfig, ConfigError> {
        Ok(Self::finalize(Self::read_raw(path)?))
    }

    pub fn user_config_path() -> PathBuf {
        bundlekit_paths::config_dir().join(CONFIG_FILE)
    }

    /// Get project config path
    /// Can be overridden with BUNDLEKIT_PROJECT_CONFIG_DIR (useful for isolated tests)
    pub fn project_config_path() -> PathBuf {
        if let Ok(dir) = std::env::var(PROJECT_CONFIG_DIR_ENV) {
            PathBuf::from(dir).join(CONFIG_FILE)
        } else {
            PathBuf::from(".bundlekit").join(CONFIG_FILE)
        }
    }

    fn read_raw(path: &Path) -> Result<RawRuntimeConfig, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Merge two raw configs (overlay values override base only if explicitly set)
    pub fn merge_raw(base: RawRuntimeConfig, overlay: RawRuntimeConfig) -> RawRuntimeConfig {
        RawRuntimeConfig {
            loader: RawLoaderConfig {
                backend: overlay.loader.backend.or(base.loader.backend),
                force_global_symbols: overlay
                    .loader
                    .force_global_symbols
                    .or(base.loader.force_global_symbols),
                check_api_version: overlay
                    .loader
                    .check_api_version
                    .or(base.loader.check_api_version),
            },
            registry: RawRegistryConfig {
                unretained_tables: overlay
                    .registry
                    .unretained_tables
                    .or(base.registry.unretained_tables),
                scan_loaded_images: overlay
                    .registry
                    .scan_loaded_images
                    .or(base.registry.scan_loaded_images),
            },
            discovery: RawDiscoveryConfig {
                search_paths: overlay.discovery.search_paths.or(base.discovery.search_paths),
                extension: overlay.discovery.extension.or(base.discovery.extension),
            },
        }
    }

    /// Convert raw config to final config with defaults applied
    pub fn finalize(raw: RawRuntimeConfig) -> RuntimeConfig {
        RuntimeConfig {
            loader: LoaderConfig {
                backend: raw.loader.backend.unwrap_or_default(),
                force_global_symbols: raw.loader.force_global_symbols.unwrap_or(false),
                check_api_version: raw.loader.check_api_version.unwrap_or(true),
            },
            registry: RegistryConfig {
                unretained_tables: raw.registry.unretained_tables.unwrap_or(false),
                scan_loaded_images: raw.registry.scan_loaded_images.unwrap_or(true),
            },
            discovery: DiscoveryConfig {
                search_paths: raw
                    .discovery
                    .search_paths
                    .unwrap_or_else(|| vec![bundlekit_paths::bundles_dir()])
                    .iter()
                    .map(|path| bundlekit_paths::expand_home(path))
                    .collect(),
                extension: raw
                    .discovery
                    .extension
                    .map(|ext| ext.trim_start_matches('.').to_string())
                    .unwrap_or_else(|| DEFAULT_EXTENSION.to_string()),
            },
        }
    }

    /// Save config to a specific path
    ///
    /// Creates parent directories if they don't exist.
    pub fn save_to_path(config: &RuntimeConfig, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml = toml::to_string_pretty(config).map_err(std::io::Error::other)?;
        std::fs::write(path, toml)
    }
}
