//! XDG Base Directory paths for bundlekit.
//!
//! Hosts use XDG paths on every platform so that config and installed
//! bundles live in the same place regardless of OS conventions.

use std::path::{Path, PathBuf};

const APP_DIR: &str = "bundlekit";

/// Get the bundlekit config directory.
///
/// Returns `$XDG_CONFIG_HOME/bundlekit` if set, otherwise `~/.config/bundlekit`.
/// The user-level `config.toml` lives here.
///
/// # Examples
///
/// ```
/// use bundlekit_paths::config_dir;
///
/// let config = config_dir();
/// let file = config.join("config.toml");
/// ```
pub fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config")
}

/// Get the bundlekit data directory.
///
/// Returns `$XDG_DATA_HOME/bundlekit` if set, otherwise `~/.local/share/bundlekit`.
pub fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share")
}

/// Default directory scanned for installed bundles.
pub fn bundles_dir() -> PathBuf {
    data_dir().join("bundles")
}

/// Expand a leading `~` to the home directory.
///
/// Paths without a tilde, and paths on systems without a home directory,
/// are returned unchanged.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    if let Ok(base) = std::env::var(var) {
        PathBuf::from(base).join(APP_DIR)
    } else if let Some(home) = dirs::home_dir() {
        home.join(fallback).join(APP_DIR)
    } else {
        PathBuf::from(fallback).join(APP_DIR)
    }
}
