//! Error types for bundle loading and configuration

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Broad failure classes shared by every loader back end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadErrorKind {
    NotFound,
    NotLoadable,
    ArchitectureMismatch,
    RuntimeMismatch,
    LoadFailed,
    LinkFailed,
}

impl LoadErrorKind {
    /// Stable numeric code reported in [`BundleError`].
    pub const fn code(self) -> i64 {
        match self {
            Self::NotFound => 4,
            Self::NotLoadable => 3584,
            Self::ArchitectureMismatch => 3585,
            Self::RuntimeMismatch => 3586,
            Self::LoadFailed => 3587,
            Self::LinkFailed => 3588,
        }
    }

    fn consequence(self) -> &'static str {
        match self {
            Self::NotFound => "its executable could not be located",
            Self::NotLoadable => "its executable is not loadable",
            Self::ArchitectureMismatch => {
                "it does not contain a version for the current architecture"
            }
            Self::RuntimeMismatch => "it is not compatible with this host",
            Self::LoadFailed => "it is damaged or missing necessary resources",
            Self::LinkFailed => "its executable could not be linked",
        }
    }

    fn reason(self) -> &'static str {
        match self {
            Self::NotFound => "The bundle's executable couldn't be located.",
            Self::NotLoadable => "The bundle's executable isn't loadable.",
            Self::ArchitectureMismatch => {
                "No loadable executable for the current architecture was found in the bundle."
            }
            Self::RuntimeMismatch => "The bundle was built against an incompatible plugin API.",
            Self::LoadFailed => "The bundle is damaged or missing necessary resources.",
            Self::LinkFailed => "The bundle couldn't be linked.",
        }
    }

    fn suggestion(self) -> &'static str {
        match self {
            Self::ArchitectureMismatch => "Try installing a build of the bundle for this machine.",
            Self::RuntimeMismatch => "Try rebuilding the bundle against this version of the host.",
            _ => "Try reinstalling the bundle.",
        }
    }
}

/// Errors produced by a [`PlatformLoader`](crate::loader::PlatformLoader).
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("No executable found at {path}")]
    NotFound { path: PathBuf },

    #[error("Executable at {path} is not loadable: {reason}")]
    NotLoadable { path: PathBuf, reason: String },

    #[error("Executable at {path} has no image for {host}")]
    ArchitectureMismatch { path: PathBuf, host: String },

    #[error("API version mismatch in {path}: host expects {expected}, bundle has {found}")]
    RuntimeMismatch {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    #[error("Failed to load {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    #[error("Failed to link {path}: {message}")]
    LinkFailed { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoadError {
    pub fn kind(&self) -> LoadErrorKind {
        match self {
            Self::NotFound { .. } => LoadErrorKind::NotFound,
            Self::NotLoadable { .. } => LoadErrorKind::NotLoadable,
            Self::ArchitectureMismatch { .. } => LoadErrorKind::ArchitectureMismatch,
            Self::RuntimeMismatch { .. } => LoadErrorKind::RuntimeMismatch,
            Self::LoadFailed { .. } | Self::Io(_) => LoadErrorKind::LoadFailed,
            Self::LinkFailed { .. } => LoadErrorKind::LinkFailed,
        }
    }

    pub fn not_loadable(path: &Path, reason: impl Into<String>) -> Self {
        Self::NotLoadable {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Classify a dynamic linker message into one of the error kinds.
    pub fn from_linker_message(path: &Path, message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let path = path.to_path_buf();
        if lower.contains("wrong elf class")
            || lower.contains("wrong architecture")
            || lower.contains("incompatible architecture")
            || lower.contains("machine type")
        {
            Self::ArchitectureMismatch {
                path,
                host: std::env::consts::ARCH.to_string(),
            }
        } else if lower.contains("undefined symbol")
            || lower.contains("symbol not found")
            || lower.contains("symbol lookup error")
        {
            Self::LinkFailed { path, message }
        } else if lower.contains("invalid elf header")
            || lower.contains("file too short")
            || lower.contains("not a mach-o file")
            || lower.contains("not a valid win32 application")
        {
            Self::NotLoadable {
                path,
                reason: message,
            }
        } else {
            Self::LoadFailed { path, message }
        }
    }

    pub fn from_library_error(path: &Path, err: &libloading::Error) -> Self {
        Self::from_linker_message(path, err.to_string())
    }
}

/// Structured load failure carrying a domain, a code and user-facing text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{description}")]
pub struct BundleError {
    pub kind: LoadErrorKind,
    pub bundle_path: PathBuf,
    pub executable_path: Option<PathBuf>,
    pub description: String,
    pub reason: String,
    pub suggestion: String,
    /// Loader diagnostic text, when the back end produced one.
    pub debug: Option<String>,
}

impl BundleError {
    pub const DOMAIN: &'static str = "bundlekit.bundle";

    pub fn new(
        kind: LoadErrorKind,
        bundle_path: &Path,
        executable_path: Option<&Path>,
        debug: Option<String>,
    ) -> Self {
        let name = bundle_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| bundle_path.display().to_string());
        Self {
            kind,
            bundle_path: bundle_path.to_path_buf(),
            executable_path: executable_path.map(Path::to_path_buf),
            description: format!(
                "The bundle \"{name}\" couldn't be loaded because {}.",
                kind.consequence()
            ),
            reason: kind.reason().to_string(),
            suggestion: kind.suggestion().to_string(),
            debug,
        }
    }

    pub fn from_load_error(bundle_path: &Path, executable_path: Option<&Path>, err: &LoadError) -> Self {
        Self::new(err.kind(), bundle_path, executable_path, Some(err.to_string()))
    }

    pub fn domain(&self) -> &'static str {
        Self::DOMAIN
    }

    pub fn code(&self) -> i64 {
        self.kind.code()
    }
}

/// Configuration file errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_error_not_found_displays_path() {
        let err = LoadError::NotFound {
            path: PathBuf::from("/bundles/Foo.bundle/foo"),
        };
        assert!(err.to_string().contains("/bundles/Foo.bundle/foo"));
        assert_eq!(err.kind(), LoadErrorKind::NotFound);
    }

    #[test]
    fn runtime_mismatch_displays_versions() {
        let err = LoadError::RuntimeMismatch {
            path: PathBuf::from("/x"),
            expected: 1,
            found: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains('1'));
        assert!(msg.contains('7'));
    }

    #[test]
    fn linker_messages_map_to_kinds() {
        let path = Path::new("/lib/libfoo.so");
        let cases = [
            ("libfoo.so: wrong ELF class: ELFCLASS32", LoadErrorKind::ArchitectureMismatch),
            ("libfoo.so: undefined symbol: bar", LoadErrorKind::LinkFailed),
            ("libfoo.so: invalid ELF header", LoadErrorKind::NotLoadable),
            ("libbar.so: cannot open shared object file", LoadErrorKind::LoadFailed),
        ];
        for (message, kind) in cases {
            assert_eq!(LoadError::from_linker_message(path, message).kind(), kind, "{message}");
        }
    }

    #[test]
    fn io_error_converts_to_load_failed() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: LoadError = io.into();
        assert_eq!(err.kind(), LoadErrorKind::LoadFailed);
    }

    #[test]
    fn bundle_error_names_the_bundle() {
        let err = BundleError::new(
            LoadErrorKind::NotFound,
            Path::new("/bundles/Greeter.bundle"),
            None,
            None,
        );
        assert_eq!(err.domain(), "bundlekit.bundle");
        assert_eq!(err.code(), 4);
        assert!(err.to_string().contains("\"Greeter\""));
        assert!(err.to_string().contains("could not be located"));
    }

    #[test]
    fn bundle_error_codes_are_distinct() {
        let kinds = [
            LoadErrorKind::NotFound,
            LoadErrorKind::NotLoadable,
            LoadErrorKind::ArchitectureMismatch,
            LoadErrorKind::RuntimeMismatch,
            LoadErrorKind::LoadFailed,
            LoadErrorKind::LinkFailed,
        ];
        let codes: std::collections::HashSet<_> = kinds.iter().map(|k| k.code()).collect();
        assert_eq!(codes.len(), kinds.len());
    }
}
