//! On-disk layout conventions
//!
//! A bundle directory follows one of several conventions for where its
//! manifest, executable and resources live. The convention is detected once
//! at construction; every path below is a pure function of the location
//! and the layout version.

use std::fmt;
use std::path::{Path, PathBuf};

use bundlekit_plugin_api::keys::MANIFEST_FILE;
use serde::Serialize;

/// Directory-structure convention of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutVersion {
    /// `Resources/` next to the executable.
    Flat = 0,
    /// Everything under `Support Files/`.
    SupportFiles = 1,
    /// Everything under `Contents/`.
    Contents = 2,
    /// A plain directory.
    Unpackaged = 3,
    /// A single file, not a directory.
    SingleFile = 4,
}

impl LayoutVersion {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for the three packaged conventions.
    pub fn is_packaged(self) -> bool {
        self <= Self::Contents
    }
}

impl fmt::Display for LayoutVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

const RESOURCES: &str = "Resources";
const SUPPORT_FILES: &str = "Support Files";
const CONTENTS: &str = "Contents";
const FRAMEWORK_EXTENSION: &str = "framework";

/// Well-known directories inside a bundle's support files directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinDir {
    PrivateFrameworks,
    SharedFrameworks,
    SharedSupport,
    PlugIns,
}

impl BuiltinDir {
    pub fn name(self) -> &'static str {
        match self {
            Self::PrivateFrameworks => "PrivateFrameworks",
            Self::SharedFrameworks => "SharedFrameworks",
            Self::SharedSupport => "SharedSupport",
            Self::PlugIns => "PlugIns",
        }
    }

    fn alternate_name(self) -> Option<&'static str> {
        match self {
            Self::PlugIns => Some("Plug-ins"),
            _ => None,
        }
    }
}

/// Detect a directory's layout version.
///
/// Child names are compared case-insensitively. Frameworks prefer the flat
/// layout; everything else prefers `Contents`.
pub fn detect(location: &Path) -> LayoutVersion {
    let children: Vec<String> = match std::fs::read_dir(location) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
            .map(|entry| entry.file_name().to_string_lossy().to_lowercase())
            .collect(),
        Err(e) => {
            tracing::debug!(path = %location.display(), error = %e, "Cannot list bundle directory");
            return LayoutVersion::Unpackaged;
        }
    };
    let has = |name: &str| children.iter().any(|child| child == &name.to_lowercase());

    let is_framework = location
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(FRAMEWORK_EXTENSION));
    let order: [(&str, LayoutVersion); 3] = if is_framework {
        [
            (RESOURCES, LayoutVersion::Flat),
            (CONTENTS, LayoutVersion::Contents),
            (SUPPORT_FILES, LayoutVersion::SupportFiles),
        ]
    } else {
        [
            (CONTENTS, LayoutVersion::Contents),
            (RESOURCES, LayoutVersion::Flat),
            (SUPPORT_FILES, LayoutVersion::SupportFiles),
        ]
    };
    order
        .into_iter()
        .find(|(name, _)| has(name))
        .map(|(_, version)| version)
        .unwrap_or(LayoutVersion::Unpackaged)
}

pub fn resources_dir(location: &Path, version: LayoutVersion) -> Option<PathBuf> {
    match version {
        LayoutVersion::Flat => Some(location.join(RESOURCES)),
        LayoutVersion::SupportFiles => Some(location.join(SUPPORT_FILES).join(RESOURCES)),
        LayoutVersion::Contents => Some(location.join(CONTENTS).join(RESOURCES)),
        LayoutVersion::Unpackaged | LayoutVersion::SingleFile => Some(location.to_path_buf()),
    }
}

pub fn support_files_dir(location: &Path, version: LayoutVersion) -> Option<PathBuf> {
    match version {
        LayoutVersion::SupportFiles => Some(location.join(SUPPORT_FILES)),
        LayoutVersion::Contents => Some(location.join(CONTENTS)),
        LayoutVersion::Flat | LayoutVersion::Unpackaged | LayoutVersion::SingleFile => {
            Some(location.to_path_buf())
        }
    }
}

/// Directory searched for the executable.
pub fn executables_dir(location: &Path, version: LayoutVersion) -> Option<PathBuf> {
    support_files_dir(location, version)
}

pub fn manifest_path(location: &Path, version: LayoutVersion) -> Option<PathBuf> {
    match version {
        LayoutVersion::Flat => Some(location.join(RESOURCES).join(MANIFEST_FILE)),
        LayoutVersion::SupportFiles => Some(location.join(SUPPORT_FILES).join(MANIFEST_FILE)),
        LayoutVersion::Contents => Some(location.join(CONTENTS).join(MANIFEST_FILE)),
        LayoutVersion::Unpackaged => Some(location.join(MANIFEST_FILE)),
        LayoutVersion::SingleFile => None,
    }
}

/// Path of a built-in directory. `PlugIns` falls back to `Plug-ins` when
/// only the alternate spelling exists on disk.
pub fn builtin_dir(location: &Path, version: LayoutVersion, dir: BuiltinDir) -> Option<PathBuf> {
    let base = support_files_dir(location, version)?;
    let primary = base.join(dir.name());
    if let Some(alternate) = dir.alternate_name().map(|name| base.join(name))
        && !primary.exists()
        && alternate.exists()
    {
        return Some(alternate);
    }
    Some(primary)
}

/// Subdirectory holding executables built for this platform.
pub const fn platform_subdir() -> &'static str {
    if cfg!(target_os = "macos") {
        "MacOS"
    } else if cfg!(windows) {
        "Windows"
    } else if cfg!(target_os = "freebsd") {
        "FreeBSD"
    } else {
        "Linux"
    }
}

fn library_extension() -> &'static str {
    if cfg!(target_os = "macos") {
        "dylib"
    } else if cfg!(windows) {
        "dll"
    } else {
        "so"
    }
}

/// Search the platform subdirectory, then the executables directory, for
/// `name`, `lib<name>.<ext>` or `<name>.<ext>`.
pub fn find_executable(location: &Path, version: LayoutVersion, name: &str) -> Option<PathBuf> {
    if version == LayoutVersion::SingleFile {
        return location.is_file().then(|| location.to_path_buf());
    }
    let base = executables_dir(location, version)?;
    let ext = library_extension();
    let candidates = [
        name.to_string(),
        format!("lib{name}.{ext}"),
        format!("{name}.{ext}"),
    ];
    [base.join(platform_subdir()), base]
        .iter()
        .flat_map(|dir| candidates.iter().map(move |candidate| dir.join(candidate)))
        .find(|path| path.is_file())
}

/// Walk up from an executable path to the bundle that contains it.
///
/// The executable may sit in a platform subdirectory of `Contents` or
/// `Support Files`, or anywhere under a `.framework` directory. Unless
/// `permissive`, a `Resources` ancestor ends the search and the bundle
/// directory's name must start with the executable's name.
pub fn bundle_location_for_executable(executable: &Path, permissive: bool) -> Option<PathBuf> {
    let exe_name = executable.file_stem()?.to_string_lossy().into_owned();
    let exe_name = exe_name.strip_prefix("lib").unwrap_or(&exe_name).to_lowercase();
    let matches_name = |dir: &Path| {
        permissive
            || dir
                .file_name()
                .is_some_and(|n| n.to_string_lossy().to_lowercase().starts_with(&exe_name))
    };

    let mut current = executable.parent()?;
    while let Some(name) = current.file_name().map(|n| n.to_string_lossy().into_owned()) {
        if !permissive && name.eq_ignore_ascii_case(RESOURCES) {
            return None;
        }
        if name.eq_ignore_ascii_case(CONTENTS) || name.eq_ignore_ascii_case(SUPPORT_FILES) {
            let bundle = current.parent()?;
            return (bundle.is_dir() && matches_name(bundle)).then(|| bundle.to_path_buf());
        }
        if current
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(FRAMEWORK_EXTENSION))
        {
            return (current.is_dir() && matches_name(current)).then(|| current.to_path_buf());
        }
        current = current.parent()?;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn bundle_with(dirs: &[&str], name: &str) -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let location = tmp.path().join(name);
        fs::create_dir_all(&location).unwrap();
        for dir in dirs {
            fs::create_dir_all(location.join(dir)).unwrap();
        }
        (tmp, location)
    }

    #[test]
    fn plain_directory_is_unpackaged() {
        let (_tmp, location) = bundle_with(&[], "Plain.bundle");
        assert_eq!(detect(&location), LayoutVersion::Unpackaged);
    }

    #[test]
    fn contents_wins_for_bundles() {
        let (_tmp, location) = bundle_with(&["Contents", "Resources"], "Both.bundle");
        assert_eq!(detect(&location), LayoutVersion::Contents);
    }

    #[test]
    fn resources_wins_for_frameworks() {
        let (_tmp, location) = bundle_with(&["Contents", "Resources"], "Both.framework");
        assert_eq!(detect(&location), LayoutVersion::Flat);
    }

    #[test]
    fn detection_ignores_case() {
        let (_tmp, location) = bundle_with(&["support files"], "Old.bundle");
        assert_eq!(detect(&location), LayoutVersion::SupportFiles);
    }

    #[test]
    fn conventional_directories() {
        let loc = Path::new("/b/X.bundle");
        assert_eq!(resources_dir(loc, LayoutVersion::Flat), Some(loc.join("Resources")));
        assert_eq!(
            resources_dir(loc, LayoutVersion::SupportFiles),
            Some(loc.join("Support Files/Resources"))
        );
        assert_eq!(
            resources_dir(loc, LayoutVersion::Contents),
            Some(loc.join("Contents/Resources"))
        );
        assert_eq!(resources_dir(loc, LayoutVersion::Unpackaged), Some(loc.to_path_buf()));
        assert_eq!(resources_dir(loc, LayoutVersion::SingleFile), Some(loc.to_path_buf()));
        assert_eq!(support_files_dir(loc, LayoutVersion::SingleFile), Some(loc.to_path_buf()));
        assert_eq!(support_files_dir(loc, LayoutVersion::Flat), Some(loc.to_path_buf()));
        assert_eq!(
            manifest_path(loc, LayoutVersion::Contents),
            Some(loc.join("Contents/Info.toml"))
        );
        assert_eq!(
            builtin_dir(loc, LayoutVersion::Contents, BuiltinDir::SharedSupport),
            Some(loc.join("Contents/SharedSupport"))
        );
    }

    #[test]
    fn plugins_dir_falls_back_to_alternate_name() {
        let (_tmp, location) = bundle_with(&["Contents/Plug-ins"], "Host.bundle");
        assert_eq!(
            builtin_dir(&location, LayoutVersion::Contents, BuiltinDir::PlugIns),
            Some(location.join("Contents/Plug-ins"))
        );
        fs::create_dir_all(location.join("Contents/PlugIns")).unwrap();
        assert_eq!(
            builtin_dir(&location, LayoutVersion::Contents, BuiltinDir::PlugIns),
            Some(location.join("Contents/PlugIns"))
        );
    }

    #[test]
    fn executable_search_prefers_platform_subdir() {
        let (_tmp, location) = bundle_with(&["Contents"], "Greeter.bundle");
        let sub = location.join("Contents").join(platform_subdir());
        fs::create_dir_all(&sub).unwrap();
        let ext = library_extension();
        fs::write(location.join("Contents").join("Greeter"), b"x").unwrap();
        fs::write(sub.join(format!("libGreeter.{ext}")), b"x").unwrap();

        assert_eq!(
            find_executable(&location, LayoutVersion::Contents, "Greeter"),
            Some(sub.join(format!("libGreeter.{ext}")))
        );
        assert_eq!(find_executable(&location, LayoutVersion::Contents, "Other"), None);
    }

    #[test]
    fn single_file_is_its_own_executable() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("libsolo.so");
        fs::write(&file, b"x").unwrap();
        assert_eq!(
            find_executable(&file, LayoutVersion::SingleFile, "ignored"),
            Some(file.clone())
        );
    }

    #[test]
    fn walk_up_finds_contents_bundle() {
        let (_tmp, location) = bundle_with(&["Contents/Linux"], "Greeter.bundle");
        let exe = location.join("Contents/Linux/libGreeter.so");
        fs::write(&exe, b"x").unwrap();
        assert_eq!(bundle_location_for_executable(&exe, false), Some(location.clone()));
    }

    #[test]
    fn walk_up_checks_name_unless_permissive() {
        let (_tmp, location) = bundle_with(&["Support Files"], "Host.bundle");
        let exe = location.join("Support Files/helper");
        fs::write(&exe, b"x").unwrap();
        assert_eq!(bundle_location_for_executable(&exe, false), None);
        assert_eq!(bundle_location_for_executable(&exe, true), Some(location));
    }

    #[test]
    fn walk_up_ignores_directory_case() {
        let (_tmp, location) = bundle_with(&["contents/Linux"], "Greeter.bundle");
        let exe = location.join("contents/Linux/libGreeter.so");
        fs::write(&exe, b"x").unwrap();
        assert_eq!(detect(&location), LayoutVersion::Contents);
        assert_eq!(bundle_location_for_executable(&exe, false), Some(location));
    }

    #[test]
    fn walk_up_finds_framework() {
        let (_tmp, location) = bundle_with(&["Versions/A"], "Kit.framework");
        let exe = location.join("Versions/A/Kit");
        fs::write(&exe, b"x").unwrap();
        assert_eq!(bundle_location_for_executable(&exe, false), Some(location));
    }

    #[test]
    fn walk_up_stops_at_resources() {
        let (_tmp, location) = bundle_with(&["Resources/tools"], "Kit.framework");
        let exe = location.join("Resources/tools/Kit");
        fs::write(&exe, b"x").unwrap();
        assert_eq!(bundle_location_for_executable(&exe, false), None);
    }
}
