//! POSIX `dlopen` back end.

use std::path::{Path, PathBuf};

use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_LOCAL, RTLD_NOW};

use super::{LoadHandle, PlatformLoader, Symbol};
use crate::error::LoadError;

/// Loads images with `dlopen`, honouring the global-symbols request.
#[derive(Debug, Default)]
pub struct DlfcnLoader;

impl DlfcnLoader {
    pub fn new() -> Self {
        Self
    }
}

impl PlatformLoader for DlfcnLoader {
    fn name(&self) -> &'static str {
        "dlfcn"
    }

    fn load(&self, path: &Path, force_global: bool) -> Result<LoadHandle, LoadError> {
        let scope = if force_global { RTLD_GLOBAL } else { RTLD_LOCAL };
        // SAFETY: loading runs the image's initializers. Bundles are code the
        // host chose to trust by asking for them.
        let library = unsafe { Library::open(Some(path), RTLD_NOW | scope) }
            .map_err(|e| LoadError::from_library_error(path, &e))?;
        tracing::debug!(path = %path.display(), global = force_global, "dlopen succeeded");
        Ok(LoadHandle::new(path, library))
    }

    fn resolve_symbol(&self, handle: &LoadHandle, name: &str) -> Option<Symbol> {
        let library = handle.downcast_ref::<Library>()?;
        // SAFETY: the symbol is only handed out as an untyped address.
        let symbol = unsafe { library.get::<*mut std::ffi::c_void>(name.as_bytes()) }.ok()?;
        Symbol::new(symbol.into_raw())
    }

    fn unload(&self, handle: LoadHandle) {
        let path = handle.path().to_path_buf();
        if let Some(library) = handle.into_inner::<Library>()
            && let Err(e) = library.close()
        {
            tracing::warn!(path = %path.display(), error = %e, "dlclose failed");
        }
    }

    fn loaded_images(&self) -> Vec<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            match std::fs::read_to_string("/proc/self/maps") {
                Ok(maps) => parse_maps(&maps),
                Err(e) => {
                    tracing::debug!(error = %e, "Cannot read /proc/self/maps");
                    Vec::new()
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            Vec::new()
        }
    }
}

/// Executable file mappings listed in a `/proc/<pid>/maps` dump, in order, without duplicates.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_maps(maps: &str) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = Vec::new();
    for line in maps.lines() {
        let mut rest = line;
        let mut fields = Vec::with_capacity(5);
        for _ in 0..5 {
            rest = rest.trim_start();
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            fields.push(&rest[..end]);
            rest = &rest[end..];
        }
        let path = rest.trim();
        let executable = fields.get(1).is_some_and(|perms| perms.contains('x'));
        if executable && path.starts_with('/') {
            let path = PathBuf::from(path);
            if !images.contains(&path) {
                images.push(path);
            }
        }
    }
    images
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_reports_missing_library() {
        let dir = TempDir::new().unwrap();
        let err = DlfcnLoader::new()
            .load(&dir.path().join("libnothing.so"), false)
            .unwrap_err();
        assert!(err.to_string().contains("libnothing.so"));
    }

    #[test]
    fn load_rejects_non_image() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("libfake.so");
        std::fs::write(&path, vec![0u8; 128]).unwrap();
        assert!(DlfcnLoader::new().load(&path, false).is_err());
    }

    #[test]
    fn parse_maps_keeps_executable_file_mappings() {
        let maps = "\
55d0c0a00000-55d0c0a02000 r--p 00000000 08:01 1234 /usr/bin/host
55d0c0a02000-55d0c0a08000 r-xp 00002000 08:01 1234 /usr/bin/host
7f10a0000000-7f10a0021000 rw-p 00000000 00:00 0 [heap]
7f10a1000000-7f10a1200000 r-xp 00000000 08:01 99 /opt/Greeter.framework/Support Files/Linux/libGreeter.so
7f10a1200000-7f10a1400000 r-xp 00200000 08:01 99 /opt/Greeter.framework/Support Files/Linux/libGreeter.so
7ffc00000000-7ffc00021000 r-xp 00000000 00:00 0
";
        let images = parse_maps(maps);
        assert_eq!(
            images,
            vec![
                PathBuf::from("/usr/bin/host"),
                PathBuf::from("/opt/Greeter.framework/Support Files/Linux/libGreeter.so"),
            ]
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn loaded_images_include_something() {
        assert!(!DlfcnLoader::new().loaded_images().is_empty());
    }
}
