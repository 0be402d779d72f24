//! Mock loader for testing
//!
//! MockLoader never touches the dynamic linker. Tests register an image per
//! executable path with the symbols it should export (ordinary Rust
//! `extern "C"` functions), then drive bundles through it and assert on the
//! load and unload counters.

use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::{LoadHandle, PlatformLoader, Symbol};
use crate::error::{LoadError, LoadErrorKind};

/// Symbols and behaviour of one fake image.
#[derive(Debug, Clone, Default)]
pub struct MockImage {
    symbols: HashMap<String, usize>,
    failure: Option<LoadErrorKind>,
}

impl MockImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export `address` under `name`.
    pub fn with_symbol(mut self, name: &str, address: *const c_void) -> Self {
        self.symbols.insert(name.to_string(), address as usize);
        self
    }

    /// Make every load of this image fail with `kind`.
    pub fn failing(mut self, kind: LoadErrorKind) -> Self {
        self.failure = Some(kind);
        self
    }
}

/// In-process [`PlatformLoader`] backed by registered [`MockImage`]s.
#[derive(Debug, Default)]
pub struct MockLoader {
    images: Mutex<HashMap<PathBuf, MockImage>>,
    mapped: Mutex<HashSet<PathBuf>>,
    load_delay: Mutex<Option<Duration>>,
    loads: AtomicUsize,
    unloads: AtomicUsize,
}

impl MockLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_image(&self, path: impl Into<PathBuf>, image: MockImage) {
        self.images.lock().insert(path.into(), image);
    }

    /// Sleep inside every load to widen race windows.
    pub fn set_load_delay(&self, delay: Duration) {
        *self.load_delay.lock() = Some(delay);
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn is_mapped(&self, path: &Path) -> bool {
        self.mapped.lock().contains(path)
    }

    fn failure_for(path: &Path, kind: LoadErrorKind) -> LoadError {
        let path = path.to_path_buf();
        match kind {
            LoadErrorKind::NotFound => LoadError::NotFound { path },
            LoadErrorKind::NotLoadable => LoadError::NotLoadable {
                path,
                reason: "mock image rejected".to_string(),
            },
            LoadErrorKind::ArchitectureMismatch => LoadError::ArchitectureMismatch {
                path,
                host: std::env::consts::ARCH.to_string(),
            },
            LoadErrorKind::RuntimeMismatch => LoadError::RuntimeMismatch {
                path,
                expected: bundlekit_plugin_api::API_VERSION,
                found: 0,
            },
            LoadErrorKind::LoadFailed => LoadError::LoadFailed {
                path,
                message: "mock load failure".to_string(),
            },
            LoadErrorKind::LinkFailed => LoadError::LinkFailed {
                path,
                message: "mock link failure".to_string(),
            },
        }
    }
}

impl PlatformLoader for MockLoader {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn load(&self, path: &Path, _force_global: bool) -> Result<LoadHandle, LoadError> {
        let delay = *self.load_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.loads.fetch_add(1, Ordering::SeqCst);

        let failure = {
            let images = self.images.lock();
            match images.get(path) {
                Some(image) => image.failure,
                None => Some(LoadErrorKind::NotFound),
            }
        };
        if let Some(kind) = failure {
            return Err(Self::failure_for(path, kind));
        }
        self.mapped.lock().insert(path.to_path_buf());
        Ok(LoadHandle::new(path, path.to_path_buf()))
    }

    fn resolve_symbol(&self, handle: &LoadHandle, name: &str) -> Option<Symbol> {
        let path = handle.downcast_ref::<PathBuf>()?;
        let images = self.images.lock();
        let address = *images.get(path)?.symbols.get(name)?;
        Symbol::new(address as *mut c_void)
    }

    fn preflight(&self, path: &Path) -> Result<(), LoadError> {
        match self.images.lock().get(path) {
            Some(MockImage {
                failure: Some(kind),
                ..
            }) => Err(Self::failure_for(path, *kind)),
            Some(_) => Ok(()),
            None => Err(LoadError::NotFound {
                path: path.to_path_buf(),
            }),
        }
    }

    fn unload(&self, handle: LoadHandle) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        self.mapped.lock().remove(handle.path());
    }

    fn loaded_images(&self) -> Vec<PathBuf> {
        self.mapped.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn answer() -> u32 {
        42
    }

    #[test]
    fn unknown_image_is_not_found() {
        let loader = MockLoader::new();
        let err = loader.load(Path::new("/nowhere/libx.so"), false).unwrap_err();
        assert_eq!(err.kind(), LoadErrorKind::NotFound);
        assert_eq!(loader.load_count(), 1);
    }

    #[test]
    fn registered_symbols_resolve() {
        let loader = MockLoader::new();
        let path = PathBuf::from("/bundles/A.bundle/a");
        loader.register_image(&path, MockImage::new().with_symbol("answer", answer as *const c_void));
        let handle = loader.load(&path, false).unwrap();
        assert!(loader.is_mapped(&path));

        let symbol = loader.resolve_symbol(&handle, "answer").unwrap();
        let f: extern "C" fn() -> u32 = unsafe { symbol.cast() };
        assert_eq!(f(), 42);
        assert!(loader.resolve_symbol(&handle, "missing").is_none());

        loader.unload(handle);
        assert!(!loader.is_mapped(&path));
        assert_eq!(loader.unload_count(), 1);
    }

    #[test]
    fn failing_image_reports_its_kind() {
        let loader = MockLoader::new();
        let path = PathBuf::from("/bundles/B.bundle/b");
        loader.register_image(&path, MockImage::new().failing(LoadErrorKind::LinkFailed));
        assert_eq!(loader.load(&path, false).unwrap_err().kind(), LoadErrorKind::LinkFailed);
        assert_eq!(loader.preflight(&path).unwrap_err().kind(), LoadErrorKind::LinkFailed);
    }
}
