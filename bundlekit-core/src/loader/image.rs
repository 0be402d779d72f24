//! Portable image loader.
//!
//! Uses the platform's default loading mode and cannot scope symbols.
//! Framework images are never unmapped: other images may have bound to
//! them, so unloading only drops the bookkeeping.

use std::path::Path;

use libloading::Library;

use super::format::{self, BinaryFormat};
use super::{LoadHandle, PlatformLoader, Symbol};
use crate::error::LoadError;

#[derive(Debug, Default)]
pub struct ImageLoader;

impl ImageLoader {
    pub fn new() -> Self {
        Self
    }
}

impl PlatformLoader for ImageLoader {
    fn name(&self) -> &'static str {
        "image"
    }

    fn load(&self, path: &Path, force_global: bool) -> Result<LoadHandle, LoadError> {
        if force_global {
            tracing::debug!(path = %path.display(), "Image loader ignores the global symbols request");
        }
        // SAFETY: loading runs the image's initializers; see DlfcnLoader::load.
        let library =
            unsafe { Library::new(path) }.map_err(|e| LoadError::from_library_error(path, &e))?;
        Ok(LoadHandle::new(path, library))
    }

    fn resolve_symbol(&self, handle: &LoadHandle, name: &str) -> Option<Symbol> {
        let library = handle.downcast_ref::<Library>()?;
        // SAFETY: the symbol value is read as an address, never called here.
        let symbol = unsafe { library.get::<*mut std::ffi::c_void>(name.as_bytes()) }.ok()?;
        Symbol::new(*symbol)
    }

    fn unload(&self, handle: LoadHandle) {
        let path = handle.path().to_path_buf();
        let Some(library) = handle.into_inner::<Library>() else {
            return;
        };
        if format::sniff_format(&path) == BinaryFormat::MachFramework {
            tracing::debug!(path = %path.display(), "Leaving framework image mapped");
            std::mem::forget(library);
        } else if let Err(e) = library.close() {
            tracing::warn!(path = %path.display(), error = %e, "Image unload failed");
        }
    }
}
