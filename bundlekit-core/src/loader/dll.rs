//! Windows `LoadLibrary` back end.

use std::path::Path;

use libloading::os::windows::Library;

use super::{LoadHandle, PlatformLoader, Symbol};
use crate::error::LoadError;

/// DLL symbols are always process-scoped, so the global request is moot.
#[derive(Debug, Default)]
pub struct DllLoader;

impl DllLoader {
    pub fn new() -> Self {
        Self
    }
}

impl PlatformLoader for DllLoader {
    fn name(&self) -> &'static str {
        "dll"
    }

    fn load(&self, path: &Path, _force_global: bool) -> Result<LoadHandle, LoadError> {
        // SAFETY: runs DllMain; bundles are trusted by the host that requested them.
        let library =
            unsafe { Library::new(path) }.map_err(|e| LoadError::from_library_error(path, &e))?;
        Ok(LoadHandle::new(path, library))
    }

    fn resolve_symbol(&self, handle: &LoadHandle, name: &str) -> Option<Symbol> {
        let library = handle.downcast_ref::<Library>()?;
        // SAFETY: the export is read as an address only.
        let symbol = unsafe { library.get::<*mut std::ffi::c_void>(name.as_bytes()) }.ok()?;
        Symbol::new(*symbol)
    }

    fn unload(&self, handle: LoadHandle) {
        let path = handle.path().to_path_buf();
        if let Some(library) = handle.into_inner::<Library>()
            && let Err(e) = library.close()
        {
            tracing::warn!(path = %path.display(), error = %e, "FreeLibrary failed");
        }
    }
}
