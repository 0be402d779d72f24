//! Platform loader abstraction
//!
//! A [`PlatformLoader`] maps native images into the process, resolves
//! symbols and unmaps them again. One loader is chosen per runtime:
//!
//! - [`DlfcnLoader`] - POSIX `dlopen` with explicit symbol scoping
//! - [`ImageLoader`] - portable loader; framework images stay mapped
//! - `DllLoader` - Windows `LoadLibrary` (Windows only)
//! - [`MockLoader`] - in-process symbol tables for tests

#[cfg(unix)]
mod dlfcn;
#[cfg(windows)]
mod dll;
pub mod format;
mod image;
pub mod mock;

use std::any::Any;
use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[cfg(unix)]
pub use dlfcn::DlfcnLoader;
#[cfg(windows)]
pub use dll::DllLoader;
pub use format::{Architecture, BinaryFormat};
pub use image::ImageLoader;
pub use mock::{MockImage, MockLoader};

use crate::error::LoadError;

/// Opaque handle to an image mapped by a loader.
///
/// Each back end stores its own library type inside and downcasts it back.
pub struct LoadHandle {
    path: PathBuf,
    inner: Box<dyn Any + Send + Sync>,
}

impl LoadHandle {
    pub fn new<T: Any + Send + Sync>(path: &Path, inner: T) -> Self {
        Self {
            path: path.to_path_buf(),
            inner: Box::new(inner),
        }
    }

    /// Path the image was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }

    pub fn into_inner<T: Any>(self) -> Option<T> {
        self.inner.downcast().ok().map(|inner| *inner)
    }
}

impl fmt::Debug for LoadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadHandle").field("path", &self.path).finish_non_exhaustive()
    }
}

/// Address of a resolved symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol(NonNull<c_void>);

// SAFETY: a symbol is a plain code or data address; it carries no thread affinity.
unsafe impl Send for Symbol {}
// SAFETY: as above, the address itself is immutable.
unsafe impl Sync for Symbol {}

impl Symbol {
    pub fn new(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }

    /// Reinterpret the address as a function pointer type.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type matching the symbol's real
    /// signature, and the image must stay loaded while it is called.
    pub unsafe fn cast<F: Copy>(self) -> F {
        assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*mut c_void>());
        let ptr = self.as_ptr();
        // SAFETY: sizes match and the caller vouches for the signature.
        unsafe { std::mem::transmute_copy::<*mut c_void, F>(&ptr) }
    }
}

/// Strategy for mapping native images into the process.
pub trait PlatformLoader: Send + Sync {
    /// Short name used in logs and config.
    fn name(&self) -> &'static str;

    /// Classify the executable without loading it.
    fn classify(&self, executable: Option<&Path>) -> BinaryFormat {
        match executable {
            Some(path) => format::sniff_format(path),
            None => BinaryFormat::None,
        }
    }

    /// Map the image at `path`. Blocks until the platform loader returns.
    fn load(&self, path: &Path, force_global: bool) -> Result<LoadHandle, LoadError>;

    fn resolve_symbol(&self, handle: &LoadHandle, name: &str) -> Option<Symbol>;

    /// Check that `path` could be loaded, without mapping it.
    fn preflight(&self, path: &Path) -> Result<(), LoadError> {
        check_loadable(path)
    }

    /// Unmap an image. A back end without an unload primitive may leak it.
    fn unload(&self, handle: LoadHandle);

    /// Paths of images already mapped into the process, if the platform can tell.
    fn loaded_images(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Header-level loadability check shared by the native back ends.
pub fn check_loadable(path: &Path) -> Result<(), LoadError> {
    if !path.is_file() {
        return Err(LoadError::NotFound {
            path: path.to_path_buf(),
        });
    }
    match format::sniff_format(path) {
        BinaryFormat::MachExecutable => {
            return Err(LoadError::not_loadable(path, "image is a standalone executable"));
        }
        BinaryFormat::LegacyCfm => {
            return Err(LoadError::not_loadable(path, "legacy code fragment format"));
        }
        BinaryFormat::Unreadable => {
            return Err(LoadError::not_loadable(path, "unrecognized image format"));
        }
        BinaryFormat::Unknown => {
            return Err(LoadError::LoadFailed {
                path: path.to_path_buf(),
                message: "image header could not be read".to_string(),
            });
        }
        _ => {}
    }
    let archs = format::sniff_architectures(path);
    if let Some(host) = Architecture::host()
        && !archs.is_empty()
        && !archs.contains(&host)
    {
        return Err(LoadError::ArchitectureMismatch {
            path: path.to_path_buf(),
            host: host.to_string(),
        });
    }
    Ok(())
}

/// Which loader back end a runtime uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoaderBackend {
    /// The native loader of the current platform.
    #[default]
    Auto,
    Dlfcn,
    Image,
    Dll,
}

/// Build the loader for `backend`, falling back to the platform default
/// when the requested one does not exist here.
pub fn platform_loader(backend: LoaderBackend) -> Arc<dyn PlatformLoader> {
    match backend {
        LoaderBackend::Auto => default_loader(),
        LoaderBackend::Image => Arc::new(ImageLoader::new()),
        #[cfg(unix)]
        LoaderBackend::Dlfcn => Arc::new(DlfcnLoader::new()),
        #[cfg(windows)]
        LoaderBackend::Dll => Arc::new(DllLoader::new()),
        #[allow(unreachable_patterns)]
        other => {
            tracing::warn!(backend = ?other, "Loader back end unavailable on this platform, using default");
            default_loader()
        }
    }
}

#[cfg(unix)]
fn default_loader() -> Arc<dyn PlatformLoader> {
    Arc::new(DlfcnLoader::new())
}

#[cfg(windows)]
fn default_loader() -> Arc<dyn PlatformLoader> {
    Arc::new(DllLoader::new())
}

#[cfg(not(any(unix, windows)))]
fn default_loader() -> Arc<dyn PlatformLoader> {
    Arc::new(ImageLoader::new())
}
