//! Bundles: on-disk packages of code and resources
//!
//! A [`Bundle`] is identified by its canonical location. Its layout and
//! manifest are read once at construction; the executable is classified
//! lazily and mapped on demand through the runtime's
//! [`PlatformLoader`](crate::loader::PlatformLoader).
//!
//! Load state transitions are serialized by a per-bundle lock. The lock is
//! never held while calling into the factory registry, so a bundle's
//! registration entry point can freely create instances.

pub mod layout;
pub mod manifest;

use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bundlekit_plugin_api::{API_VERSION, API_VERSION_SYMBOL, ApiVersionFn};
use parking_lot::Mutex;

use crate::error::{BundleError, LoadError, LoadErrorKind};
use crate::loader::{Architecture, BinaryFormat, LoadHandle, Symbol, format};
use crate::plugin::PlugInData;
use crate::runtime::RuntimeInner;

pub use layout::{BuiltinDir, LayoutVersion};
pub use manifest::{Manifest, PluginDeclaration};

/// Process-unique bundle identity, stable for the bundle's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleId(u64);

impl BundleId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct LoadState {
    format: BinaryFormat,
    handle: Option<LoadHandle>,
    /// Error of the most recent failed attempt, handed to callers that queued behind it.
    last_error: Option<BundleError>,
}

pub struct Bundle {
    id: BundleId,
    location: PathBuf,
    layout: LayoutVersion,
    manifest: Manifest,
    unique: bool,
    runtime: Weak<RuntimeInner>,
    executable: Mutex<Option<PathBuf>>,
    load: Mutex<LoadState>,
    failed_attempts: AtomicU64,
    loaded: AtomicBool,
    plugin: OnceLock<PlugInData>,
}

impl Bundle {
    /// Build a bundle for an already canonical `location`.
    ///
    /// Returns `None` only when nothing exists at `location`. Layout and
    /// manifest problems degrade to an unpackaged bundle with an empty
    /// manifest.
    pub(crate) fn construct(runtime: Weak<RuntimeInner>, location: &Path, unique: bool) -> Option<Self> {
        let metadata = match std::fs::metadata(location) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::debug!(path = %location.display(), error = %e, "No bundle at location");
                return None;
            }
        };
        let layout = if metadata.is_dir() {
            layout::detect(location)
        } else {
            LayoutVersion::SingleFile
        };
        let manifest = layout::manifest_path(location, layout)
            .filter(|path| path.is_file())
            .map(|path| Manifest::load(&path))
            .unwrap_or_else(Manifest::empty);

        tracing::debug!(
            path = %location.display(),
            layout = %layout,
            identifier = manifest.identifier().unwrap_or("-"),
            unique,
            "Constructed bundle"
        );
        Some(Self {
            id: BundleId::next(),
            location: location.to_path_buf(),
            layout,
            manifest,
            unique,
            runtime,
            executable: Mutex::new(None),
            load: Mutex::new(LoadState {
                format: BinaryFormat::Unknown,
                handle: None,
                last_error: None,
            }),
            failed_attempts: AtomicU64::new(0),
            loaded: AtomicBool::new(false),
            plugin: OnceLock::new(),
        })
    }

    fn runtime(&self) -> Option<Arc<RuntimeInner>> {
        self.runtime.upgrade()
    }

    pub fn id(&self) -> BundleId {
        self.id
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Layout version detected from the directory structure.
    pub fn layout_version(&self) -> LayoutVersion {
        self.layout
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn identifier(&self) -> Option<&str> {
        self.manifest.identifier()
    }

    pub fn version(&self) -> u32 {
        self.manifest.version()
    }

    /// Display name: the manifest `name`, else the location's file stem.
    pub fn name(&self) -> String {
        match self.manifest.name() {
            Some(name) => name.to_string(),
            None => self.file_stem(),
        }
    }

    fn file_stem(&self) -> String {
        self.location
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Name the executable is searched under.
    pub fn executable_name(&self) -> String {
        match self.manifest.executable_name() {
            Some(name) => name.to_string(),
            None => self.file_stem(),
        }
    }

    /// Whether this bundle lives outside the registry tables.
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Whether the executable is mapped. Does not take the load lock.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Plugin state, present once the bundle hosts factories.
    pub fn plugin(&self) -> Option<&PlugInData> {
        self.plugin.get()
    }

    pub(crate) fn plugin_or_init(&self) -> &PlugInData {
        self.plugin.get_or_init(PlugInData::default)
    }

    pub fn resources_dir(&self) -> Option<PathBuf> {
        layout::resources_dir(&self.location, self.layout)
    }

    pub fn support_files_dir(&self) -> Option<PathBuf> {
        layout::support_files_dir(&self.location, self.layout)
    }

    pub fn builtin_dir(&self, dir: BuiltinDir) -> Option<PathBuf> {
        layout::builtin_dir(&self.location, self.layout, dir)
    }

    /// Path of the executable, searched once and then cached.
    pub fn executable_path(&self) -> Option<PathBuf> {
        let mut cached = self.executable.lock();
        if cached.is_none() {
            *cached = layout::find_executable(&self.location, self.layout, &self.executable_name());
        }
        cached.clone()
    }

    /// Binary format of the executable, classified on first use.
    pub fn binary_format(&self) -> BinaryFormat {
        let executable = self.executable_path();
        let mut state = self.load.lock();
        self.classify_locked(&mut state, executable.as_deref())
    }

    fn classify_locked(&self, state: &mut LoadState, executable: Option<&Path>) -> BinaryFormat {
        if state.format == BinaryFormat::Unknown {
            state.format = match self.runtime() {
                Some(rt) => rt.loader.classify(executable),
                None => executable.map_or(BinaryFormat::None, format::sniff_format),
            };
        }
        state.format
    }

    /// CPU architectures the executable was built for.
    pub fn architectures(&self) -> Vec<Architecture> {
        self.executable_path()
            .map(|path| format::sniff_architectures(&path))
            .unwrap_or_default()
    }

    /// Layout version corrected for directories that only look like bundles.
    ///
    /// A flat layout with an empty manifest and no usable executable is
    /// reported as a single file.
    pub fn effective_layout_version(&self) -> LayoutVersion {
        if self.layout != LayoutVersion::Flat || !self.manifest.is_empty() {
            return self.layout;
        }
        if self.executable_path().is_none() {
            return LayoutVersion::SingleFile;
        }
        match self.binary_format() {
            BinaryFormat::LegacyCfm | BinaryFormat::Unreadable => LayoutVersion::SingleFile,
            _ => self.layout,
        }
    }

    /// Load using the configured symbol scoping.
    pub fn load(self: &Arc<Self>) -> Result<(), BundleError> {
        let force_global = self
            .runtime()
            .is_some_and(|rt| rt.config.loader.force_global_symbols);
        self.load_with(force_global)
    }

    /// Map the executable. Idempotent; concurrent callers load it once.
    pub fn load_with(self: &Arc<Self>, force_global: bool) -> Result<(), BundleError> {
        let Some(rt) = self.runtime() else {
            return Err(BundleError::new(
                LoadErrorKind::LoadFailed,
                &self.location,
                None,
                Some("runtime has been dropped".to_string()),
            ));
        };
        if self.is_loaded() {
            rt.bundles.unschedule_unload(self);
            return Ok(());
        }
        if !rt.bundles.is_draining() {
            rt.bundles.drain_scheduled_unloads();
        }

        let executable = self.executable_path();
        let seen = self.failed_attempts.load(Ordering::SeqCst);
        {
            let mut state = self.load.lock();
            if self.is_loaded() {
                drop(state);
                rt.bundles.unschedule_unload(self);
                return Ok(());
            }
            // An attempt failed while we waited for the lock: share its outcome.
            if self.failed_attempts.load(Ordering::SeqCst) != seen
                && let Some(err) = &state.last_error
            {
                return Err(err.clone());
            }
            let format = self.classify_locked(&mut state, executable.as_deref());
            match self.map_executable(&rt, format, executable.as_deref(), force_global) {
                Ok(handle) => {
                    state.handle = Some(handle);
                    state.last_error = None;
                    self.loaded.store(true, Ordering::SeqCst);
                }
                Err(err) => {
                    tracing::debug!(bundle = %self.location.display(), error = %err, "Bundle load failed");
                    let err = BundleError::from_load_error(&self.location, executable.as_deref(), &err);
                    state.last_error = Some(err.clone());
                    self.failed_attempts.fetch_add(1, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }

        tracing::debug!(
            bundle = %self.location.display(),
            loader = rt.loader.name(),
            force_global,
            "Bundle loaded"
        );
        rt.factories.notify_loaded(self);
        Ok(())
    }

    fn map_executable(
        &self,
        rt: &RuntimeInner,
        format: BinaryFormat,
        executable: Option<&Path>,
        force_global: bool,
    ) -> Result<LoadHandle, LoadError> {
        let Some(path) = executable else {
            return Err(LoadError::NotFound {
                path: self.location.clone(),
            });
        };
        match format {
            BinaryFormat::None => {
                return Err(LoadError::NotFound {
                    path: path.to_path_buf(),
                });
            }
            BinaryFormat::MachExecutable => {
                return Err(LoadError::not_loadable(path, "image is a standalone executable"));
            }
            BinaryFormat::LegacyCfm => {
                return Err(LoadError::not_loadable(path, "legacy code fragment format"));
            }
            _ => {}
        }

        let handle = rt.loader.load(path, force_global)?;
        if rt.config.loader.check_api_version
            && let Err(err) = Self::check_api_version(rt, &handle, path)
        {
            rt.loader.unload(handle);
            return Err(err);
        }
        Ok(handle)
    }

    fn check_api_version(rt: &RuntimeInner, handle: &LoadHandle, path: &Path) -> Result<(), LoadError> {
        let Some(symbol) = rt.loader.resolve_symbol(handle, API_VERSION_SYMBOL) else {
            return Ok(());
        };
        // SAFETY: the exported version function has the ApiVersionFn signature.
        let version_fn: ApiVersionFn = unsafe { symbol.cast() };
        let found = version_fn();
        if found == API_VERSION {
            Ok(())
        } else {
            Err(LoadError::RuntimeMismatch {
                path: path.to_path_buf(),
                expected: API_VERSION,
                found,
            })
        }
    }

    /// Load, logging instead of returning the failure.
    pub fn load_executable(self: &Arc<Self>) -> bool {
        match self.load() {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    bundle = %self.location.display(),
                    code = err.code(),
                    error = %err,
                    debug = err.debug.as_deref().unwrap_or(""),
                    "Cannot load bundle executable"
                );
                false
            }
        }
    }

    /// Check that the executable could be loaded, without mapping it.
    pub fn preflight(&self) -> Result<(), BundleError> {
        if self.is_loaded() {
            return Ok(());
        }
        let executable = self.executable_path();
        let format = {
            let mut state = self.load.lock();
            self.classify_locked(&mut state, executable.as_deref())
        };
        let result = match (executable.as_deref(), format) {
            (None, _) | (_, BinaryFormat::None) => Err(LoadError::NotFound {
                path: executable.clone().unwrap_or_else(|| self.location.clone()),
            }),
            (Some(path), BinaryFormat::MachExecutable) => {
                Err(LoadError::not_loadable(path, "image is a standalone executable"))
            }
            (Some(path), BinaryFormat::LegacyCfm) => Err(LoadError::not_loadable(path, "legacy code fragment format")),
            (Some(path), _) => match self.runtime() {
                Some(rt) => rt.loader.preflight(path),
                None => crate::loader::check_loadable(path),
            },
        };
        result.map_err(|err| BundleError::from_load_error(&self.location, executable.as_deref(), &err))
    }

    /// Unmap the executable after draining scheduled unloads.
    ///
    /// Trusts the caller: live plugin instances are not checked.
    pub fn unload(&self) {
        let Some(rt) = self.runtime() else {
            return;
        };
        if !rt.bundles.is_draining() {
            rt.bundles.drain_scheduled_unloads();
        }
        if !self.is_loaded() {
            return;
        }
        rt.bundles.unschedule_unload(self);

        rt.factories.notify_will_unload(self, || {
            let mut state = self.load.lock();
            let Some(handle) = state.handle.take() else {
                tracing::debug!(bundle = %self.location.display(), "Image was not mapped by this runtime");
                return;
            };
            rt.loader.unload(handle);
            self.loaded.store(false, Ordering::SeqCst);
            tracing::debug!(bundle = %self.location.display(), "Bundle unloaded");
        });
    }

    /// Resolve a function symbol, loading the executable if needed.
    pub fn function_pointer_for_name(self: &Arc<Self>, name: &str) -> Option<Symbol> {
        self.resolve(name)
    }

    /// Resolve a data symbol, loading the executable if needed.
    pub fn data_pointer_for_name(self: &Arc<Self>, name: &str) -> Option<*mut c_void> {
        self.resolve(name).map(Symbol::as_ptr)
    }

    fn resolve(self: &Arc<Self>, name: &str) -> Option<Symbol> {
        if !self.is_loaded() && !self.load_executable() {
            return None;
        }
        let rt = self.runtime()?;
        let state = self.load.lock();
        let handle = state.handle.as_ref()?;
        rt.loader.resolve_symbol(handle, name)
    }

    /// Mark as loaded without mapping anything. Used for the main program.
    pub(crate) fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::SeqCst);
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        let Some(handle) = self.load.get_mut().handle.take() else {
            return;
        };
        if let Some(rt) = self.runtime.upgrade() {
            tracing::debug!(bundle = %self.location.display(), "Unloading dropped bundle");
            rt.loader.unload(handle);
        }
    }
}

impl fmt::Debug for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundle")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("layout", &self.layout)
            .field("identifier", &self.identifier())
            .field("unique", &self.unique)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}
