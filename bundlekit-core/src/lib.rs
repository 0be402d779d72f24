//! bundlekit-core: bundle loading and plugin factories
//!
//! This crate maps packaged native code into a process and lets bundles
//! publish factories that create typed plugin instances:
//!
//! - **Bundles** - [`Bundle`] for an on-disk package, its layout, manifest and load state
//! - **Registry** - [`BundleRegistry`] caching bundles by location and identifier
//! - **Factories** - [`FactoryRegistry`], [`Factory`] and [`PluginInstance`]
//! - **Loaders** - [`PlatformLoader`] back ends, including [`MockLoader`] for tests
//! - **Runtime** - [`Runtime`] tying one of each together
//!
//! # Quick Start
//!
//! ```no_run
//! use bundlekit_core::Runtime;
//!
//! let runtime = Runtime::global();
//! if let Some(bundle) = runtime.bundle_with_path("/opt/bundles/Hello.bundle") {
//!     match bundle.load() {
//!         Ok(()) => println!("loaded {}", bundle.name()),
//!         Err(e) => eprintln!("{} (code {})", e, e.code()),
//!     }
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── Runtime ────────────────────────────┐
//! │                                                                 │
//! │  BundleRegistry ──owns──▶ Bundle ──load/unload──▶ PlatformLoader │
//! │   (leaf lock)              │ (per-bundle load lock)             │
//! │                            │ PlugInData                         │
//! │                            ▼                                    │
//! │  FactoryRegistry ──▶ Factory ──create──▶ PluginInstance          │
//! │   (reentrant lock)                                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Lock order is factory lock, then a bundle's load lock. The registry
//! lock is only held around table access.

pub mod bundle;
pub mod config;
pub mod error;
pub mod loader;
pub mod plugin;
pub mod registry;
pub mod runtime;

// Re-export key types for convenience
pub use bundle::{BuiltinDir, Bundle, BundleId, LayoutVersion, Manifest, PluginDeclaration};
pub use config::{ConfigLoader, RuntimeConfig};
pub use error::{BundleError, ConfigError, LoadError, LoadErrorKind};
pub use loader::{
    Architecture, BinaryFormat, LoadHandle, LoaderBackend, MockImage, MockLoader, PlatformLoader, Symbol,
};
pub use plugin::{CreationFn, Factory, FactoryRegistry, PlugInData, PluginInstance};
pub use registry::BundleRegistry;
pub use runtime::Runtime;
