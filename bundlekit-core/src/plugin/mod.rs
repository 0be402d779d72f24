//! Plugin factories and instances
//!
//! A plugin bundle publishes factories, each identified by a UUID and able
//! to create instances of one or more types. This module provides:
//!
//! - [`FactoryRegistry`] - factory and type indexes behind a reentrant lock
//! - [`Factory`] - a creation function, direct or resolved lazily by name
//! - [`PluginInstance`] - a live object that keeps its bundle loaded
//! - [`PlugInData`] - per-bundle plugin state (instance count, load-on-demand)
//!
//! # Example
//!
//! ```ignore
//! use bundlekit_core::Runtime;
//!
//! let runtime = Runtime::global();
//! let bundle = runtime.bundle_with_path("/opt/bundles/Greeter.bundle").unwrap();
//! for factory in runtime.factories().find_factories_for_type(greeter_type) {
//!     if let Some(instance) = runtime.factories().create_instance(factory, greeter_type) {
//!         // use instance.get_interface(...)
//!     }
//! }
//! ```

mod factory;
mod host;
mod instance;
mod registry;

use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

pub use factory::{CreationFn, Factory};
pub use instance::PluginInstance;
pub use registry::FactoryRegistry;

/// Plugin state attached to a bundle that hosts factories.
///
/// Mutated only while the factory registry lock is held; the atomics let
/// readers peek without it.
#[derive(Debug, Default)]
pub struct PlugInData {
    load_on_demand: AtomicBool,
    doing_dynamic_registration: AtomicBool,
    needs_dynamic_registration: AtomicBool,
    registered: AtomicBool,
    instance_count: AtomicIsize,
    owned_factories: Mutex<Vec<Weak<Factory>>>,
}

impl PlugInData {
    pub fn is_load_on_demand(&self) -> bool {
        self.load_on_demand.load(Ordering::SeqCst)
    }

    pub fn is_doing_dynamic_registration(&self) -> bool {
        self.doing_dynamic_registration.load(Ordering::SeqCst)
    }

    pub fn needs_dynamic_registration(&self) -> bool {
        self.needs_dynamic_registration.load(Ordering::SeqCst)
    }

    /// Live instances created from this bundle's factories.
    pub fn instance_count(&self) -> isize {
        self.instance_count.load(Ordering::SeqCst)
    }

    /// Factories created on behalf of this bundle that are still alive.
    pub fn owned_factories(&self) -> Vec<Arc<Factory>> {
        self.owned_factories
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn adopt(&self, factory: &Arc<Factory>) {
        let mut owned = self.owned_factories.lock();
        owned.retain(|weak| weak.strong_count() > 0);
        if !owned.iter().any(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(factory))) {
            owned.push(Arc::downgrade(factory));
        }
    }

    fn disown(&self, factory: &Factory) {
        self.owned_factories
            .lock()
            .retain(|weak| weak.strong_count() > 0 && !std::ptr::eq(weak.as_ptr(), factory));
    }
}
