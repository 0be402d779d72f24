use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use bundlekit_plugin_api::{
    DEFAULT_REGISTER_SYMBOL, DestroyFn, DynamicRegisterFn, FactoryFn, GetInterfaceFn, RawUuid,
};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use uuid::Uuid;

use super::factory::{CreationFn, Factory};
use super::instance::PluginInstance;
use super::{PlugInData, host};
use crate::bundle::Bundle;
use crate::runtime::RuntimeInner;

#[derive(Default)]
pub(crate) struct FactoryTables {
    by_id: HashMap<Uuid, Arc<Factory>>,
    by_type: HashMap<Uuid, Vec<Arc<Factory>>>,
}

/// Process-wide factory and type indexes.
///
/// The lock is reentrant: a bundle's registration entry point runs with
/// the lock held and calls straight back into `register_factory` and
/// friends. `RefCell` borrows are never held across such a callout.
pub struct FactoryRegistry {
    tables: ReentrantMutex<RefCell<FactoryTables>>,
    runtime: Weak<RuntimeInner>,
}

pub(crate) type TablesGuard<'a> = ReentrantMutexGuard<'a, RefCell<FactoryTables>>;

impl FactoryRegistry {
    pub(crate) fn new(runtime: Weak<RuntimeInner>) -> Self {
        Self {
            tables: ReentrantMutex::new(RefCell::new(FactoryTables::default())),
            runtime,
        }
    }

    pub(crate) fn lock(&self) -> TablesGuard<'_> {
        self.tables.lock()
    }

    pub(crate) fn runtime(&self) -> Option<Arc<RuntimeInner>> {
        self.runtime.upgrade()
    }

    pub(super) fn runtime_handle(&self) -> Weak<RuntimeInner> {
        self.runtime.clone()
    }

    /// Register a factory backed by a function in this process.
    pub fn register_factory(&self, id: Uuid, create: FactoryFn) -> bool {
        self.upsert(id, CreationFn::Direct(create));
        true
    }

    /// Register a factory whose creation function is `symbol` inside `bundle`.
    ///
    /// An empty symbol registers a factory that cannot create instances
    /// until it is registered again.
    pub fn register_factory_by_name(&self, id: Uuid, bundle: &Arc<Bundle>, symbol: &str) -> bool {
        self.upsert(id, CreationFn::by_name(bundle, symbol));
        true
    }

    fn upsert(&self, id: Uuid, creation: CreationFn) -> Arc<Factory> {
        let guard = self.lock();
        let new_owner = creation.owner().cloned();
        let existing = guard.borrow().by_id.get(&id).cloned();
        match existing {
            Some(factory) => {
                let old_owner = factory.replace_creation(creation);
                let same_owner = match (&old_owner, &new_owner) {
                    (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                    (None, None) => true,
                    _ => false,
                };
                if !same_owner {
                    if let Some(plugin) = old_owner.as_ref().and_then(|b| b.plugin()) {
                        plugin.disown(&factory);
                    }
                    if let Some(owner) = &new_owner {
                        owner.plugin_or_init().adopt(&factory);
                    }
                }
                tracing::debug!(factory = %id, "Replaced factory creation function");
                factory
            }
            None => {
                let factory = Arc::new(Factory::new(id, creation));
                guard.borrow_mut().by_id.insert(id, Arc::clone(&factory));
                if let Some(owner) = &new_owner {
                    owner.plugin_or_init().adopt(&factory);
                }
                tracing::debug!(factory = %id, "Registered factory");
                factory
            }
        }
    }

    /// Declare that `factory_id` can create `type_id`.
    pub fn register_type(&self, factory_id: Uuid, type_id: Uuid) -> bool {
        let guard = self.lock();
        let Some(factory) = guard.borrow().by_id.get(&factory_id).cloned() else {
            tracing::warn!(factory = %factory_id, r#type = %type_id, "Cannot register type for unknown factory");
            return false;
        };
        if factory.add_type(type_id) {
            guard
                .borrow_mut()
                .by_type
                .entry(type_id)
                .or_default()
                .push(factory);
        }
        true
    }

    pub fn unregister_type(&self, factory_id: Uuid, type_id: Uuid) -> bool {
        let guard = self.lock();
        let Some(factory) = guard.borrow().by_id.get(&factory_id).cloned() else {
            tracing::warn!(factory = %factory_id, "Cannot unregister type for unknown factory");
            return false;
        };
        if factory.remove_type(&type_id) {
            Self::remove_from_type_index(&mut guard.borrow_mut(), &factory, &type_id);
        }
        true
    }

    fn remove_from_type_index(tables: &mut FactoryTables, factory: &Arc<Factory>, type_id: &Uuid) {
        if let Some(list) = tables.by_type.get_mut(type_id) {
            list.retain(|f| !Arc::ptr_eq(f, factory));
            if list.is_empty() {
                tables.by_type.remove(type_id);
            }
        }
    }

    /// Disable a factory and sever it from every index.
    ///
    /// Instances created earlier stay valid and can still be dropped.
    pub fn unregister_factory(&self, id: Uuid) -> bool {
        let guard = self.lock();
        let Some(factory) = guard.borrow_mut().by_id.remove(&id) else {
            tracing::warn!(factory = %id, "Cannot unregister unknown factory");
            return false;
        };
        let (types, owner) = factory.disable();
        {
            let mut tables = guard.borrow_mut();
            for type_id in &types {
                Self::remove_from_type_index(&mut tables, &factory, type_id);
            }
        }
        if let Some(plugin) = owner.as_ref().and_then(|b| b.plugin()) {
            plugin.disown(&factory);
        }
        tracing::debug!(factory = %id, "Unregistered factory");
        true
    }

    /// The enabled factory registered under `id`.
    pub fn factory(&self, id: Uuid) -> Option<Arc<Factory>> {
        let guard = self.lock();
        let factory = guard.borrow().by_id.get(&id).cloned();
        factory
    }

    pub fn factory_ids(&self) -> Vec<Uuid> {
        let guard = self.lock();
        let ids = guard.borrow().by_id.keys().copied().collect();
        ids
    }

    pub fn find_factories_for_type(&self, type_id: Uuid) -> Vec<Uuid> {
        let guard = self.lock();
        let ids = guard
            .borrow()
            .by_type
            .get(&type_id)
            .map(|list| list.iter().map(|f| f.id()).collect())
            .unwrap_or_default();
        ids
    }

    /// Factories for `type_id` implemented by `bundle`.
    pub fn find_factories_for_type_in_plugin(&self, type_id: Uuid, bundle: &Arc<Bundle>) -> Vec<Uuid> {
        let guard = self.lock();
        let candidates: Vec<Arc<Factory>> = guard.borrow().by_type.get(&type_id).cloned().unwrap_or_default();
        drop(guard);
        candidates
            .iter()
            .filter(|f| f.owner().is_some_and(|owner| Arc::ptr_eq(&owner, bundle)))
            .map(|f| f.id())
            .collect()
    }

    /// Create an instance of `type_id` from `factory_id`.
    ///
    /// May load the factory's bundle. Failures are logged and yield `None`.
    pub fn create_instance(&self, factory_id: Uuid, type_id: Uuid) -> Option<PluginInstance> {
        let guard = self.lock();
        let Some(factory) = guard.borrow().by_id.get(&factory_id).cloned() else {
            tracing::warn!(factory = %factory_id, "Cannot find factory");
            return None;
        };
        if !factory.supports(&type_id) {
            tracing::warn!(factory = %factory_id, r#type = %type_id, "Factory does not support type");
            return None;
        }
        let Some(create) = factory.creation_function() else {
            tracing::error!(factory = %factory_id, "Factory has no usable creation function");
            return None;
        };

        let raw_type = RawUuid::from(type_id);
        // SAFETY: creation functions follow the FactoryFn contract and the
        // owning image stays loaded while the lock is held.
        let raw = unsafe { create(&raw_type) };
        if raw.is_null() {
            tracing::debug!(factory = %factory_id, r#type = %type_id, "Factory returned no instance");
            return None;
        }
        let instance = PluginInstance::adopt(self, factory, raw.data, raw.get_interface, raw.destroy);
        drop(guard);
        instance
    }

    /// Create an instance whose private storage is `size` zeroed bytes
    /// owned by the host.
    pub fn create_instance_with_data_size(
        &self,
        factory_id: Uuid,
        size: usize,
        get_interface: Option<GetInterfaceFn>,
        destroy: Option<DestroyFn>,
    ) -> Option<PluginInstance> {
        let guard = self.lock();
        let Some(factory) = guard.borrow().by_id.get(&factory_id).cloned() else {
            tracing::warn!(factory = %factory_id, "Cannot find factory");
            return None;
        };
        let instance = PluginInstance::with_storage(self, factory, size, get_interface, destroy);
        drop(guard);
        Some(instance)
    }

    /// Count a new instance against the factory's bundle.
    pub fn add_instance_for_factory(&self, factory_id: Uuid) -> bool {
        let Some(owner) = self.factory(factory_id).and_then(|f| f.owner()) else {
            return false;
        };
        self.add_instance(&owner);
        true
    }

    /// Release an instance counted with [`add_instance_for_factory`](Self::add_instance_for_factory).
    pub fn remove_instance_for_factory(&self, factory_id: Uuid) -> bool {
        let Some(owner) = self.factory(factory_id).and_then(|f| f.owner()) else {
            return false;
        };
        self.remove_instance(&owner);
        true
    }

    pub(crate) fn add_instance(&self, owner: &Arc<Bundle>) {
        let _guard = self.lock();
        let Some(plugin) = owner.plugin() else {
            return;
        };
        if plugin.instance_count() == 0
            && plugin.is_load_on_demand()
            && let Some(rt) = self.runtime()
        {
            rt.bundles.unschedule_unload(owner);
        }
        plugin.instance_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn remove_instance(&self, owner: &Arc<Bundle>) {
        let _guard = self.lock();
        let Some(plugin) = owner.plugin() else {
            return;
        };
        let count = plugin.instance_count();
        if count <= 0 {
            tracing::error!(bundle = %owner.location().display(), "Instance count underflow");
            return;
        }
        plugin.instance_count.store(count - 1, Ordering::SeqCst);
        if count == 1
            && plugin.is_load_on_demand()
            && let Some(rt) = self.runtime()
        {
            // The caller may be running code from the bundle itself, so only schedule.
            rt.bundles.schedule_unload(owner);
        }
    }

    /// Set whether `bundle` unloads once its last instance goes away.
    ///
    /// Turning it on with no live instances unloads now; turning it off
    /// loads the bundle.
    pub fn set_load_on_demand(&self, bundle: &Arc<Bundle>, flag: bool) {
        let Some(plugin) = bundle.plugin() else {
            return;
        };
        let unload_now = {
            let _guard = self.lock();
            plugin.load_on_demand.store(flag, Ordering::SeqCst);
            flag && !plugin.is_doing_dynamic_registration() && plugin.instance_count() == 0
        };
        if unload_now {
            bundle.unload();
        } else if !flag {
            bundle.load_executable();
        }
    }

    pub fn is_load_on_demand(&self, bundle: &Bundle) -> bool {
        bundle.plugin().is_some_and(PlugInData::is_load_on_demand)
    }

    /// Register the static factories and types declared in `bundle`'s manifest.
    ///
    /// Runs at most once per bundle. Callers that arrive while another thread
    /// is registering block on the table lock and return once it is done.
    /// Dynamic registration is deferred until the bundle is loaded.
    pub(crate) fn init_plugin(&self, bundle: &Arc<Bundle>) {
        if bundle.plugin().is_some_and(|p| p.registered.load(Ordering::SeqCst)) {
            return;
        }
        let Some(declaration) = bundle.manifest().plugin() else {
            return;
        };
        {
            let _guard = self.lock();
            let plugin = bundle.plugin_or_init();
            if plugin.registered.load(Ordering::SeqCst) {
                return;
            }
            plugin.load_on_demand.store(true, Ordering::SeqCst);
            for (factory, symbol) in &declaration.factories {
                self.register_factory_by_name(*factory, bundle, symbol);
            }
            for (type_id, factories) in &declaration.types {
                for factory in factories {
                    self.register_type(*factory, *type_id);
                }
            }
            if declaration.dynamic_registration {
                plugin.needs_dynamic_registration.store(true, Ordering::SeqCst);
            }
            plugin.registered.store(true, Ordering::SeqCst);
        }
        tracing::info!(
            bundle = %bundle.location().display(),
            factories = declaration.factories.len(),
            dynamic = declaration.dynamic_registration,
            "Plugin registered"
        );

        if declaration.dynamic_registration && bundle.is_loaded() {
            self.notify_loaded(bundle);
        }
    }

    /// Run pending dynamic registration for a bundle that just loaded.
    pub(crate) fn notify_loaded(&self, bundle: &Arc<Bundle>) {
        let Some(plugin) = bundle.plugin() else {
            return;
        };
        if !bundle.is_loaded() {
            return;
        }
        let unload_now = {
            let _guard = self.lock();
            if plugin.is_doing_dynamic_registration() {
                return;
            }
            if !plugin.needs_dynamic_registration.swap(false, Ordering::SeqCst) {
                return;
            }
            plugin.load_on_demand.store(false, Ordering::SeqCst);
            plugin.doing_dynamic_registration.store(true, Ordering::SeqCst);
            self.run_dynamic_registration(bundle);
            plugin.doing_dynamic_registration.store(false, Ordering::SeqCst);
            plugin.is_load_on_demand() && plugin.instance_count() == 0
        };
        if unload_now {
            tracing::debug!(bundle = %bundle.location().display(), "Unloading after registration");
            bundle.unload();
        }
    }

    fn run_dynamic_registration(&self, bundle: &Arc<Bundle>) {
        let symbol = bundle
            .manifest()
            .plugin()
            .and_then(|declaration| declaration.register_function)
            .unwrap_or_else(|| DEFAULT_REGISTER_SYMBOL.to_string());
        let Some(address) = bundle.function_pointer_for_name(&symbol) else {
            tracing::debug!(
                bundle = %bundle.location().display(),
                symbol = %symbol,
                "No dynamic registration entry point"
            );
            return;
        };
        // SAFETY: the registration entry point has the DynamicRegisterFn signature.
        let register: DynamicRegisterFn = unsafe { address.cast() };
        host::call_registration(self, bundle, register);
    }

    /// Flush cached creation functions of `bundle`'s factories, then run
    /// `unload` with the lock still held so nothing re-resolves in between.
    pub(crate) fn notify_will_unload(&self, bundle: &Bundle, unload: impl FnOnce()) {
        let _guard = self.lock();
        if let Some(plugin) = bundle.plugin() {
            for factory in plugin.owned_factories() {
                factory.flush_resolved();
            }
        }
        unload();
    }
}
