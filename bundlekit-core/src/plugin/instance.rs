use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use bundlekit_plugin_api::{DestroyFn, GetInterfaceFn, RawUuid};
use uuid::Uuid;

use super::factory::Factory;
use super::registry::FactoryRegistry;
use crate::bundle::Bundle;
use crate::runtime::RuntimeInner;

enum Storage {
    /// Data allocated by the factory; released through `destroy`.
    Foreign(NonNull<c_void>),
    /// Zeroed bytes allocated by the host.
    Owned(NonNull<[u8]>),
}

/// A live object created by a factory.
///
/// While it exists the owning bundle's instance count includes it, so a
/// load-on-demand bundle stays loaded. Dropping it runs the destroy
/// callback and may schedule the bundle for unloading.
pub struct PluginInstance {
    factory: Arc<Factory>,
    owner: Option<Arc<Bundle>>,
    runtime: Weak<RuntimeInner>,
    storage: Storage,
    get_interface: Option<GetInterfaceFn>,
    destroy: Option<DestroyFn>,
}

// SAFETY: instance data is only touched through the factory's callbacks,
// which the plugin contract requires to be callable from any thread.
unsafe impl Send for PluginInstance {}

impl PluginInstance {
    /// Wrap data returned by a creation function. Counts against the owner.
    pub(super) fn adopt(
        registry: &FactoryRegistry,
        factory: Arc<Factory>,
        data: *mut c_void,
        get_interface: Option<GetInterfaceFn>,
        destroy: Option<DestroyFn>,
    ) -> Option<Self> {
        let data = NonNull::new(data)?;
        Some(Self::counted(registry, factory, Storage::Foreign(data), get_interface, destroy))
    }

    pub(super) fn with_storage(
        registry: &FactoryRegistry,
        factory: Arc<Factory>,
        size: usize,
        get_interface: Option<GetInterfaceFn>,
        destroy: Option<DestroyFn>,
    ) -> Self {
        let bytes = vec![0u8; size].into_boxed_slice();
        let storage = Storage::Owned(NonNull::from(Box::leak(bytes)));
        Self::counted(registry, factory, storage, get_interface, destroy)
    }

    fn counted(
        registry: &FactoryRegistry,
        factory: Arc<Factory>,
        storage: Storage,
        get_interface: Option<GetInterfaceFn>,
        destroy: Option<DestroyFn>,
    ) -> Self {
        let owner = factory.owner();
        if let Some(owner) = &owner {
            registry.add_instance(owner);
        }
        Self {
            factory,
            owner,
            runtime: registry.runtime_handle(),
            storage,
            get_interface,
            destroy,
        }
    }

    /// Host-side instance of `factory_id` with `size` zeroed bytes of private storage.
    pub fn with_data_size(
        factories: &FactoryRegistry,
        factory_id: Uuid,
        size: usize,
        get_interface: Option<GetInterfaceFn>,
        destroy: Option<DestroyFn>,
    ) -> Option<Self> {
        factories.create_instance_with_data_size(factory_id, size, get_interface, destroy)
    }

    pub fn factory_id(&self) -> Uuid {
        self.factory.id()
    }

    /// The factory id in its textual form.
    pub fn factory_name(&self) -> String {
        self.factory.id().hyphenated().to_string()
    }

    /// The factory that created this instance. It may have been unregistered since.
    pub fn factory(&self) -> &Arc<Factory> {
        &self.factory
    }

    /// Bundle that implements the instance, if any.
    pub fn owner(&self) -> Option<&Arc<Bundle>> {
        self.owner.as_ref()
    }

    /// Pointer to the instance-private data.
    pub fn data(&self) -> *mut c_void {
        match self.storage {
            Storage::Foreign(ptr) => ptr.as_ptr(),
            Storage::Owned(bytes) => bytes.as_ptr().cast::<c_void>(),
        }
    }

    /// Host-allocated storage, if this instance was created with a data size.
    pub fn data_bytes(&self) -> Option<&[u8]> {
        match self.storage {
            Storage::Foreign(_) => None,
            // SAFETY: the slice was leaked from a Box in `with_storage` and is
            // only reclaimed in Drop.
            Storage::Owned(bytes) => Some(unsafe { bytes.as_ref() }),
        }
    }

    /// Ask the instance for `interface`. `None` when it is not implemented.
    pub fn get_interface(&self, interface: Uuid) -> Option<NonNull<c_void>> {
        let get_interface = self.get_interface?;
        let raw = RawUuid::from(interface);
        // SAFETY: `data` is the pointer this callback was created with.
        NonNull::new(unsafe { get_interface(self.data(), &raw) })
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        let runtime = self.runtime.upgrade();
        let _guard = runtime.as_ref().map(|rt| rt.factories.lock());

        if let Some(destroy) = self.destroy {
            // SAFETY: the destroy callback pairs with the creation function
            // that produced this data, and runs exactly once.
            unsafe { destroy(self.data()) };
        }
        if let Storage::Owned(bytes) = self.storage {
            // SAFETY: leaked from a Box in `with_storage`; nothing else frees it.
            drop(unsafe { Box::from_raw(bytes.as_ptr()) });
        }
        if let (Some(rt), Some(owner)) = (&runtime, &self.owner) {
            rt.factories.remove_instance(owner);
        }
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("factory", &self.factory.id())
            .field("owner", &self.owner.as_ref().map(|b| b.location()))
            .field("data", &self.data())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::factory::CreationFn;
    use bundlekit_plugin_api::RawInstance;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DESTROYED: AtomicUsize = AtomicUsize::new(0);
    static BOXES_FREED: AtomicUsize = AtomicUsize::new(0);
    const ECHO: Uuid = Uuid::from_u128(0x1c1c_0000_0000_0000_0000_0000_0000_0001);

    unsafe extern "C" fn create_nothing(_type_id: *const RawUuid) -> RawInstance {
        RawInstance::null()
    }

    unsafe extern "C" fn count_destroy(_data: *mut c_void) {
        DESTROYED.fetch_add(1, Ordering::SeqCst);
    }

    unsafe extern "C" fn create_boxed(_type_id: *const RawUuid) -> RawInstance {
        RawInstance {
            data: Box::into_raw(Box::new(0u8)).cast::<c_void>(),
            get_interface: None,
            destroy: Some(destroy_boxed),
        }
    }

    unsafe extern "C" fn destroy_boxed(data: *mut c_void) {
        drop(unsafe { Box::from_raw(data.cast::<u8>()) });
        BOXES_FREED.fetch_add(1, Ordering::SeqCst);
    }

    unsafe extern "C" fn echo_interface(data: *mut c_void, interface: *const RawUuid) -> *mut c_void {
        if Uuid::from(unsafe { *interface }) == ECHO {
            data
        } else {
            std::ptr::null_mut()
        }
    }

    fn factory() -> Arc<Factory> {
        Arc::new(Factory::new(Uuid::new_v4(), CreationFn::Direct(create_nothing)))
    }

    #[test]
    fn owned_storage_is_zeroed_and_destroyed_once() {
        let registry = FactoryRegistry::new(Weak::new());
        let before = DESTROYED.load(Ordering::SeqCst);
        let instance = PluginInstance::with_storage(&registry, factory(), 8, None, Some(count_destroy));
        assert_eq!(instance.data_bytes(), Some(&[0u8; 8][..]));
        drop(instance);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn null_data_is_not_adopted() {
        let registry = FactoryRegistry::new(Weak::new());
        let instance = PluginInstance::adopt(&registry, factory(), std::ptr::null_mut(), None, None);
        assert!(instance.is_none());
    }

    #[test]
    fn interfaces_are_looked_up_through_the_callback() {
        let registry = FactoryRegistry::new(Weak::new());
        let instance = PluginInstance::with_storage(&registry, factory(), 4, Some(echo_interface), None);
        assert_eq!(
            instance.get_interface(ECHO).map(NonNull::as_ptr),
            Some(instance.data())
        );
        assert!(instance.get_interface(Uuid::new_v4()).is_none());
    }

    #[test]
    fn drop_reenters_a_held_registry_lock() {
        let runtime = crate::Runtime::with_loader(
            crate::RuntimeConfig::default(),
            Arc::new(crate::MockLoader::new()),
        );
        let factories = runtime.factories();
        let id = Uuid::new_v4();
        let ty = Uuid::new_v4();
        factories.register_factory(id, create_boxed);
        factories.register_type(id, ty);

        let instance = factories.create_instance(id, ty).unwrap();
        {
            let _guard = factories.lock();
            drop(instance);
        }
        assert_eq!(BOXES_FREED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_interface_callback_yields_none() {
        let registry = FactoryRegistry::new(Weak::new());
        let instance = PluginInstance::with_storage(&registry, factory(), 0, None, None);
        assert!(instance.get_interface(ECHO).is_none());
        assert!(instance.owner().is_none());
    }
}
