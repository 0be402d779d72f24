//! Safe wrapper over [`RegistrationContext`] for plugin authors.

use std::ffi::{CString, c_void};
use std::ptr::NonNull;

use uuid::Uuid;

use crate::abi::{FactoryFn, HostApi, RegistrationContext};

/// Handle given to a bundle's dynamic registration function.
///
/// Only valid while the registration call is running.
#[derive(Clone, Copy)]
pub struct Registrar<'a> {
    ctx: &'a RegistrationContext,
    api: &'a HostApi,
}

impl<'a> Registrar<'a> {
    /// Wrap the raw context handed to a registration entry point.
    ///
    /// # Safety
    ///
    /// `ctx` must be null or point to a context provided by the host that
    /// stays valid for `'a`.
    pub unsafe fn from_raw(ctx: *const RegistrationContext) -> Option<Self> {
        // SAFETY: the caller guarantees the pointer is null or valid for 'a.
        let ctx = unsafe { ctx.as_ref()? };
        // SAFETY: the host always fills `api` with a pointer to a static table.
        let api = unsafe { ctx.api.as_ref()? };
        Some(Self { ctx, api })
    }

    /// API version the host was built against.
    pub fn host_api_version(&self) -> u32 {
        self.api.api_version
    }

    /// Register a factory backed by a function in this image.
    pub fn register_factory(&self, factory: Uuid, create: FactoryFn) -> bool {
        // SAFETY: ctx came from the host and is live for 'a.
        unsafe { (self.api.register_factory)(self.ctx, factory.into(), create) }
    }

    /// Register a factory whose creation function is resolved lazily by symbol name.
    pub fn register_factory_by_name(&self, factory: Uuid, symbol: &str) -> bool {
        let Ok(symbol) = CString::new(symbol) else {
            return false;
        };
        // SAFETY: ctx is live and symbol outlives the call.
        unsafe { (self.api.register_factory_by_name)(self.ctx, factory.into(), symbol.as_ptr()) }
    }

    /// Declare that `factory` can create instances of `type_id`.
    pub fn register_type(&self, factory: Uuid, type_id: Uuid) -> bool {
        // SAFETY: ctx came from the host and is live for 'a.
        unsafe { (self.api.register_type)(self.ctx, factory.into(), type_id.into()) }
    }

    pub fn unregister_factory(&self, factory: Uuid) -> bool {
        // SAFETY: ctx came from the host and is live for 'a.
        unsafe { (self.api.unregister_factory)(self.ctx, factory.into()) }
    }

    /// Opt this bundle in or out of unloading once it has no live instances.
    pub fn set_load_on_demand(&self, flag: bool) {
        // SAFETY: ctx came from the host and is live for 'a.
        unsafe { (self.api.set_load_on_demand)(self.ctx, flag) }
    }

    /// Create an instance through the host's factory registry.
    pub fn create_instance(&self, factory: Uuid, type_id: Uuid) -> Option<HostInstance<'a>> {
        // SAFETY: ctx came from the host and is live for 'a.
        let raw = unsafe { (self.api.create_instance)(self.ctx, factory.into(), type_id.into()) };
        NonNull::new(raw).map(|raw| HostInstance {
            api: self.api,
            raw,
        })
    }
}

/// An instance owned by the host, released when dropped.
pub struct HostInstance<'a> {
    api: &'a HostApi,
    raw: NonNull<c_void>,
}

impl HostInstance<'_> {
    /// The instance-private data returned by the factory.
    pub fn data(&self) -> *mut c_void {
        // SAFETY: raw was produced by the host's create_instance and not yet released.
        unsafe { (self.api.instance_data)(self.raw.as_ptr()) }
    }
}

impl Drop for HostInstance<'_> {
    fn drop(&mut self) {
        // SAFETY: raw is released exactly once here.
        unsafe { (self.api.release_instance)(self.raw.as_ptr()) }
    }
}
