//! Host side of the dynamic registration ABI.
//!
//! A bundle's registration entry point receives a [`RegistrationContext`]
//! whose `host` pointer refers to a [`HostContext`] living on the caller's
//! stack. Every callback converts it back and forwards to the registry.
//! Panics never unwind into plugin code.

use std::ffi::{CStr, c_char, c_void};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bundlekit_plugin_api::{API_VERSION, DynamicRegisterFn, FactoryFn, HostApi, RawUuid, RegistrationContext};
use uuid::Uuid;

use super::instance::PluginInstance;
use super::registry::FactoryRegistry;
use crate::bundle::Bundle;

struct HostContext<'a> {
    factories: &'a FactoryRegistry,
    bundle: &'a Arc<Bundle>,
}

static HOST_API: HostApi = HostApi {
    api_version: API_VERSION,
    register_factory,
    register_factory_by_name,
    register_type,
    unregister_factory,
    set_load_on_demand,
    create_instance,
    instance_data,
    release_instance,
};

/// Invoke `register` for `bundle` with the host callbacks wired to `factories`.
pub(super) fn call_registration(factories: &FactoryRegistry, bundle: &Arc<Bundle>, register: DynamicRegisterFn) {
    let host = HostContext { factories, bundle };
    let ctx = RegistrationContext {
        host: (&raw const host).cast::<c_void>(),
        api: &raw const HOST_API,
    };
    tracing::debug!(bundle = %bundle.location().display(), "Running dynamic registration");
    // SAFETY: `ctx` and `host` outlive the call; the entry point must not retain them.
    unsafe { register(&ctx) };
}

fn guarded<T>(callback: &str, fallback: T, f: impl FnOnce() -> T) -> T {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            tracing::error!(callback, "Host callback panicked");
            fallback
        }
    }
}

/// # Safety
///
/// `ctx` must be the context passed to a running registration entry point.
unsafe fn host_context<'a>(ctx: *const RegistrationContext) -> Option<&'a HostContext<'a>> {
    // SAFETY: guaranteed by the caller.
    let ctx = unsafe { ctx.as_ref()? };
    // SAFETY: `host` was created from a HostContext in `call_registration`.
    unsafe { ctx.host.cast::<HostContext<'a>>().as_ref() }
}

unsafe extern "C" fn register_factory(ctx: *const RegistrationContext, factory: RawUuid, create: FactoryFn) -> bool {
    guarded("register_factory", false, || {
        // SAFETY: only reachable through HOST_API during registration.
        let Some(host) = (unsafe { host_context(ctx) }) else {
            return false;
        };
        host.factories.register_factory(Uuid::from(factory), create)
    })
}

unsafe extern "C" fn register_factory_by_name(
    ctx: *const RegistrationContext,
    factory: RawUuid,
    symbol: *const c_char,
) -> bool {
    guarded("register_factory_by_name", false, || {
        // SAFETY: only reachable through HOST_API during registration.
        let Some(host) = (unsafe { host_context(ctx) }) else {
            return false;
        };
        let symbol = if symbol.is_null() {
            String::new()
        } else {
            // SAFETY: the plugin passes a NUL-terminated string.
            unsafe { CStr::from_ptr(symbol) }.to_string_lossy().into_owned()
        };
        host.factories
            .register_factory_by_name(Uuid::from(factory), host.bundle, &symbol)
    })
}

unsafe extern "C" fn register_type(ctx: *const RegistrationContext, factory: RawUuid, type_id: RawUuid) -> bool {
    guarded("register_type", false, || {
        // SAFETY: only reachable through HOST_API during registration.
        let Some(host) = (unsafe { host_context(ctx) }) else {
            return false;
        };
        host.factories
            .register_type(Uuid::from(factory), Uuid::from(type_id))
    })
}

unsafe extern "C" fn unregister_factory(ctx: *const RegistrationContext, factory: RawUuid) -> bool {
    guarded("unregister_factory", false, || {
        // SAFETY: only reachable through HOST_API during registration.
        let Some(host) = (unsafe { host_context(ctx) }) else {
            return false;
        };
        host.factories.unregister_factory(Uuid::from(factory))
    })
}

unsafe extern "C" fn set_load_on_demand(ctx: *const RegistrationContext, flag: bool) {
    guarded("set_load_on_demand", (), || {
        // SAFETY: only reachable through HOST_API during registration.
        if let Some(host) = unsafe { host_context(ctx) } {
            host.factories.set_load_on_demand(host.bundle, flag);
        }
    })
}

unsafe extern "C" fn create_instance(ctx: *const RegistrationContext, factory: RawUuid, type_id: RawUuid) -> *mut c_void {
    guarded("create_instance", std::ptr::null_mut(), || {
        // SAFETY: only reachable through HOST_API during registration.
        let Some(host) = (unsafe { host_context(ctx) }) else {
            return std::ptr::null_mut();
        };
        match host
            .factories
            .create_instance(Uuid::from(factory), Uuid::from(type_id))
        {
            Some(instance) => Box::into_raw(Box::new(instance)).cast::<c_void>(),
            None => std::ptr::null_mut(),
        }
    })
}

unsafe extern "C" fn instance_data(instance: *mut c_void) -> *mut c_void {
    guarded("instance_data", std::ptr::null_mut(), || {
        // SAFETY: `instance` came from `create_instance` and has not been released.
        match unsafe { instance.cast::<PluginInstance>().as_ref() } {
            Some(instance) => instance.data(),
            None => std::ptr::null_mut(),
        }
    })
}

unsafe extern "C" fn release_instance(instance: *mut c_void) {
    guarded("release_instance", (), || {
        if instance.is_null() {
            return;
        }
        // SAFETY: `instance` came from `create_instance` and is released once.
        drop(unsafe { Box::from_raw(instance.cast::<PluginInstance>()) });
    })
}
