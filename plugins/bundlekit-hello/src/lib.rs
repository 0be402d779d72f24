//! bundlekit-hello - sample plugin bundle
//!
//! Publishes a greeter through two factories: one declared in `Info.toml`
//! and resolved by symbol name, one registered from the dynamic
//! registration entry point.

use std::ffi::{c_char, c_void};

use bundlekit_plugin_api::{
    RawInstance, RawUuid, Registrar, export_api_version, export_dynamic_register, plugin_id,
};
use uuid::Uuid;

pub const GREETER_TYPE: &str = "org.example.greeter";
pub const STATIC_FACTORY: &str = "org.example.hello.static-factory";
pub const DYNAMIC_FACTORY: &str = "org.example.hello.dynamic-factory";
/// Interface exposing [`GreeterVtable`].
pub const GREETER_INTERFACE: &str = "org.example.greeter.v1";

/// Function table returned for [`GREETER_INTERFACE`].
#[repr(C)]
pub struct GreeterVtable {
    pub greeting: unsafe extern "C" fn(data: *mut c_void) -> *const c_char,
}

struct Greeter {
    greeting: &'static [u8],
}

static VTABLE: GreeterVtable = GreeterVtable { greeting };

unsafe extern "C" fn greeting(data: *mut c_void) -> *const c_char {
    // SAFETY: data is a Greeter created by `new_instance`.
    let greeter = unsafe { &*data.cast::<Greeter>() };
    greeter.greeting.as_ptr().cast::<c_char>()
}

unsafe extern "C" fn get_interface(_data: *mut c_void, interface: *const RawUuid) -> *mut c_void {
    // SAFETY: the host passes a valid id for the duration of the call.
    let Some(interface) = (unsafe { interface.as_ref() }) else {
        return std::ptr::null_mut();
    };
    if Uuid::from(*interface) == plugin_id(GREETER_INTERFACE) {
        (&raw const VTABLE).cast_mut().cast::<c_void>()
    } else {
        std::ptr::null_mut()
    }
}

unsafe extern "C" fn destroy(data: *mut c_void) {
    // SAFETY: data was produced by Box::into_raw in `new_instance`.
    drop(unsafe { Box::from_raw(data.cast::<Greeter>()) });
}

fn new_instance(type_id: *const RawUuid, greeting: &'static [u8]) -> RawInstance {
    // SAFETY: the host passes a valid id for the duration of the call.
    let wanted = unsafe { type_id.as_ref() }.map(|raw| Uuid::from(*raw));
    if wanted != Some(plugin_id(GREETER_TYPE)) {
        return RawInstance::null();
    }
    RawInstance {
        data: Box::into_raw(Box::new(Greeter { greeting })).cast::<c_void>(),
        get_interface: Some(get_interface),
        destroy: Some(destroy),
    }
}

/// Creation function named in `Info.toml`.
///
/// # Safety
///
/// `type_id` must be null or point to a valid id.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hello_create_static(type_id: *const RawUuid) -> RawInstance {
    new_instance(type_id, b"hello from a declared factory\0")
}

unsafe extern "C" fn hello_create_dynamic(type_id: *const RawUuid) -> RawInstance {
    new_instance(type_id, b"hello from a registered factory\0")
}

fn register(registrar: &Registrar<'_>) {
    let factory = plugin_id(DYNAMIC_FACTORY);
    if !registrar.register_factory(factory, hello_create_dynamic) {
        tracing::warn!("Host refused the hello factory");
        return;
    }
    registrar.register_type(factory, plugin_id(GREETER_TYPE));
    tracing::debug!(host_api = registrar.host_api_version(), "Registered hello factory");
}

export_api_version!();
export_dynamic_register!(register);
