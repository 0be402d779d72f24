//! Raw types that cross the host/plugin boundary.
//!
//! Everything here is `#[repr(C)]` so that a bundle built by a different
//! compiler version can still talk to the host.

use std::ffi::{c_char, c_void};

use uuid::Uuid;

/// A 16-byte identifier as passed over the C ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RawUuid {
    pub bytes: [u8; 16],
}

impl From<Uuid> for RawUuid {
    fn from(id: Uuid) -> Self {
        Self {
            bytes: *id.as_bytes(),
        }
    }
}

impl From<RawUuid> for Uuid {
    fn from(raw: RawUuid) -> Self {
        Uuid::from_bytes(raw.bytes)
    }
}

/// Looks up an interface on an instance. Returns null when unsupported.
pub type GetInterfaceFn =
    unsafe extern "C" fn(data: *mut c_void, interface: *const RawUuid) -> *mut c_void;

/// Releases the instance-private data of an instance.
pub type DestroyFn = unsafe extern "C" fn(data: *mut c_void);

/// What a factory function hands back to the host.
///
/// A null `data` pointer means the factory declined to create an instance.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawInstance {
    pub data: *mut c_void,
    pub get_interface: Option<GetInterfaceFn>,
    pub destroy: Option<DestroyFn>,
}

impl RawInstance {
    pub const fn null() -> Self {
        Self {
            data: std::ptr::null_mut(),
            get_interface: None,
            destroy: None,
        }
    }

    pub fn is_null(&self) -> bool {
        self.data.is_null()
    }
}

/// Creation function published by a factory.
pub type FactoryFn = unsafe extern "C" fn(type_id: *const RawUuid) -> RawInstance;

/// Entry point a bundle exports to register factories at load time.
pub type DynamicRegisterFn = unsafe extern "C" fn(ctx: *const RegistrationContext);

/// Signature of the exported API version function.
pub type ApiVersionFn = extern "C" fn() -> u32;

/// Argument passed to a bundle's dynamic registration entry point.
///
/// `host` is opaque to the plugin and only meaningful to the callbacks in
/// `api`. Both pointers are valid for the duration of the call only.
#[repr(C)]
pub struct RegistrationContext {
    pub host: *const c_void,
    pub api: *const HostApi,
}

/// Callbacks a plugin uses to talk back to the host while registering.
#[repr(C)]
pub struct HostApi {
    pub api_version: u32,
    pub register_factory:
        unsafe extern "C" fn(ctx: *const RegistrationContext, factory: RawUuid, create: FactoryFn) -> bool,
    pub register_factory_by_name: unsafe extern "C" fn(
        ctx: *const RegistrationContext,
        factory: RawUuid,
        symbol: *const c_char,
    ) -> bool,
    pub register_type:
        unsafe extern "C" fn(ctx: *const RegistrationContext, factory: RawUuid, type_id: RawUuid) -> bool,
    pub unregister_factory:
        unsafe extern "C" fn(ctx: *const RegistrationContext, factory: RawUuid) -> bool,
    pub set_load_on_demand: unsafe extern "C" fn(ctx: *const RegistrationContext, flag: bool),
    pub create_instance: unsafe extern "C" fn(
        ctx: *const RegistrationContext,
        factory: RawUuid,
        type_id: RawUuid,
    ) -> *mut c_void,
    pub instance_data: unsafe extern "C" fn(instance: *mut c_void) -> *mut c_void,
    pub release_instance: unsafe extern "C" fn(instance: *mut c_void),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_uuid_preserves_bytes() {
        let id = Uuid::new_v4();
        let raw = RawUuid::from(id);
        assert_eq!(raw.bytes, *id.as_bytes());
        assert_eq!(Uuid::from(raw), id);
    }

    #[test]
    fn null_instance_is_null() {
        assert!(RawInstance::null().is_null());
    }

    #[test]
    fn raw_uuid_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<RawUuid>(), 16);
    }
}
