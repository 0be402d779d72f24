//! bundlekit-plugin-api - the contract between bundlekit hosts and plugin bundles
//!
//! A plugin bundle is a directory containing an `Info.toml` manifest and a
//! native dynamic library. The library publishes factories, either statically
//! through the manifest's `[plugin.factories]` table or dynamically from a
//! registration entry point the host calls right after loading it.
//!
//! # Example
//!
//! ```ignore
//! use bundlekit_plugin_api::{RawInstance, RawUuid, Registrar, plugin_id};
//! use bundlekit_plugin_api::{export_api_version, export_dynamic_register};
//!
//! unsafe extern "C" fn create_greeter(_type_id: *const RawUuid) -> RawInstance {
//!     RawInstance::null()
//! }
//!
//! fn register(registrar: &Registrar<'_>) {
//!     let factory = plugin_id("org.example.greeter.factory");
//!     registrar.register_factory(factory, create_greeter);
//!     registrar.register_type(factory, plugin_id("org.example.greeter"));
//! }
//!
//! export_api_version!();
//! export_dynamic_register!(register);
//! ```

pub mod abi;
pub mod keys;
pub mod registrar;

pub use abi::{
    ApiVersionFn, DestroyFn, DynamicRegisterFn, FactoryFn, GetInterfaceFn, HostApi, RawInstance,
    RawUuid, RegistrationContext,
};
pub use registrar::{HostInstance, Registrar};

use uuid::Uuid;

/// Current plugin ABI version. Bundles exporting a different value are rejected.
pub const API_VERSION: u32 = 1;

/// Symbol a bundle exports to report the ABI version it was built against.
pub const API_VERSION_SYMBOL: &str = "bundlekit_api_version";

/// Registration entry point used when the manifest does not name one.
pub const DEFAULT_REGISTER_SYMBOL: &str = "bundlekit_dynamic_register";

/// Turn a manifest identifier into a factory or type id.
///
/// UUID strings parse as themselves. Anything else maps to a stable
/// name-based UUID so that plain names can be used as identifiers.
pub fn plugin_id(value: &str) -> Uuid {
    Uuid::parse_str(value).unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, value.as_bytes()))
}

/// Export the ABI version function the host checks after loading.
#[macro_export]
macro_rules! export_api_version {
    () => {
        #[unsafe(no_mangle)]
        pub extern "C" fn bundlekit_api_version() -> u32 {
            $crate::API_VERSION
        }
    };
}

/// Export the default dynamic registration entry point.
///
/// The argument is a function taking `&Registrar<'_>`.
#[macro_export]
macro_rules! export_dynamic_register {
    ($register:path) => {
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn bundlekit_dynamic_register(
            ctx: *const $crate::RegistrationContext,
        ) {
            // SAFETY: the host passes a context that is valid for this call.
            if let Some(registrar) = unsafe { $crate::Registrar::from_raw(ctx) } {
                $register(&registrar);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_version_is_set() {
        assert_eq!(API_VERSION, 1);
    }

    #[test]
    fn test_plugin_id_parses_uuid_strings() {
        let id = Uuid::new_v4();
        assert_eq!(plugin_id(&id.to_string()), id);
        assert_eq!(plugin_id(&id.hyphenated().to_string().to_uppercase()), id);
    }

    #[test]
    fn test_plugin_id_is_stable_for_names() {
        let a = plugin_id("org.example.greeter");
        let b = plugin_id("org.example.greeter");
        assert_eq!(a, b);
        assert_ne!(a, plugin_id("org.example.other"));
    }

    #[test]
    fn test_registrar_rejects_null_context() {
        assert!(unsafe { Registrar::from_raw(std::ptr::null()) }.is_none());
    }
}
