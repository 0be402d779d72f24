//! Factory registration, instance bookkeeping and load-on-demand

mod common;

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use bundlekit_core::MockImage;
use bundlekit_plugin_api::{
    DEFAULT_REGISTER_SYMBOL, RawInstance, RawUuid, Registrar, RegistrationContext,
};
use common::Fixture;
use uuid::Uuid;

const WIDGET_FACTORY: Uuid = Uuid::from_u128(0x6e2f_8f42_0000_4000_8000_0000_0000_0001);
const WIDGET_TYPE: Uuid = Uuid::from_u128(0x0b8c_3a10_0000_4000_8000_0000_0000_0002);
const GADGET_TYPE: Uuid = Uuid::from_u128(0x0b8c_3a10_0000_4000_8000_0000_0000_0003);

unsafe extern "C" fn make_widget(_type_id: *const RawUuid) -> RawInstance {
    RawInstance {
        data: Box::into_raw(Box::new(7u32)).cast::<c_void>(),
        get_interface: None,
        destroy: Some(destroy_widget),
    }
}

unsafe extern "C" fn destroy_widget(data: *mut c_void) {
    drop(unsafe { Box::from_raw(data.cast::<u32>()) });
}

fn widget_image() -> MockImage {
    MockImage::new().with_symbol("make_widget", make_widget as *const c_void)
}

fn static_manifest(with_type: bool) -> String {
    let mut manifest = format!(
        "identifier = \"org.example.widgets\"\n\n[plugin.factories]\n\"{WIDGET_FACTORY}\" = \"make_widget\"\n"
    );
    if with_type {
        manifest.push_str(&format!("\n[plugin.types]\n\"{WIDGET_TYPE}\" = \"{WIDGET_FACTORY}\"\n"));
    }
    manifest
}

#[test]
fn factory_needs_a_registered_type() {
    let fx = Fixture::new();
    let location = fx.install("Gated", &static_manifest(false), widget_image());
    let bundle = fx.runtime.bundle_with_path(&location).unwrap();
    let factories = fx.runtime.factories();

    assert!(factories.create_instance(WIDGET_FACTORY, WIDGET_TYPE).is_none());
    assert!(!bundle.is_loaded());

    assert!(factories.register_type(WIDGET_FACTORY, WIDGET_TYPE));
    let instance = factories.create_instance(WIDGET_FACTORY, WIDGET_TYPE).unwrap();
    assert_eq!(bundle.plugin().unwrap().instance_count(), 1);
    assert!(bundle.is_loaded());
    assert_eq!(unsafe { *instance.data().cast::<u32>() }, 7);
    assert!(Arc::ptr_eq(instance.owner().unwrap(), &bundle));
}

#[test]
fn racing_lookups_see_registered_factories() {
    let fx = Fixture::new();
    let location = fx.install("Raced", &static_manifest(true), widget_image());
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let runtime = fx.runtime.clone();
            let location = location.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let bundle = runtime.bundle_with_path(&location).unwrap();
                assert_eq!(runtime.factories().find_factories_for_type(WIDGET_TYPE), vec![WIDGET_FACTORY]);
                bundle
            })
        })
        .collect();
    let bundles: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for bundle in &bundles {
        assert!(Arc::ptr_eq(bundle, &bundles[0]));
    }
    assert_eq!(fx.runtime.bundles().len(), 1);
    assert_eq!(fx.runtime.factories().find_factories_for_type(WIDGET_TYPE), vec![WIDGET_FACTORY]);
    assert_eq!(fx.loader.load_count(), 0);
}

#[test]
fn manifest_declares_factories_and_types() {
    let fx = Fixture::new();
    let location = fx.install("Declared", &static_manifest(true), widget_image());
    let bundle = fx.runtime.bundle_with_path(&location).unwrap();
    let factories = fx.runtime.factories();

    assert_eq!(factories.find_factories_for_type(WIDGET_TYPE), vec![WIDGET_FACTORY]);
    assert_eq!(
        factories.find_factories_for_type_in_plugin(WIDGET_TYPE, &bundle),
        vec![WIDGET_FACTORY]
    );
    let factory = factories.factory(WIDGET_FACTORY).unwrap();
    assert_eq!(factory.symbol_name().as_deref(), Some("make_widget"));
    assert!(factories.is_load_on_demand(&bundle));
    // Registration alone never loads the bundle.
    assert_eq!(fx.loader.load_count(), 0);
}

#[test]
fn last_instance_schedules_unload() {
    let fx = Fixture::new();
    let location = fx.install("Deferred", &static_manifest(true), widget_image());
    let bundle = fx.runtime.bundle_with_path(&location).unwrap();
    let factories = fx.runtime.factories();

    let instance = factories.create_instance(WIDGET_FACTORY, WIDGET_TYPE).unwrap();
    assert!(bundle.is_loaded());

    // With an instance alive, neither the policy nor a drain unloads it.
    factories.set_load_on_demand(&bundle, true);
    fx.runtime.drain_scheduled_unloads();
    assert!(bundle.is_loaded());

    drop(instance);
    assert_eq!(bundle.plugin().unwrap().instance_count(), 0);
    assert!(fx.runtime.bundles().is_scheduled(&bundle));
    assert!(bundle.is_loaded());

    fx.runtime.drain_scheduled_unloads();
    assert!(!bundle.is_loaded());
    assert_eq!(fx.loader.unload_count(), 1);
}

#[test]
fn new_instance_cancels_a_scheduled_unload() {
    let fx = Fixture::new();
    let location = fx.install("Revived", &static_manifest(true), widget_image());
    let bundle = fx.runtime.bundle_with_path(&location).unwrap();
    let factories = fx.runtime.factories();

    drop(factories.create_instance(WIDGET_FACTORY, WIDGET_TYPE).unwrap());
    assert!(fx.runtime.bundles().is_scheduled(&bundle));

    let instance = factories.create_instance(WIDGET_FACTORY, WIDGET_TYPE).unwrap();
    assert!(!fx.runtime.bundles().is_scheduled(&bundle));
    fx.runtime.drain_scheduled_unloads();
    assert!(bundle.is_loaded());
    drop(instance);
}

#[test]
fn unload_flushes_resolved_creation_functions() {
    let fx = Fixture::new();
    let location = fx.install("Flushed", &static_manifest(true), widget_image());
    let bundle = fx.runtime.bundle_with_path(&location).unwrap();
    let factories = fx.runtime.factories();

    drop(factories.create_instance(WIDGET_FACTORY, WIDGET_TYPE).unwrap());
    fx.runtime.drain_scheduled_unloads();
    assert!(!bundle.is_loaded());

    // Creating again has to resolve (and load) from scratch.
    let instance = factories.create_instance(WIDGET_FACTORY, WIDGET_TYPE).unwrap();
    assert!(bundle.is_loaded());
    assert_eq!(fx.loader.load_count(), 2);
    drop(instance);
}

#[test]
fn unregistered_factory_disappears_but_instances_survive() {
    let fx = Fixture::new();
    let location = fx.install("Retired", &static_manifest(true), widget_image());
    let bundle = fx.runtime.bundle_with_path(&location).unwrap();
    let factories = fx.runtime.factories();

    let instance = factories.create_instance(WIDGET_FACTORY, WIDGET_TYPE).unwrap();

    assert!(factories.unregister_factory(WIDGET_FACTORY));
    assert!(factories.find_factories_for_type(WIDGET_TYPE).is_empty());
    assert!(factories.create_instance(WIDGET_FACTORY, WIDGET_TYPE).is_none());
    assert!(!instance.factory().is_enabled());
    assert!(bundle.plugin().unwrap().owned_factories().is_empty());

    drop(instance);
    assert_eq!(bundle.plugin().unwrap().instance_count(), 0);
}

#[test]
fn counting_helpers_track_the_owner() {
    let fx = Fixture::new();
    let location = fx.install("Counted", &static_manifest(true), widget_image());
    let bundle = fx.runtime.bundle_with_path(&location).unwrap();
    let factories = fx.runtime.factories();

    assert!(factories.add_instance_for_factory(WIDGET_FACTORY));
    assert_eq!(bundle.plugin().unwrap().instance_count(), 1);
    assert!(factories.remove_instance_for_factory(WIDGET_FACTORY));
    assert_eq!(bundle.plugin().unwrap().instance_count(), 0);
    // Never goes negative.
    assert!(factories.remove_instance_for_factory(WIDGET_FACTORY));
    assert_eq!(bundle.plugin().unwrap().instance_count(), 0);
    assert!(!factories.add_instance_for_factory(Uuid::new_v4()));
}

#[test]
fn host_allocated_instance_counts_against_owner() {
    let fx = Fixture::new();
    let location = fx.install("Sized", &static_manifest(true), widget_image());
    let bundle = fx.runtime.bundle_with_path(&location).unwrap();

    let instance =
        bundlekit_core::PluginInstance::with_data_size(fx.runtime.factories(), WIDGET_FACTORY, 32, None, None)
            .unwrap();
    assert_eq!(instance.data_bytes().unwrap().len(), 32);
    assert_eq!(instance.factory_name(), WIDGET_FACTORY.to_string());
    assert_eq!(bundle.plugin().unwrap().instance_count(), 1);
    drop(instance);
    assert_eq!(bundle.plugin().unwrap().instance_count(), 0);
}

static REGISTRATIONS: AtomicUsize = AtomicUsize::new(0);
static NESTED_CREATE_OK: AtomicBool = AtomicBool::new(false);

unsafe extern "C" fn register_and_create(ctx: *const RegistrationContext) {
    REGISTRATIONS.fetch_add(1, Ordering::SeqCst);
    let Some(registrar) = (unsafe { Registrar::from_raw(ctx) }) else {
        return;
    };
    registrar.register_factory_by_name(WIDGET_FACTORY, "make_widget");
    registrar.register_type(WIDGET_FACTORY, GADGET_TYPE);
    // Re-enters the factory lock held by the host during registration.
    if let Some(instance) = registrar.create_instance(WIDGET_FACTORY, GADGET_TYPE) {
        NESTED_CREATE_OK.store(!instance.data().is_null(), Ordering::SeqCst);
    }
}

unsafe extern "C" fn register_for_one_shot(ctx: *const RegistrationContext) {
    let Some(registrar) = (unsafe { Registrar::from_raw(ctx) }) else {
        return;
    };
    registrar.register_factory_by_name(WIDGET_FACTORY, "make_widget");
    registrar.register_type(WIDGET_FACTORY, WIDGET_TYPE);
    registrar.set_load_on_demand(true);
}

#[test]
fn dynamic_registration_can_create_instances() {
    let fx = Fixture::new();
    let image = widget_image().with_symbol(DEFAULT_REGISTER_SYMBOL, register_and_create as *const c_void);
    let location = fx.install(
        "Dynamic",
        "identifier = \"org.example.dynamic\"\n\n[plugin]\ndynamic-registration = \"YES\"\n",
        image,
    );
    let bundle = fx.runtime.bundle_with_path(&location).unwrap();
    let before = REGISTRATIONS.load(Ordering::SeqCst);

    // Deferred until the bundle is loaded.
    assert!(fx.runtime.factories().find_factories_for_type(GADGET_TYPE).is_empty());
    bundle.load().unwrap();

    assert_eq!(REGISTRATIONS.load(Ordering::SeqCst), before + 1);
    assert!(NESTED_CREATE_OK.load(Ordering::SeqCst));
    assert_eq!(
        fx.runtime.factories().find_factories_for_type(GADGET_TYPE),
        vec![WIDGET_FACTORY]
    );
    assert_eq!(bundle.plugin().unwrap().instance_count(), 0);
    // Registration turns load-on-demand off, so the bundle stays put.
    assert!(bundle.is_loaded());

    bundle.unload();
    bundle.load().unwrap();
    assert_eq!(REGISTRATIONS.load(Ordering::SeqCst), before + 1);
}

#[test]
fn registration_only_load_is_undone() {
    let fx = Fixture::new();
    let image = widget_image().with_symbol("custom_register", register_for_one_shot as *const c_void);
    let location = fx.install(
        "OneShot",
        "[plugin]\ndynamic-registration = true\ndynamic-register-function = \"custom_register\"\n",
        image,
    );
    let bundle = fx.runtime.bundle_with_path(&location).unwrap();

    bundle.load().unwrap();
    assert!(!bundle.is_loaded());
    assert_eq!(fx.loader.unload_count(), 1);
    assert_eq!(
        fx.runtime.factories().find_factories_for_type(WIDGET_TYPE),
        vec![WIDGET_FACTORY]
    );

    // The factory still works; creating loads the bundle again.
    let instance = fx.runtime.factories().create_instance(WIDGET_FACTORY, WIDGET_TYPE).unwrap();
    assert!(bundle.is_loaded());
    drop(instance);
}
