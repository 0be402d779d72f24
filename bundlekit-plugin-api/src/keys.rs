//! Manifest key names.
//!
//! Top-level keys live at the root of `Info.toml`; plugin keys live in its
//! `[plugin]` table.

pub const MANIFEST_FILE: &str = "Info.toml";

pub const IDENTIFIER: &str = "identifier";
pub const VERSION: &str = "version";
pub const NAME: &str = "name";
pub const EXECUTABLE: &str = "executable";

pub const PLUGIN: &str = "plugin";
pub const FACTORIES: &str = "factories";
pub const TYPES: &str = "types";
pub const DYNAMIC_REGISTRATION: &str = "dynamic-registration";
pub const DYNAMIC_REGISTER_FUNCTION: &str = "dynamic-register-function";
