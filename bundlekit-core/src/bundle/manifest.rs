//! `Info.toml` manifest parsing

use std::collections::BTreeMap;
use std::path::Path;

use bundlekit_plugin_api::{keys, plugin_id};
use serde::Deserialize;
use uuid::Uuid;

/// Key/value metadata read once from a bundle's manifest file.
///
/// Missing or malformed files produce an empty manifest; bundles without
/// metadata are legal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    table: toml::Table,
}

/// Factory and type declarations from the `[plugin]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginDeclaration {
    /// Factory id to creation symbol name.
    pub factories: Vec<(Uuid, String)>,
    /// Type id to the factories that support it.
    pub types: Vec<(Uuid, Vec<Uuid>)>,
    pub dynamic_registration: bool,
    pub register_function: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawPluginSection {
    factories: Option<BTreeMap<String, String>>,
    #[serde(default)]
    types: BTreeMap<String, OneOrMany>,
    #[serde(default)]
    dynamic_registration: Flag,
    dynamic_register_function: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
}

impl Default for Flag {
    fn default() -> Self {
        Self::Bool(false)
    }
}

impl Flag {
    fn is_set(&self) -> bool {
        match self {
            Self::Bool(value) => *value,
            Self::Text(text) => text.eq_ignore_ascii_case("yes"),
        }
    }
}

impl Manifest {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Read the manifest at `path`, degrading to empty on any failure.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::empty(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot read manifest");
                return Self::empty();
            }
        };
        match Self::from_toml_str(&content) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Malformed manifest, ignoring");
                Self::empty()
            }
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        Ok(Self {
            table: content.parse()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Raw access to any top-level key.
    pub fn get(&self, key: &str) -> Option<&toml::Value> {
        self.table.get(key)
    }

    pub fn table(&self) -> &toml::Table {
        &self.table
    }

    fn string(&self, key: &str) -> Option<&str> {
        self.table.get(key)?.as_str().filter(|s| !s.is_empty())
    }

    pub fn identifier(&self) -> Option<&str> {
        self.string(keys::IDENTIFIER)
    }

    pub fn name(&self) -> Option<&str> {
        self.string(keys::NAME)
    }

    pub fn executable_name(&self) -> Option<&str> {
        self.string(keys::EXECUTABLE)
    }

    /// Declared version packed into an ordinal; 0 when absent.
    pub fn version(&self) -> u32 {
        match self.table.get(keys::VERSION) {
            Some(toml::Value::Integer(n)) => u32::try_from(*n).unwrap_or(if *n < 0 { 0 } else { u32::MAX }),
            Some(toml::Value::String(text)) => parse_version(text),
            _ => 0,
        }
    }

    /// The raw `version` value, for display.
    pub fn version_string(&self) -> Option<String> {
        match self.table.get(keys::VERSION)? {
            toml::Value::String(text) => Some(text.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Plugin declarations, if this bundle is a plugin host.
    ///
    /// A bundle is a plugin host when it has a factories table or asks
    /// for dynamic registration.
    pub fn plugin(&self) -> Option<PluginDeclaration> {
        let section = self.table.get(keys::PLUGIN)?;
        let raw: RawPluginSection = match section.clone().try_into() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed [plugin] table");
                return None;
            }
        };
        let dynamic_registration = raw.dynamic_registration.is_set();
        if raw.factories.is_none() && !dynamic_registration {
            return None;
        }
        Some(PluginDeclaration {
            factories: raw
                .factories
                .unwrap_or_default()
                .into_iter()
                .map(|(id, symbol)| (plugin_id(&id), symbol))
                .collect(),
            types: raw
                .types
                .into_iter()
                .map(|(id, factories)| {
                    let factories = match factories {
                        OneOrMany::One(one) => vec![plugin_id(&one)],
                        OneOrMany::Many(many) => many.iter().map(|f| plugin_id(f)).collect(),
                    };
                    (plugin_id(&id), factories)
                })
                .collect(),
            dynamic_registration,
            register_function: raw.dynamic_register_function.filter(|name| !name.is_empty()),
        })
    }
}

/// Pack a dotted version string as `major << 16 | minor << 8 | patch`.
///
/// Leading digits of each component count; the rest is ignored. Minor and
/// patch saturate at 255, major at 65535.
pub fn parse_version(text: &str) -> u32 {
    let mut parts = text.trim().split('.').map(|part| {
        let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
        digits.parse::<u32>().unwrap_or(0)
    });
    let major = parts.next().unwrap_or(0).min(0xffff);
    let minor = parts.next().unwrap_or(0).min(0xff);
    let patch = parts.next().unwrap_or(0).min(0xff);
    major << 16 | minor << 8 | patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(Manifest::load(&dir.path().join("Info.toml")).is_empty());
    }

    #[test]
    fn malformed_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Info.toml");
        std::fs::write(&path, "identifier = [unterminated").unwrap();
        assert!(Manifest::load(&path).is_empty());
    }

    #[test]
    fn reads_top_level_keys() {
        let manifest = Manifest::from_toml_str(
            r#"
identifier = "org.example.greeter"
name = "Greeter"
executable = "greet"
version = "2.1.3"
"#,
        )
        .unwrap();
        assert_eq!(manifest.identifier(), Some("org.example.greeter"));
        assert_eq!(manifest.name(), Some("Greeter"));
        assert_eq!(manifest.executable_name(), Some("greet"));
        assert_eq!(manifest.version(), 2 << 16 | 1 << 8 | 3);
        assert_eq!(manifest.version_string().as_deref(), Some("2.1.3"));
    }

    #[test]
    fn integer_versions_are_used_directly() {
        let manifest = Manifest::from_toml_str("version = 5").unwrap();
        assert_eq!(manifest.version(), 5);
        assert_eq!(Manifest::empty().version(), 0);
    }

    #[test]
    fn parse_version_saturates() {
        assert_eq!(parse_version("1"), 1 << 16);
        assert_eq!(parse_version("1.300.2"), 1 << 16 | 255 << 8 | 2);
        assert_eq!(parse_version("3.0b2"), 3 << 16);
        assert_eq!(parse_version("garbage"), 0);
    }

    #[test]
    fn non_plugin_bundle_has_no_declaration() {
        let manifest = Manifest::from_toml_str("identifier = \"a\"").unwrap();
        assert!(manifest.plugin().is_none());
        let types_only = Manifest::from_toml_str("[plugin.types]\nt = \"f\"").unwrap();
        assert!(types_only.plugin().is_none());
    }

    #[test]
    fn static_plugin_tables_parse() {
        let factory = Uuid::new_v4();
        let other = Uuid::new_v4();
        let ty = Uuid::new_v4();
        let manifest = Manifest::from_toml_str(&format!(
            r#"
[plugin.factories]
"{factory}" = "create_greeter"
"{other}" = "create_other"

[plugin.types]
"{ty}" = ["{factory}", "{other}"]
"org.example.single" = "{factory}"
"#
        ))
        .unwrap();
        let plugin = manifest.plugin().unwrap();
        assert!(!plugin.dynamic_registration);
        assert_eq!(plugin.factories.len(), 2);
        assert!(plugin.factories.contains(&(factory, "create_greeter".to_string())));
        let typed = plugin.types.iter().find(|(id, _)| *id == ty).unwrap();
        assert_eq!(typed.1, vec![factory, other]);
        let single = plugin
            .types
            .iter()
            .find(|(id, _)| *id == plugin_id("org.example.single"))
            .unwrap();
        assert_eq!(single.1, vec![factory]);
    }

    #[test]
    fn dynamic_registration_flag_accepts_yes() {
        let manifest = Manifest::from_toml_str(
            "[plugin]\ndynamic-registration = \"Yes\"\ndynamic-register-function = \"reg\"",
        )
        .unwrap();
        let plugin = manifest.plugin().unwrap();
        assert!(plugin.dynamic_registration);
        assert_eq!(plugin.register_function.as_deref(), Some("reg"));

        let off = Manifest::from_toml_str("[plugin]\ndynamic-registration = \"NO\"").unwrap();
        assert!(off.plugin().is_none());
    }
}
