//! Configuration loading and validation (TOML file, key/value properties).

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use crate::callbacks::Callback;
use crate::error::{MilepostError, Result};
use crate::resolver::MigrationResolver;
use crate::version::{Target, VersionKey};

/// Default description stored with a baseline marker.
pub const DEFAULT_BASELINE_DESCRIPTION: &str = "<< Baseline >>";

/// A place migration scripts are read from: `[<scheme>:]<path>`.
///
/// `classpath` (the default when no scheme is given) is resolved against the
/// process working directory as a package-style resource root; `filesystem`
/// is an absolute or relative directory path taken as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Classpath(String),
    Filesystem(String),
}

impl Location {
    /// Parse a location spec, defaulting to the classpath scheme.
    pub fn parse(spec: &str) -> Location {
        if let Some(path) = spec.strip_prefix("filesystem:") {
            Location::Filesystem(path.to_string())
        } else if let Some(path) = spec.strip_prefix("classpath:") {
            Location::Classpath(path.to_string())
        } else {
            Location::Classpath(spec.to_string())
        }
    }

    /// The directory this location scans.
    pub fn dir(&self) -> PathBuf {
        match self {
            Location::Classpath(path) => PathBuf::from(path),
            Location::Filesystem(path) => PathBuf::from(path),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Classpath(path) => write!(f, "classpath:{}", path),
            Location::Filesystem(path) => write!(f, "filesystem:{}", path),
        }
    }
}

/// Immutable parameter bundle consumed by every other component.
///
/// Constructed once per engine instance; collaborators read it but never
/// mutate it.
#[derive(Clone)]
pub struct Configuration {
    pub locations: Vec<Location>,
    pub encoding: String,
    pub metadata_table: String,
    pub target: Target,
    pub versioned_prefix: String,
    pub repeatable_prefix: String,
    pub separator: String,
    /// Overrides the script-kind-specific suffix when set.
    pub suffix: Option<String>,
    pub ignore_future: bool,
    pub validate_on_migrate: bool,
    pub clean_on_validation_error: bool,
    pub clean_disabled: bool,
    pub baseline_version: VersionKey,
    pub baseline_description: String,
    pub baseline_on_migrate: bool,
    pub out_of_order: bool,
    pub allow_mixed: bool,
    pub skip_default_callbacks: bool,
    pub skip_default_resolvers: bool,
    pub custom_resolvers: Vec<Arc<dyn MigrationResolver>>,
    pub custom_callbacks: Vec<Arc<dyn Callback>>,
    pub installed_by: Option<String>,
    pub placeholders: HashMap<String, String>,
    /// Seconds to wait for the metadata lock; 0 retries indefinitely.
    pub lock_timeout_secs: u32,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            locations: vec![Location::Classpath("db/migration".to_string())],
            encoding: "UTF-8".to_string(),
            metadata_table: "milepost_schema_history".to_string(),
            target: Target::Latest,
            versioned_prefix: "V".to_string(),
            repeatable_prefix: "R".to_string(),
            separator: "__".to_string(),
            suffix: None,
            ignore_future: true,
            validate_on_migrate: true,
            clean_on_validation_error: false,
            clean_disabled: false,
            baseline_version: VersionKey {
                segments: vec![1],
                raw: "1".to_string(),
            },
            baseline_description: DEFAULT_BASELINE_DESCRIPTION.to_string(),
            baseline_on_migrate: false,
            out_of_order: false,
            allow_mixed: false,
            skip_default_callbacks: false,
            skip_default_resolvers: false,
            custom_resolvers: Vec::new(),
            custom_callbacks: Vec::new(),
            installed_by: None,
            placeholders: HashMap::new(),
            lock_timeout_secs: 0,
        }
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("locations", &self.locations)
            .field("encoding", &self.encoding)
            .field("metadata_table", &self.metadata_table)
            .field("target", &self.target)
            .field("versioned_prefix", &self.versioned_prefix)
            .field("repeatable_prefix", &self.repeatable_prefix)
            .field("separator", &self.separator)
            .field("suffix", &self.suffix)
            .field("ignore_future", &self.ignore_future)
            .field("validate_on_migrate", &self.validate_on_migrate)
            .field("clean_on_validation_error", &self.clean_on_validation_error)
            .field("clean_disabled", &self.clean_disabled)
            .field("baseline_version", &self.baseline_version)
            .field("baseline_description", &self.baseline_description)
            .field("baseline_on_migrate", &self.baseline_on_migrate)
            .field("out_of_order", &self.out_of_order)
            .field("allow_mixed", &self.allow_mixed)
            .field("skip_default_callbacks", &self.skip_default_callbacks)
            .field("skip_default_resolvers", &self.skip_default_resolvers)
            .field("custom_resolvers", &self.custom_resolvers.len())
            .field("custom_callbacks", &self.custom_callbacks.len())
            .field("installed_by", &self.installed_by)
            .field("placeholders", &self.placeholders)
            .field("lock_timeout_secs", &self.lock_timeout_secs)
            .finish()
    }
}

// ── TOML deserialization structs ──

#[derive(Deserialize, Default)]
struct TomlConfig {
    migrations: Option<TomlMigrationSettings>,
    placeholders: Option<HashMap<String, String>>,
}

#[derive(Deserialize, Default)]
struct TomlMigrationSettings {
    locations: Option<Vec<String>>,
    encoding: Option<String>,
    table: Option<String>,
    target: Option<String>,
    versioned_prefix: Option<String>,
    repeatable_prefix: Option<String>,
    separator: Option<String>,
    suffix: Option<String>,
    ignore_future: Option<bool>,
    validate_on_migrate: Option<bool>,
    clean_on_validation_error: Option<bool>,
    clean_disabled: Option<bool>,
    baseline_version: Option<String>,
    baseline_description: Option<String>,
    baseline_on_migrate: Option<bool>,
    out_of_order: Option<bool>,
    allow_mixed: Option<bool>,
    skip_default_callbacks: Option<bool>,
    skip_default_resolvers: Option<bool>,
    installed_by: Option<String>,
    lock_timeout: Option<u32>,
}

impl Configuration {
    /// Load configuration from `milepost.toml` (or an explicit path) on top
    /// of the built-in defaults, then validate it.
    ///
    /// An explicitly named file that does not exist is an error; the default
    /// file is optional.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Configuration::default();

        let toml_path = config_path.unwrap_or("milepost.toml");
        if let Ok(content) = std::fs::read_to_string(toml_path) {
            let toml_config: TomlConfig = toml::from_str(&content).map_err(|e| {
                MilepostError::InvalidConfig(format!(
                    "failed to parse config file '{}': {}",
                    toml_path, e
                ))
            })?;
            config.apply_toml(toml_config)?;
        } else if config_path.is_some() {
            return Err(MilepostError::InvalidConfig(format!(
                "config file '{}' not found",
                toml_path
            )));
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_toml(&mut self, toml: TomlConfig) -> Result<()> {
        if let Some(m) = toml.migrations {
            if let Some(v) = m.locations {
                self.locations = v.iter().map(|s| Location::parse(s)).collect();
            }
            if let Some(v) = m.encoding {
                self.encoding = v;
            }
            if let Some(v) = m.table {
                self.metadata_table = v;
            }
            if let Some(v) = m.target {
                self.target = v.parse()?;
            }
            if let Some(v) = m.versioned_prefix {
                self.versioned_prefix = v;
            }
            if let Some(v) = m.repeatable_prefix {
                self.repeatable_prefix = v;
            }
            if let Some(v) = m.separator {
                self.separator = v;
            }
            if let Some(v) = m.suffix {
                self.suffix = Some(v);
            }
            if let Some(v) = m.ignore_future {
                self.ignore_future = v;
            }
            if let Some(v) = m.validate_on_migrate {
                self.validate_on_migrate = v;
            }
            if let Some(v) = m.clean_on_validation_error {
                self.clean_on_validation_error = v;
            }
            if let Some(v) = m.clean_disabled {
                self.clean_disabled = v;
            }
            if let Some(v) = m.baseline_version {
                self.baseline_version = VersionKey::parse(&v)?;
            }
            if let Some(v) = m.baseline_description {
                self.baseline_description = v;
            }
            if let Some(v) = m.baseline_on_migrate {
                self.baseline_on_migrate = v;
            }
            if let Some(v) = m.out_of_order {
                self.out_of_order = v;
            }
            if let Some(v) = m.allow_mixed {
                self.allow_mixed = v;
            }
            if let Some(v) = m.skip_default_callbacks {
                self.skip_default_callbacks = v;
            }
            if let Some(v) = m.skip_default_resolvers {
                self.skip_default_resolvers = v;
            }
            if let Some(v) = m.installed_by {
                self.installed_by = Some(v);
            }
            if let Some(v) = m.lock_timeout {
                self.lock_timeout_secs = v;
            }
        }

        if let Some(p) = toml.placeholders {
            self.placeholders.extend(p);
        }

        Ok(())
    }

    /// Apply flat `milepost.*` key/value properties on top of the current
    /// values.
    ///
    /// Keys outside the `milepost.` namespace are ignored; namespaced keys
    /// that are not recognized log a warning and are ignored.
    pub fn apply_properties(&mut self, props: &HashMap<String, String>) -> Result<()> {
        // Deterministic application order regardless of map iteration.
        let mut keys: Vec<&String> = props.keys().collect();
        keys.sort();

        for key in keys {
            let value = &props[key];
            let Some(name) = key.strip_prefix("milepost.") else {
                continue;
            };

            if let Some(placeholder) = name.strip_prefix("placeholder.") {
                self.placeholders
                    .insert(placeholder.to_string(), value.clone());
                continue;
            }

            match name {
                "locations" => {
                    self.locations = value
                        .split(',')
                        .map(|s| Location::parse(s.trim()))
                        .collect();
                }
                "encoding" => self.encoding = value.clone(),
                "table" => self.metadata_table = value.clone(),
                "target" => self.target = value.parse()?,
                "versioned_prefix" => self.versioned_prefix = value.clone(),
                "repeatable_prefix" => self.repeatable_prefix = value.clone(),
                "separator" => self.separator = value.clone(),
                "suffix" => self.suffix = Some(value.clone()),
                "ignore_future" => self.ignore_future = parse_bool(name, value)?,
                "validate_on_migrate" => self.validate_on_migrate = parse_bool(name, value)?,
                "clean_on_validation_error" => {
                    self.clean_on_validation_error = parse_bool(name, value)?
                }
                "clean_disabled" => self.clean_disabled = parse_bool(name, value)?,
                "baseline_version" => self.baseline_version = VersionKey::parse(value)?,
                "baseline_description" => self.baseline_description = value.clone(),
                "baseline_on_migrate" => self.baseline_on_migrate = parse_bool(name, value)?,
                "out_of_order" => self.out_of_order = parse_bool(name, value)?,
                "allow_mixed" => self.allow_mixed = parse_bool(name, value)?,
                "skip_default_callbacks" => {
                    self.skip_default_callbacks = parse_bool(name, value)?
                }
                "skip_default_resolvers" => {
                    self.skip_default_resolvers = parse_bool(name, value)?
                }
                "installed_by" => self.installed_by = Some(value.clone()),
                "lock_timeout" => {
                    self.lock_timeout_secs = value.parse().map_err(|_| {
                        MilepostError::InvalidConfig(format!(
                            "property 'milepost.lock_timeout' is not an integer: '{}'",
                            value
                        ))
                    })?
                }
                unknown => {
                    tracing::warn!(
                        property = unknown,
                        "Ignoring unrecognized milepost.* configuration property"
                    );
                }
            }
        }

        self.validate()
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.separator.is_empty() {
            return Err(MilepostError::InvalidConfig(
                "separator must not be empty".to_string(),
            ));
        }
        if !self.encoding.eq_ignore_ascii_case("utf-8") && !self.encoding.eq_ignore_ascii_case("utf8")
        {
            return Err(MilepostError::InvalidConfig(format!(
                "unsupported encoding '{}'; only UTF-8 is supported",
                self.encoding
            )));
        }
        validate_identifier(&self.metadata_table)?;
        Ok(())
    }
}

/// Validate that a collection identifier contains only safe characters.
///
/// Names outside `[a-zA-Z0-9_]` are rejected early rather than passed through
/// to the backend.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MilepostError::InvalidConfig(
            "identifier cannot be empty".to_string(),
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(MilepostError::InvalidConfig(format!(
            "identifier '{}' contains invalid characters; only [a-zA-Z0-9_] are allowed",
            name
        )));
    }
    Ok(())
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    value.parse::<bool>().map_err(|_| {
        MilepostError::InvalidConfig(format!(
            "property 'milepost.{}' is not a boolean: '{}'",
            name, value
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_default_config() {
        let config = Configuration::default();
        assert_eq!(config.metadata_table, "milepost_schema_history");
        assert_eq!(config.versioned_prefix, "V");
        assert_eq!(config.repeatable_prefix, "R");
        assert_eq!(config.separator, "__");
        assert_eq!(config.target, Target::Latest);
        assert!(config.ignore_future);
        assert!(config.validate_on_migrate);
        assert!(!config.out_of_order);
        assert!(!config.clean_disabled);
        assert_eq!(config.baseline_version.raw, "1");
        assert_eq!(config.baseline_description, "<< Baseline >>");
        assert_eq!(
            config.locations,
            vec![Location::Classpath("db/migration".to_string())]
        );
    }

    #[test]
    fn test_location_parse() {
        assert_eq!(
            Location::parse("filesystem:/opt/scripts"),
            Location::Filesystem("/opt/scripts".to_string())
        );
        assert_eq!(
            Location::parse("classpath:db/migration"),
            Location::Classpath("db/migration".to_string())
        );
        assert_eq!(
            Location::parse("db/migration"),
            Location::Classpath("db/migration".to_string())
        );
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
[migrations]
table = "my_history"
target = "2.1"
out_of_order = true
locations = ["filesystem:scripts/main", "scripts/extra"]
baseline_version = "3"

[placeholders]
env = "production"
"#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        let mut config = Configuration::default();
        config.apply_toml(toml_config).unwrap();

        assert_eq!(config.metadata_table, "my_history");
        assert_eq!(
            config.target,
            Target::Version(VersionKey::parse("2.1").unwrap())
        );
        assert!(config.out_of_order);
        assert_eq!(
            config.locations,
            vec![
                Location::Filesystem("scripts/main".to_string()),
                Location::Classpath("scripts/extra".to_string()),
            ]
        );
        assert_eq!(config.baseline_version.raw, "3");
        assert_eq!(config.placeholders.get("env").unwrap(), "production");
    }

    #[test]
    fn test_apply_properties() {
        let mut config = Configuration::default();
        let props: HashMap<String, String> = [
            ("milepost.table", "history"),
            ("milepost.out_of_order", "true"),
            ("milepost.target", "current"),
            ("milepost.locations", "filesystem:a, b"),
            ("milepost.placeholder.env", "staging"),
            ("milepost.lock_timeout", "30"),
            ("unrelated.key", "ignored"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        config.apply_properties(&props).unwrap();

        assert_eq!(config.metadata_table, "history");
        assert!(config.out_of_order);
        assert_eq!(config.target, Target::Current);
        assert_eq!(
            config.locations,
            vec![
                Location::Filesystem("a".to_string()),
                Location::Classpath("b".to_string()),
            ]
        );
        assert_eq!(config.placeholders.get("env").unwrap(), "staging");
        assert_eq!(config.lock_timeout_secs, 30);
    }

    #[test]
    fn test_empty_separator_rejected() {
        let mut config = Configuration::default();
        let props: HashMap<String, String> =
            [("milepost.separator".to_string(), String::new())].into();

        let err = config.apply_properties(&props).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn test_bad_boolean_property_rejected() {
        let mut config = Configuration::default();
        let props: HashMap<String, String> =
            [("milepost.out_of_order".to_string(), "yes".to_string())].into();

        assert!(config.apply_properties(&props).is_err());
    }

    #[test]
    fn test_unsupported_encoding_rejected() {
        let mut config = Configuration::default();
        config.encoding = "UTF-16".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("milepost_schema_history").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("bad;drop").is_err());
    }
}
