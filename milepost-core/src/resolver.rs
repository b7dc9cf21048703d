//! Migration resolution: filename grammar, file-backed resolvers, and the
//! composite resolver that merges every source into one canonical ordering.
//!
//! Versioned scripts follow `<prefix><version><separator><description><suffix>`
//! (e.g. `V1.2__Add_index.js`), repeatable scripts follow
//! `<repeatable_prefix><separator><description><suffix>` (e.g. `R__Views.js`).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::checksum::calculate_checksum;
#[allow(unused_imports)]
use crate::config::{Configuration, Location};
use crate::error::{MilepostError, Result};
use crate::version::VersionKey;

/// Script kinds the default file resolvers understand, one resolver per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// JavaScript scripts (`.js`), run by the backend's script interpreter.
    Js,
    /// Command documents (`.json`), run as raw database commands.
    Json,
}

impl ScriptKind {
    pub fn default_suffix(&self) -> &'static str {
        match self {
            ScriptKind::Js => ".js",
            ScriptKind::Json => ".json",
        }
    }

    pub fn executor_tag(&self) -> &'static str {
        match self {
            ScriptKind::Js => "js",
            ScriptKind::Json => "json",
        }
    }
}

/// Type-safe encoding of the migration variant.
///
/// Versioned migrations always have a version; repeatable migrations never do.
#[derive(Debug, Clone)]
pub enum MigrationKind {
    Versioned(VersionKey),
    Repeatable,
}

/// A migration discovered by a resolver.
#[derive(Debug, Clone)]
pub struct MigrationDescriptor {
    pub kind: MigrationKind,
    pub description: String,
    /// Script identity, e.g. the filename.
    pub script: String,
    pub checksum: Option<i32>,
    /// Where the script came from, for diagnostics.
    pub location: String,
    /// Which interpreter runs this script.
    pub executor_tag: String,
    /// Full script source.
    pub body: String,
}

impl MigrationDescriptor {
    /// Get the version if this is a versioned migration.
    pub fn version(&self) -> Option<&VersionKey> {
        match &self.kind {
            MigrationKind::Versioned(v) => Some(v),
            MigrationKind::Repeatable => None,
        }
    }

    /// Whether this is a versioned migration.
    pub fn is_versioned(&self) -> bool {
        matches!(&self.kind, MigrationKind::Versioned(_))
    }

    /// Human-readable identity for error messages.
    pub fn identity(&self) -> String {
        match &self.kind {
            MigrationKind::Versioned(v) => format!("version {} ('{}')", v, self.description),
            MigrationKind::Repeatable => format!("'{}'", self.description),
        }
    }
}

/// Enumerates available migration descriptors from one source.
///
/// Implementations beyond the built-in file resolvers can be registered via
/// `Configuration::custom_resolvers`; the composite resolver merges every
/// source and fails on identity collisions.
pub trait MigrationResolver: Send + Sync {
    /// Resolver name for diagnostics.
    fn name(&self) -> &str;

    fn resolve(&self, config: &Configuration) -> Result<Vec<MigrationDescriptor>>;
}

/// Parse a script filename against the configured grammar.
///
/// Returns `Ok(None)` for filenames that do not match any configured
/// prefix/suffix pair (those are ignored silently). A filename that matches
/// a prefix but carries an invalid version or an empty description is an
/// error.
pub fn parse_script_filename(
    filename: &str,
    config: &Configuration,
    suffix: &str,
) -> Result<Option<(MigrationKind, String)>> {
    let Some(stem) = filename.strip_suffix(suffix) else {
        return Ok(None);
    };

    if let Some(rest) = stem.strip_prefix(&config.repeatable_prefix) {
        if let Some(raw_description) = rest.strip_prefix(&config.separator) {
            let description = normalize_description(raw_description, filename, config)?;
            return Ok(Some((MigrationKind::Repeatable, description)));
        }
    }

    if let Some(rest) = stem.strip_prefix(&config.versioned_prefix) {
        if let Some((raw_version, raw_description)) = rest.split_once(&config.separator) {
            let version = VersionKey::parse(raw_version).map_err(|e| {
                MilepostError::InvalidVersion(format!("in script '{}': {}", filename, e))
            })?;
            let description = normalize_description(raw_description, filename, config)?;
            return Ok(Some((MigrationKind::Versioned(version), description)));
        }
    }

    Ok(None)
}

/// Underscores become spaces; the result must be non-empty and must not
/// contain the configured separator.
fn normalize_description(raw: &str, filename: &str, config: &Configuration) -> Result<String> {
    if raw.is_empty() {
        return Err(MilepostError::InvalidDescription(format!(
            "script '{}' has an empty description",
            filename
        )));
    }
    let description = raw.replace('_', " ");
    if description.contains(&config.separator) {
        return Err(MilepostError::InvalidDescription(format!(
            "description of script '{}' contains the separator '{}'",
            filename, config.separator
        )));
    }
    Ok(description)
}

/// Default file-backed resolver for one script kind.
///
/// Scans every configured location for files with the kind's suffix (or the
/// configured suffix override) and parses them into descriptors. Missing
/// locations are skipped with a warning; unreadable ones are an error.
pub struct FileResolver {
    kind: ScriptKind,
}

impl FileResolver {
    pub fn new(kind: ScriptKind) -> Self {
        Self { kind }
    }

    fn suffix(&self, config: &Configuration) -> String {
        config
            .suffix
            .clone()
            .unwrap_or_else(|| self.kind.default_suffix().to_string())
    }
}

impl MigrationResolver for FileResolver {
    fn name(&self) -> &str {
        match self.kind {
            ScriptKind::Js => "file-js",
            ScriptKind::Json => "file-json",
        }
    }

    fn resolve(&self, config: &Configuration) -> Result<Vec<MigrationDescriptor>> {
        let suffix = self.suffix(config);
        let mut migrations = Vec::new();

        for location in &config.locations {
            let dir = location.dir();
            if !dir.exists() {
                tracing::warn!(location = %location, "Migration location does not exist");
                continue;
            }

            let entries = std::fs::read_dir(&dir).map_err(|e| MilepostError::LocationUnreadable {
                location: location.to_string(),
                reason: e.to_string(),
            })?;

            for entry in entries {
                let entry = entry.map_err(|e| MilepostError::LocationUnreadable {
                    location: location.to_string(),
                    reason: e.to_string(),
                })?;
                let path = entry.path();

                if !path.is_file() {
                    continue;
                }

                let filename = match path.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name.to_string(),
                    None => continue,
                };

                let Some((kind, description)) =
                    parse_script_filename(&filename, config, &suffix)?
                else {
                    continue;
                };

                let bytes =
                    std::fs::read(&path).map_err(|e| MilepostError::LocationUnreadable {
                        location: location.to_string(),
                        reason: format!("failed to read '{}': {}", filename, e),
                    })?;
                let body = String::from_utf8(bytes).map_err(|_| {
                    MilepostError::LocationUnreadable {
                        location: location.to_string(),
                        reason: format!("script '{}' is not valid UTF-8", filename),
                    }
                })?;
                let checksum = calculate_checksum(&body);

                migrations.push(MigrationDescriptor {
                    kind,
                    description,
                    script: filename,
                    checksum: Some(checksum),
                    location: location.to_string(),
                    executor_tag: self.kind.executor_tag().to_string(),
                    body,
                });
            }
        }

        Ok(migrations)
    }
}

/// Resolve migrations from every configured source into one canonical,
/// ordered, duplicate-free sequence.
///
/// Ordering: versioned migrations by version ascending, then repeatable
/// migrations by description ascending. Two descriptors with the same
/// identity, from any combination of sources, fail with a duplicate error.
pub fn collect_migrations(config: &Configuration) -> Result<Vec<MigrationDescriptor>> {
    let mut resolvers: Vec<Arc<dyn MigrationResolver>> = Vec::new();
    if !config.skip_default_resolvers {
        resolvers.push(Arc::new(FileResolver::new(ScriptKind::Js)));
        // A suffix override collapses the kind distinction, so only the
        // primary resolver runs with it.
        if config.suffix.is_none() {
            resolvers.push(Arc::new(FileResolver::new(ScriptKind::Json)));
        }
    }
    resolvers.extend(config.custom_resolvers.iter().cloned());

    let mut merged: Vec<MigrationDescriptor> = Vec::new();
    for resolver in &resolvers {
        merged.extend(resolver.resolve(config)?);
    }

    // Identity collision check across all sources: versioned migrations are
    // identified by their (version, description) pair, repeatable ones by
    // description alone.
    let mut seen_versioned: HashMap<(String, String), usize> = HashMap::new();
    let mut seen_repeatable: HashMap<String, usize> = HashMap::new();
    for (idx, descriptor) in merged.iter().enumerate() {
        let prior = match &descriptor.kind {
            MigrationKind::Versioned(v) => {
                seen_versioned.insert((v.canonical(), descriptor.description.clone()), idx)
            }
            MigrationKind::Repeatable => {
                seen_repeatable.insert(descriptor.description.clone(), idx)
            }
        };
        if let Some(prior_idx) = prior {
            let prior = &merged[prior_idx];
            return Err(MilepostError::DuplicateMigration {
                identity: descriptor.identity(),
                first: format!("{} ({})", prior.script, prior.location),
                second: format!("{} ({})", descriptor.script, descriptor.location),
            });
        }
    }

    merged.sort_by(|a, b| match (&a.kind, &b.kind) {
        (MigrationKind::Versioned(va), MigrationKind::Versioned(vb)) => va.cmp(vb),
        (MigrationKind::Versioned(_), MigrationKind::Repeatable) => Ordering::Less,
        (MigrationKind::Repeatable, MigrationKind::Versioned(_)) => Ordering::Greater,
        (MigrationKind::Repeatable, MigrationKind::Repeatable) => {
            a.description.cmp(&b.description)
        }
    });

    Ok(merged)
}
