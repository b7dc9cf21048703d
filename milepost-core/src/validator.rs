//! Validation of the joined info view: resolved scripts against recorded
//! history.
//!
//! Rows are examined in the view's evaluation order and the first offending
//! row wins, so a given drift always produces the same error.

use crate::error::MilepostError;
use crate::info::{Drift, InfoSet, MigrationState};
use crate::store::EntryKind;

/// Knobs that differ between the `validate` command and the implicit
/// validation performed by `migrate`.
#[derive(Debug, Clone, Copy)]
pub struct ValidationOptions {
    /// Treat pending migrations as an error (the `validate` command does,
    /// validate-on-migrate does not).
    pub pending_not_ok: bool,
    /// Downgrade future migrations from error to warning.
    pub ignore_future: bool,
}

/// Validation outcome: at most one error, any number of warnings.
#[derive(Debug)]
pub struct Verdict {
    pub error: Option<MilepostError>,
    pub warnings: Vec<String>,
}

impl Verdict {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Compare resolved and stored history and yield a verdict.
pub fn validate(set: &InfoSet, options: &ValidationOptions) -> Verdict {
    let mut warnings = Vec::new();

    for row in &set.rows {
        match &row.drift {
            Some(Drift::Kind { applied, resolved }) => {
                return fail(MilepostError::ValidationFailed(format!(
                    "migration {} is recorded as {} but resolves as {}",
                    row.script, applied, resolved
                )));
            }
            Some(Drift::Description { applied, resolved }) => {
                return fail(MilepostError::ValidationFailed(format!(
                    "migration {} is recorded with description '{}' but resolves with '{}'",
                    row.script, applied, resolved
                )));
            }
            _ => {}
        }

        match row.state {
            MigrationState::Outdated if row.kind == EntryKind::Versioned => {
                let (stored, resolved) = match &row.drift {
                    Some(Drift::Checksum { stored, resolved }) => (*stored, *resolved),
                    _ => (row.checksum, None),
                };
                return fail(MilepostError::ChecksumMismatch {
                    script: row.script.clone(),
                    stored: stored.unwrap_or(0),
                    resolved: resolved.unwrap_or(0),
                });
            }
            MigrationState::MissingSuccess => {
                return fail(MilepostError::MissingAppliedScript(row.script.clone()));
            }
            MigrationState::MissingFailed => {
                return fail(MilepostError::MissingAppliedScript(format!(
                    "{} (failed)",
                    row.script
                )));
            }
            MigrationState::Future => {
                let version = row
                    .version
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                let highest = set
                    .max_resolved
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "none".to_string());
                if options.ignore_future {
                    warnings.push(format!(
                        "applied migration version {} is newer than the highest resolved version {}",
                        version, highest
                    ));
                } else {
                    return fail(MilepostError::FutureMigration { version, highest });
                }
            }
            MigrationState::Pending if options.pending_not_ok => {
                return fail(MilepostError::ValidationFailed(format!(
                    "resolved migration {} has not been applied",
                    row.script
                )));
            }
            _ => {}
        }
    }

    Verdict {
        error: None,
        warnings,
    }
}

fn fail(error: MilepostError) -> Verdict {
    Verdict {
        error: Some(error),
        warnings: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::error::ErrorKind;
    use crate::info::build_info;
    use crate::resolver::{MigrationDescriptor, MigrationKind};
    use crate::store::{AppliedEntry, EntryKind};
    use crate::version::VersionKey;
    use chrono::Utc;

    const STRICT: ValidationOptions = ValidationOptions {
        pending_not_ok: true,
        ignore_future: false,
    };
    const ON_MIGRATE: ValidationOptions = ValidationOptions {
        pending_not_ok: false,
        ignore_future: true,
    };

    fn desc(version: Option<&str>, description: &str, checksum: i32) -> MigrationDescriptor {
        let kind = match version {
            Some(v) => MigrationKind::Versioned(VersionKey::parse(v).unwrap()),
            None => MigrationKind::Repeatable,
        };
        MigrationDescriptor {
            kind,
            description: description.to_string(),
            script: format!("{}__{}.js", version.unwrap_or("R"), description),
            checksum: Some(checksum),
            location: "filesystem:test".to_string(),
            executor_tag: "js".to_string(),
            body: String::new(),
        }
    }

    fn entry(
        rank: i64,
        version: Option<&str>,
        description: &str,
        kind: EntryKind,
        checksum: Option<i32>,
        success: bool,
    ) -> AppliedEntry {
        AppliedEntry {
            install_rank: rank,
            version: version.map(|v| VersionKey::parse(v).unwrap()),
            description: description.to_string(),
            kind,
            script: format!("entry_{}", rank),
            checksum,
            installed_by: "t".to_string(),
            installed_on: Utc::now(),
            execution_time_ms: 0,
            success,
        }
    }

    fn kind_of(verdict: &Verdict) -> ErrorKind {
        verdict.error.as_ref().unwrap().kind()
    }

    #[test]
    fn test_in_sync_history_is_ok() {
        let resolved = vec![desc(Some("1"), "a", 1)];
        let applied = vec![entry(1, Some("1"), "a", EntryKind::Versioned, Some(1), true)];
        let set = build_info(&resolved, &applied, &Configuration::default());
        assert!(validate(&set, &STRICT).is_ok());
    }

    #[test]
    fn test_versioned_checksum_drift_fails() {
        let resolved = vec![desc(Some("1"), "a", 2)];
        let applied = vec![entry(1, Some("1"), "a", EntryKind::Versioned, Some(1), true)];
        let set = build_info(&resolved, &applied, &Configuration::default());
        let verdict = validate(&set, &STRICT);
        assert_eq!(kind_of(&verdict), ErrorKind::ChecksumMismatch);
        // Same failure under the migrate-time options.
        assert!(!validate(&set, &ON_MIGRATE).is_ok());
    }

    #[test]
    fn test_repeatable_checksum_drift_is_fine() {
        // An outdated repeatable just re-applies; it is not a validation error.
        let resolved = vec![desc(None, "views", 2)];
        let applied = vec![entry(1, None, "views", EntryKind::Repeatable, Some(1), true)];
        let set = build_info(&resolved, &applied, &Configuration::default());
        assert!(validate(&set, &ON_MIGRATE).is_ok());
    }

    #[test]
    fn test_missing_applied_script_fails() {
        let resolved = vec![desc(Some("1"), "a", 1)];
        let applied = vec![
            entry(1, Some("0.5"), "gone", EntryKind::Versioned, Some(5), true),
            entry(2, Some("1"), "a", EntryKind::Versioned, Some(1), true),
        ];
        let set = build_info(&resolved, &applied, &Configuration::default());
        let verdict = validate(&set, &STRICT);
        assert_eq!(kind_of(&verdict), ErrorKind::MissingAppliedScript);
    }

    #[test]
    fn test_future_migration_policy() {
        let resolved = vec![desc(Some("3"), "c", 3)];
        let applied = vec![
            entry(1, Some("3"), "c", EntryKind::Versioned, Some(3), true),
            entry(2, Some("9"), "later", EntryKind::Versioned, Some(9), true),
        ];
        let set = build_info(&resolved, &applied, &Configuration::default());

        let strict = validate(&set, &STRICT);
        assert_eq!(kind_of(&strict), ErrorKind::FutureMigration);

        let lenient = validate(
            &set,
            &ValidationOptions {
                pending_not_ok: true,
                ignore_future: true,
            },
        );
        assert!(lenient.is_ok());
        assert_eq!(lenient.warnings.len(), 1);
    }

    #[test]
    fn test_pending_policy() {
        let resolved = vec![desc(Some("1"), "a", 1)];
        let set = build_info(&resolved, &[], &Configuration::default());

        assert!(validate(&set, &ON_MIGRATE).is_ok());
        let strict = validate(&set, &STRICT);
        assert_eq!(kind_of(&strict), ErrorKind::ValidationFailed);
    }

    #[test]
    fn test_description_mismatch_fails() {
        let resolved = vec![desc(Some("1"), "new name", 1)];
        let applied = vec![entry(1, Some("1"), "old name", EntryKind::Versioned, Some(1), true)];
        let set = build_info(&resolved, &applied, &Configuration::default());
        let verdict = validate(&set, &ON_MIGRATE);
        assert_eq!(kind_of(&verdict), ErrorKind::ValidationFailed);
    }

    #[test]
    fn test_kind_mismatch_fails() {
        let resolved = vec![desc(Some("1"), "a", 1)];
        let applied = vec![entry(1, Some("1"), "a", EntryKind::Repeatable, Some(1), true)];
        let set = build_info(&resolved, &applied, &Configuration::default());
        let verdict = validate(&set, &ON_MIGRATE);
        assert_eq!(kind_of(&verdict), ErrorKind::ValidationFailed);
    }

    #[test]
    fn test_first_offending_row_wins() {
        let resolved = vec![desc(Some("1"), "a", 99), desc(Some("2"), "b", 98)];
        let applied = vec![
            entry(1, Some("1"), "a", EntryKind::Versioned, Some(1), true),
            entry(2, Some("2"), "b", EntryKind::Versioned, Some(2), true),
        ];
        let set = build_info(&resolved, &applied, &Configuration::default());
        let verdict = validate(&set, &STRICT);
        match verdict.error {
            Some(MilepostError::ChecksumMismatch { ref script, .. }) => {
                assert_eq!(script, "entry_1")
            }
            other => panic!("unexpected verdict: {:?}", other),
        }
    }

    #[test]
    fn test_rows_survive_serialization() {
        // Info rows are part of the public report surface.
        let resolved = vec![desc(Some("1"), "a", 1)];
        let set = build_info(&resolved, &[], &Configuration::default());
        let json = serde_json::to_value(&set.rows).unwrap();
        assert_eq!(json[0]["state"], "Pending");
        assert_eq!(json[0]["version"], "1");
    }
}
