//! The per-version state view: joins resolver output with the stored history
//! and applies the target / out-of-order policy.
//!
//! The view is rebuilt on every command from current resolver output and
//! current store contents; it is never persisted. Row order is the
//! evaluation order the validator relies on: resolver order first, then
//! applied entries without a matching descriptor in rank order.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Configuration;
use crate::resolver::{MigrationDescriptor, MigrationKind};
use crate::store::{AppliedEntry, EntryKind};
use crate::version::{Target, VersionKey};

/// The state of one info row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationState {
    Pending,
    AboveTarget,
    Ignored,
    Future,
    Outdated,
    Superseded,
    Success,
    Failed,
    MissingSuccess,
    MissingFailed,
    OutOfOrder,
    Baseline,
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            MigrationState::Pending => "Pending",
            MigrationState::AboveTarget => "Above Target",
            MigrationState::Ignored => "Ignored",
            MigrationState::Future => "Future",
            MigrationState::Outdated => "Outdated",
            MigrationState::Superseded => "Superseded",
            MigrationState::Success => "Success",
            MigrationState::Failed => "Failed",
            MigrationState::MissingSuccess => "Missing (success)",
            MigrationState::MissingFailed => "Missing (failed)",
            MigrationState::OutOfOrder => "Out of Order",
            MigrationState::Baseline => "Baseline",
        };
        f.write_str(label)
    }
}

/// Disagreement between a resolved descriptor and its applied entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Drift {
    Checksum {
        stored: Option<i32>,
        resolved: Option<i32>,
    },
    Description {
        applied: String,
        resolved: String,
    },
    Kind {
        applied: EntryKind,
        resolved: EntryKind,
    },
}

/// Joined view of a resolved descriptor and/or an applied entry.
#[derive(Debug, Clone, Serialize)]
pub struct InfoRow {
    pub version: Option<VersionKey>,
    pub description: String,
    pub kind: EntryKind,
    pub script: String,
    pub state: MigrationState,
    pub checksum: Option<i32>,
    pub installed_rank: Option<i64>,
    pub installed_on: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<Drift>,
}

impl InfoRow {
    fn from_descriptor(descriptor: &MigrationDescriptor, state: MigrationState) -> Self {
        InfoRow {
            version: descriptor.version().cloned(),
            description: descriptor.description.clone(),
            kind: match descriptor.kind {
                MigrationKind::Versioned(_) => EntryKind::Versioned,
                MigrationKind::Repeatable => EntryKind::Repeatable,
            },
            script: descriptor.script.clone(),
            state,
            checksum: descriptor.checksum,
            installed_rank: None,
            installed_on: None,
            execution_time_ms: None,
            drift: None,
        }
    }

    fn from_entry(entry: &AppliedEntry, state: MigrationState) -> Self {
        InfoRow {
            version: entry.version.clone(),
            description: entry.description.clone(),
            kind: entry.kind,
            script: entry.script.clone(),
            state,
            checksum: entry.checksum,
            installed_rank: Some(entry.install_rank),
            installed_on: Some(entry.installed_on),
            execution_time_ms: Some(entry.execution_time_ms),
            drift: None,
        }
    }
}

/// The complete joined view, plus the bounds the validator needs.
#[derive(Debug, Clone)]
pub struct InfoSet {
    pub rows: Vec<InfoRow>,
    /// Greatest resolved version, if any versioned migration resolved.
    pub max_resolved: Option<VersionKey>,
    /// Effective target cap; `None` means unbounded.
    pub target: Option<VersionKey>,
}

/// Build the joined view from resolver output and store contents.
pub fn build_info(
    resolved: &[MigrationDescriptor],
    applied: &[AppliedEntry],
    config: &Configuration,
) -> InfoSet {
    let max_resolved: Option<VersionKey> = resolved
        .iter()
        .filter_map(|d| d.version())
        .max()
        .cloned();

    // Baseline marker version and the highest successfully applied version
    // (the baseline itself counts as applied).
    let baseline_version: Option<VersionKey> = applied
        .iter()
        .find(|e| e.kind == EntryKind::Baseline)
        .and_then(|e| e.version.clone());

    let max_applied: Option<VersionKey> = applied
        .iter()
        .filter(|e| e.success && e.kind != EntryKind::Schema)
        .filter_map(|e| e.version.as_ref())
        .max()
        .cloned();

    let target: Option<VersionKey> = match &config.target {
        Target::Latest => None,
        Target::Current => Some(max_applied.clone().unwrap_or(VersionKey {
            segments: vec![0],
            raw: "0".to_string(),
        })),
        Target::Version(v) => Some(v.clone()),
    };

    // Group applied entries by identity, in rank order.
    let mut applied_versioned: HashMap<String, Vec<&AppliedEntry>> = HashMap::new();
    let mut applied_repeatable: HashMap<String, Vec<&AppliedEntry>> = HashMap::new();
    for entry in applied {
        if entry.kind.is_marker() {
            continue;
        }
        match &entry.version {
            Some(v) => applied_versioned
                .entry(v.canonical())
                .or_default()
                .push(entry),
            None => applied_repeatable
                .entry(entry.description.clone())
                .or_default()
                .push(entry),
        }
    }

    let mut rows: Vec<InfoRow> = Vec::new();
    let mut consumed: HashSet<i64> = HashSet::new();

    // Pass 1: resolver order.
    for descriptor in resolved {
        match &descriptor.kind {
            MigrationKind::Versioned(version) => {
                if let Some(entries) = applied_versioned.get(&version.canonical()) {
                    emit_history(&mut rows, &mut consumed, entries, descriptor, Some(version), baseline_version.as_ref());
                } else {
                    let below_baseline = baseline_version
                        .as_ref()
                        .is_some_and(|b| version <= b);
                    let state = if below_baseline {
                        // Baseline semantics win: at or below the anchor is
                        // skipped even with out_of_order.
                        MigrationState::Ignored
                    } else if target.as_ref().is_some_and(|t| version > t) {
                        MigrationState::AboveTarget
                    } else if max_applied.as_ref().is_some_and(|m| version < m) {
                        if config.out_of_order {
                            MigrationState::OutOfOrder
                        } else {
                            MigrationState::Ignored
                        }
                    } else {
                        MigrationState::Pending
                    };
                    rows.push(InfoRow::from_descriptor(descriptor, state));
                }
            }
            MigrationKind::Repeatable => {
                if let Some(entries) = applied_repeatable.get(&descriptor.description) {
                    emit_history(&mut rows, &mut consumed, entries, descriptor, None, None);
                } else {
                    rows.push(InfoRow::from_descriptor(descriptor, MigrationState::Pending));
                }
            }
        }
    }

    // Pass 2: applied entries with no matching descriptor, in rank order.
    for entry in applied {
        if consumed.contains(&entry.install_rank) {
            continue;
        }
        let row = match entry.kind {
            EntryKind::Schema => InfoRow::from_entry(entry, MigrationState::Success),
            EntryKind::Baseline => InfoRow::from_entry(entry, MigrationState::Baseline),
            EntryKind::Versioned | EntryKind::Repeatable => {
                let below_baseline = match (&entry.version, &baseline_version) {
                    (Some(v), Some(b)) => v <= b,
                    _ => false,
                };
                let future = match (&entry.version, &max_resolved) {
                    (Some(v), Some(m)) => v > m,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                let state = if below_baseline {
                    MigrationState::Superseded
                } else if future {
                    MigrationState::Future
                } else if entry.success {
                    MigrationState::MissingSuccess
                } else {
                    MigrationState::MissingFailed
                };
                InfoRow::from_entry(entry, state)
            }
        };
        rows.push(row);
    }

    InfoSet {
        rows,
        max_resolved,
        target,
    }
}

/// Emit the application history of one identity: everything before the
/// latest entry is superseded (or failed), the latest entry carries the
/// real state and any drift against the descriptor.
fn emit_history(
    rows: &mut Vec<InfoRow>,
    consumed: &mut HashSet<i64>,
    entries: &[&AppliedEntry],
    descriptor: &MigrationDescriptor,
    version: Option<&VersionKey>,
    baseline_version: Option<&VersionKey>,
) {
    for entry in entries {
        consumed.insert(entry.install_rank);
    }

    let (latest, earlier) = match entries.split_last() {
        Some((latest, earlier)) => (*latest, earlier),
        None => return,
    };

    for &entry in earlier {
        let state = if entry.success {
            MigrationState::Superseded
        } else {
            MigrationState::Failed
        };
        rows.push(InfoRow::from_entry(entry, state));
    }

    let below_baseline = match (version, baseline_version) {
        (Some(v), Some(b)) => v <= b,
        _ => false,
    };

    let expected_kind = if descriptor.is_versioned() {
        EntryKind::Versioned
    } else {
        EntryKind::Repeatable
    };

    let mut row = if below_baseline {
        InfoRow::from_entry(latest, MigrationState::Superseded)
    } else if !latest.success {
        InfoRow::from_entry(latest, MigrationState::Failed)
    } else if latest.checksum == descriptor.checksum {
        InfoRow::from_entry(latest, MigrationState::Success)
    } else {
        let mut row = InfoRow::from_entry(latest, MigrationState::Outdated);
        row.drift = Some(Drift::Checksum {
            stored: latest.checksum,
            resolved: descriptor.checksum,
        });
        row
    };

    // Structural drift outranks checksum drift.
    if latest.kind != expected_kind {
        row.drift = Some(Drift::Kind {
            applied: latest.kind,
            resolved: expected_kind,
        });
    } else if latest.description != descriptor.description {
        row.drift = Some(Drift::Description {
            applied: latest.description.clone(),
            resolved: descriptor.description.clone(),
        });
    }

    rows.push(row);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Target;

    fn desc(version: Option<&str>, description: &str, checksum: i32) -> MigrationDescriptor {
        let kind = match version {
            Some(v) => MigrationKind::Versioned(VersionKey::parse(v).unwrap()),
            None => MigrationKind::Repeatable,
        };
        let script = match version {
            Some(v) => format!("V{}__{}.js", v, description.replace(' ', "_")),
            None => format!("R__{}.js", description.replace(' ', "_")),
        };
        MigrationDescriptor {
            kind,
            description: description.to_string(),
            script,
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

    fn states(set: &InfoSet) -> Vec<MigrationState> {
        set.rows.iter().map(|r| r.state).collect()
    }

    #[test]
    fn test_fresh_database_all_pending() {
        let resolved = vec![desc(Some("1"), "a", 1), desc(Some("2"), "b", 2), desc(None, "c", 3)];
        let set = build_info(&resolved, &[], &Configuration::default());
        assert_eq!(
            states(&set),
            vec![
                MigrationState::Pending,
                MigrationState::Pending,
                MigrationState::Pending
            ]
        );
    }

    #[test]
    fn test_applied_matching_checksum_is_success() {
        let resolved = vec![desc(Some("1"), "a", 11)];
        let applied = vec![entry(1, Some("1"), "a", EntryKind::Versioned, Some(11), true)];
        let set = build_info(&resolved, &applied, &Configuration::default());
        assert_eq!(states(&set), vec![MigrationState::Success]);
    }

    #[test]
    fn test_versioned_checksum_drift_is_outdated() {
        let resolved = vec![desc(Some("1"), "a", 11)];
        let applied = vec![entry(1, Some("1"), "a", EntryKind::Versioned, Some(99), true)];
        let set = build_info(&resolved, &applied, &Configuration::default());
        assert_eq!(states(&set), vec![MigrationState::Outdated]);
        assert_eq!(
            set.rows[0].drift,
            Some(Drift::Checksum {
                stored: Some(99),
                resolved: Some(11)
            })
        );
    }

    #[test]
    fn test_version_equality_is_canonical_when_joining() {
        let resolved = vec![desc(Some("1"), "a", 11)];
        let applied = vec![entry(1, Some("1.0"), "a", EntryKind::Versioned, Some(11), true)];
        let set = build_info(&resolved, &applied, &Configuration::default());
        assert_eq!(states(&set), vec![MigrationState::Success]);
    }

    #[test]
    fn test_gap_is_ignored_or_out_of_order() {
        let resolved = vec![desc(Some("1"), "a", 1), desc(Some("2"), "b", 2), desc(Some("3"), "c", 3)];
        let applied = vec![
            entry(1, Some("1"), "a", EntryKind::Versioned, Some(1), true),
            entry(2, Some("3"), "c", EntryKind::Versioned, Some(3), true),
        ];

        let set = build_info(&resolved, &applied, &Configuration::default());
        assert_eq!(
            states(&set),
            vec![
                MigrationState::Success,
                MigrationState::Ignored,
                MigrationState::Success
            ]
        );

        let config = Configuration {
            out_of_order: true,
            ..Configuration::default()
        };
        let set = build_info(&resolved, &applied, &config);
        assert_eq!(set.rows[1].state, MigrationState::OutOfOrder);
    }

    #[test]
    fn test_above_target() {
        let resolved = vec![desc(Some("1"), "a", 1), desc(Some("2"), "b", 2)];
        let config = Configuration {
            target: Target::Version(VersionKey::parse("1").unwrap()),
            ..Configuration::default()
        };
        let set = build_info(&resolved, &[], &config);
        assert_eq!(
            states(&set),
            vec![MigrationState::Pending, MigrationState::AboveTarget]
        );
    }

    #[test]
    fn test_current_target_with_no_history_caps_everything() {
        let resolved = vec![desc(Some("1"), "a", 1)];
        let config = Configuration {
            target: Target::Current,
            ..Configuration::default()
        };
        let set = build_info(&resolved, &[], &config);
        assert_eq!(states(&set), vec![MigrationState::AboveTarget]);
    }

    #[test]
    fn test_future_and_missing_applied() {
        let resolved = vec![desc(Some("1"), "a", 1)];
        let applied = vec![
            entry(1, Some("1"), "a", EntryKind::Versioned, Some(1), true),
            entry(2, Some("0.5"), "gone", EntryKind::Versioned, Some(5), true),
            entry(3, Some("9"), "from the future", EntryKind::Versioned, Some(9), true),
            entry(4, None, "gone view", EntryKind::Repeatable, Some(7), false),
        ];
        let set = build_info(&resolved, &applied, &Configuration::default());
        assert_eq!(
            states(&set),
            vec![
                MigrationState::Success,
                MigrationState::MissingSuccess,
                MigrationState::Future,
                MigrationState::MissingFailed,
            ]
        );
    }

    #[test]
    fn test_repeatable_history_supersession() {
        let resolved = vec![desc(None, "views", 30)];
        let applied = vec![
            entry(1, None, "views", EntryKind::Repeatable, Some(10), true),
            entry(2, None, "views", EntryKind::Repeatable, Some(20), true),
        ];

        let set = build_info(&resolved, &applied, &Configuration::default());
        // Older run superseded; latest run outdated against the new body.
        assert_eq!(
            states(&set),
            vec![MigrationState::Superseded, MigrationState::Outdated]
        );

        let resolved = vec![desc(None, "views", 20)];
        let set = build_info(&resolved, &applied, &Configuration::default());
        assert_eq!(
            states(&set),
            vec![MigrationState::Superseded, MigrationState::Success]
        );
    }

    #[test]
    fn test_baseline_rows() {
        let resolved = vec![
            desc(Some("1"), "a", 1),
            desc(Some("2"), "b", 2),
            desc(Some("3"), "c", 3),
        ];
        let applied = vec![entry(1, Some("2"), "<< Baseline >>", EntryKind::Baseline, None, true)];

        let set = build_info(&resolved, &applied, &Configuration::default());
        assert_eq!(
            states(&set),
            vec![
                MigrationState::Ignored,  // V1: at/below baseline
                MigrationState::Ignored,  // V2: at baseline
                MigrationState::Pending,  // V3
                MigrationState::Baseline, // the marker itself
            ]
        );

        // out_of_order does not resurrect below-baseline migrations.
        let config = Configuration {
            out_of_order: true,
            ..Configuration::default()
        };
        let set = build_info(&resolved, &applied, &config);
        assert_eq!(set.rows[0].state, MigrationState::Ignored);
    }

    #[test]
    fn test_failed_entry_with_descriptor() {
        let resolved = vec![desc(Some("1"), "a", 1)];
        let applied = vec![entry(1, Some("1"), "a", EntryKind::Versioned, Some(1), false)];
        let set = build_info(&resolved, &applied, &Configuration::default());
        assert_eq!(states(&set), vec![MigrationState::Failed]);
    }

    #[test]
    fn test_description_drift_detected() {
        let resolved = vec![desc(Some("1"), "a new name", 1)];
        let applied = vec![entry(1, Some("1"), "old name", EntryKind::Versioned, Some(1), true)];
        let set = build_info(&resolved, &applied, &Configuration::default());
        assert!(matches!(
            set.rows[0].drift,
            Some(Drift::Description { .. })
        ));
    }

    #[test]
    fn test_kind_drift_detected() {
        let resolved = vec![desc(Some("1"), "a", 1)];
        // Corrupt store: versioned identity recorded as repeatable.
        let applied = vec![entry(1, Some("1"), "a", EntryKind::Repeatable, Some(1), true)];
        let set = build_info(&resolved, &applied, &Configuration::default());
        assert!(matches!(set.rows[0].drift, Some(Drift::Kind { .. })));
    }

    #[test]
    fn test_schema_marker_row() {
        let applied = vec![AppliedEntry {
            install_rank: 0,
            version: None,
            description: crate::store::SCHEMA_MARKER_DESCRIPTION.to_string(),
            kind: EntryKind::Schema,
            script: String::new(),
            checksum: None,
            installed_by: "t".to_string(),
            installed_on: Utc::now(),
            execution_time_ms: 0,
            success: true,
        }];
        let set = build_info(&[], &applied, &Configuration::default());
        assert_eq!(states(&set), vec![MigrationState::Success]);
    }
}
