use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use serde::Serialize;

use crate::backend::ScriptBody;
use crate::callbacks::Event;
use crate::error::{MilepostError, Result};
use crate::executor::Session;
use crate::info::{build_info, InfoRow, MigrationState};
use crate::placeholder::{build_placeholders, replace_placeholders};
use crate::resolver::MigrationDescriptor;
use crate::store::EntryKind;
use crate::validator::{validate, ValidationOptions};

/// Report returned after a migrate operation.
#[derive(Debug, Serialize)]
pub struct MigrateReport {
    pub migrations_applied: usize,
    pub total_time_ms: i32,
    pub details: Vec<MigrateDetail>,
}

#[derive(Debug, Serialize)]
pub struct MigrateDetail {
    pub version: Option<String>,
    pub description: String,
    pub script: String,
    pub execution_time_ms: i32,
}

pub(crate) async fn run(session: &Session<'_>) -> Result<MigrateReport> {
    let config = session.config;
    let store = &session.store;
    let backend = session.backend.as_ref();

    session.callbacks.fire(Event::BeforeMigrate, backend).await?;

    if config.validate_on_migrate {
        let applied = store.all_applied().await?;
        let set = build_info(&session.resolved, &applied, config);
        let verdict = validate(
            &set,
            &ValidationOptions {
                pending_not_ok: false,
                ignore_future: config.ignore_future,
            },
        );
        for warning in &verdict.warnings {
            tracing::warn!("{}", warning);
        }
        if let Some(error) = verdict.error {
            tracing::error!(error = %error, "Validation before migrate failed");
            if config.clean_on_validation_error {
                super::clean::drop_managed(session).await?;
                store.create_if_absent().await?;
            } else {
                return Err(MilepostError::ValidationFailed(error.to_string()));
            }
        }
    }

    // First run against this database: decide how history starts.
    if !store.has_schema_marker().await?
        && !store.has_baseline_marker().await?
        && !store.has_applied_migrations().await?
    {
        if session.backend.is_empty().await? {
            let schemas = session.backend.enumerate_schemas().await?;
            store
                .add_schema_marker(&schemas, &session.installed_by)
                .await?;
        } else if config.baseline_on_migrate {
            store
                .add_baseline_marker(
                    &config.baseline_version,
                    &config.baseline_description,
                    &session.installed_by,
                )
                .await?;
        } else {
            return Err(MilepostError::NonEmptyNoMetadata);
        }
    }

    let applied = store.all_applied().await?;
    let set = build_info(&session.resolved, &applied, config);
    let to_apply = pending_descriptors(&set.rows, &session.resolved);

    if !config.allow_mixed {
        let tags: BTreeSet<&str> = to_apply.iter().map(|d| d.executor_tag.as_str()).collect();
        if tags.len() > 1 {
            return Err(MilepostError::InvalidConfig(format!(
                "a single migrate run mixes executors ({}); set allow_mixed to permit this",
                tags.into_iter().collect::<Vec<_>>().join(", ")
            )));
        }
    }

    let mut report = MigrateReport {
        migrations_applied: 0,
        total_time_ms: 0,
        details: Vec::new(),
    };

    for descriptor in to_apply {
        session
            .callbacks
            .fire(Event::BeforeEachMigrate, backend)
            .await?;

        let execution_time_ms = apply_one(session, descriptor, report.migrations_applied).await?;

        session
            .callbacks
            .fire(Event::AfterEachMigrate, backend)
            .await?;

        report.migrations_applied += 1;
        report.total_time_ms += execution_time_ms;
        report.details.push(MigrateDetail {
            version: descriptor.version().map(|v| v.raw.clone()),
            description: descriptor.description.clone(),
            script: descriptor.script.clone(),
            execution_time_ms,
        });
    }

    session.callbacks.fire(Event::AfterMigrate, backend).await?;

    tracing::info!(
        migrations_applied = report.migrations_applied,
        total_time_ms = report.total_time_ms,
        "Migrate completed"
    );

    Ok(report)
}

/// The pending set, in application order: the rows are already ordered
/// versioned-by-version then repeatable-by-description, so a filter
/// preserves it. Out-of-order rows are only present when the policy allows
/// them; outdated repeatables re-apply.
fn pending_descriptors<'a>(
    rows: &[InfoRow],
    resolved: &'a [MigrationDescriptor],
) -> Vec<&'a MigrationDescriptor> {
    let by_version: HashMap<String, &MigrationDescriptor> = resolved
        .iter()
        .filter_map(|d| d.version().map(|v| (v.canonical(), d)))
        .collect();
    let by_description: HashMap<&str, &MigrationDescriptor> = resolved
        .iter()
        .filter(|d| !d.is_versioned())
        .map(|d| (d.description.as_str(), d))
        .collect();

    rows.iter()
        .filter(|row| {
            matches!(
                row.state,
                MigrationState::Pending | MigrationState::OutOfOrder
            ) || (row.state == MigrationState::Outdated && row.kind == EntryKind::Repeatable)
        })
        .filter_map(|row| match &row.version {
            Some(v) if row.kind == EntryKind::Versioned => by_version.get(&v.canonical()).copied(),
            _ => by_description.get(row.description.as_str()).copied(),
        })
        .collect()
}

async fn apply_one(
    session: &Session<'_>,
    descriptor: &MigrationDescriptor,
    applied_so_far: usize,
) -> Result<i32> {
    let config = session.config;
    tracing::info!(script = %descriptor.script, "Applying migration");

    let placeholders = build_placeholders(
        &config.placeholders,
        &config.metadata_table,
        &session.installed_by,
        &descriptor.script,
    );
    let source = replace_placeholders(&descriptor.body, &placeholders)?;

    let kind = if descriptor.is_versioned() {
        EntryKind::Versioned
    } else {
        EntryKind::Repeatable
    };

    let start = Instant::now();
    let result = session
        .backend
        .execute_script(ScriptBody {
            name: &descriptor.script,
            source: &source,
            executor_tag: &descriptor.executor_tag,
        })
        .await;
    let execution_time_ms = start.elapsed().as_millis() as i32;

    match result {
        Ok(()) => {
            session
                .store
                .append(
                    descriptor.version(),
                    &descriptor.description,
                    kind,
                    &descriptor.script,
                    descriptor.checksum,
                    &session.installed_by,
                    execution_time_ms,
                    true,
                )
                .await?;
            Ok(execution_time_ms)
        }
        Err(e) => {
            // A non-transactional backend may have applied part of the
            // script; keep the failure on record so repair can clear it.
            if !session.backend.supports_transactions() {
                if let Err(record_err) = session
                    .store
                    .append(
                        descriptor.version(),
                        &descriptor.description,
                        kind,
                        &descriptor.script,
                        descriptor.checksum,
                        &session.installed_by,
                        execution_time_ms,
                        false,
                    )
                    .await
                {
                    tracing::warn!(
                        script = %descriptor.script,
                        error = %record_err,
                        "Failed to record migration failure in the metadata collection"
                    );
                }
            }
            tracing::error!(script = %descriptor.script, reason = %e, "Migration failed");
            Err(MilepostError::MigrationFailed {
                script: descriptor.script.clone(),
                reason: e.to_string(),
                applied: applied_so_far,
            })
        }
    }
}
