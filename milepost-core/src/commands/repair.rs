//! Repair the metadata collection: drop failed entries, realign checksums
//! with the currently resolved scripts.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::callbacks::Event;
use crate::error::Result;
use crate::executor::Session;
use crate::resolver::MigrationDescriptor;
use crate::store::MetadataStore;

/// Report returned after a repair operation.
#[derive(Debug, Serialize)]
pub struct RepairReport {
    pub failed_removed: u64,
    pub checksums_updated: usize,
    pub details: Vec<String>,
}

pub(crate) async fn run(session: &Session<'_>) -> Result<RepairReport> {
    let backend = session.backend.as_ref();

    session.callbacks.fire(Event::BeforeRepair, backend).await?;

    let failed_removed = session.store.remove_failed().await?;
    let mut details = Vec::new();
    if failed_removed > 0 {
        details.push(format!("Removed {} failed entry(ies)", failed_removed));
    }

    let (checksums_updated, mut update_details) =
        repair_checksums(&session.store, &session.resolved).await?;
    details.append(&mut update_details);

    session.callbacks.fire(Event::AfterRepair, backend).await?;

    tracing::info!(
        failed_removed = failed_removed,
        checksums_updated = checksums_updated,
        "Repair completed"
    );

    Ok(RepairReport {
        failed_removed,
        checksums_updated,
        details,
    })
}

/// Rewrite stored checksums that disagree with the currently resolved
/// scripts. Also run by the command envelope after a metadata layout
/// upgrade. Each identity is rewritten at most once; entries whose
/// descriptor is gone are left alone.
pub(crate) async fn repair_checksums(
    store: &MetadataStore,
    resolved: &[MigrationDescriptor],
) -> Result<(usize, Vec<String>)> {
    let applied = store.all_applied().await?;

    let by_version: HashMap<String, &MigrationDescriptor> = resolved
        .iter()
        .filter_map(|d| d.version().map(|v| (v.canonical(), d)))
        .collect();
    let by_description: HashMap<&str, &MigrationDescriptor> = resolved
        .iter()
        .filter(|d| !d.is_versioned())
        .map(|d| (d.description.as_str(), d))
        .collect();

    let mut updated_identities: HashSet<String> = HashSet::new();
    let mut details = Vec::new();

    for entry in &applied {
        if !entry.success || entry.kind.is_marker() {
            continue;
        }

        let descriptor = match &entry.version {
            Some(v) => by_version.get(&v.canonical()).copied(),
            None => by_description.get(entry.description.as_str()).copied(),
        };
        let Some(descriptor) = descriptor else {
            continue;
        };
        let Some(resolved_checksum) = descriptor.checksum else {
            continue;
        };
        if entry.checksum == Some(resolved_checksum) {
            continue;
        }

        let identity = match &entry.version {
            Some(v) => format!("v:{}", v.canonical()),
            None => format!("r:{}", entry.description),
        };
        if !updated_identities.insert(identity) {
            continue;
        }

        store.update_checksum(entry, resolved_checksum).await?;
        details.push(format!(
            "Updated checksum for {} ({} -> {})",
            entry.script,
            entry.checksum.map_or("none".to_string(), |c| c.to_string()),
            resolved_checksum
        ));
    }

    Ok((details.len(), details))
}
