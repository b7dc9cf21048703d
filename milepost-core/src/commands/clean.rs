//! Drop the objects the engine owns (destructive).

use serde::Serialize;

use crate::callbacks::Event;
use crate::error::{MilepostError, Result};
use crate::executor::Session;

/// Report returned after a clean operation.
#[derive(Debug, Serialize)]
pub struct CleanReport {
    pub dropped: Vec<String>,
}

pub(crate) async fn run(session: &Session<'_>) -> Result<CleanReport> {
    if session.config.clean_disabled {
        return Err(MilepostError::CleanDisabled);
    }
    let backend = session.backend.as_ref();

    session.callbacks.fire(Event::BeforeClean, backend).await?;
    let dropped = drop_managed(session).await?;
    session.callbacks.fire(Event::AfterClean, backend).await?;

    Ok(CleanReport { dropped })
}

/// Drop what the engine owns.
///
/// With a schema marker on record the engine created the database contents,
/// so every schema goes. Without one, pre-existing user data is preserved
/// and only the metadata collection is dropped.
pub(crate) async fn drop_managed(session: &Session<'_>) -> Result<Vec<String>> {
    let mut dropped = Vec::new();

    tracing::warn!("Starting clean");

    if session.store.has_schema_marker().await? {
        for schema in session.backend.enumerate_schemas().await? {
            session.backend.drop_schema(&schema).await?;
            dropped.push(schema);
        }
    } else {
        tracing::warn!("No schema marker on record; preserving pre-existing schemas");
    }

    let collection = session.store.collection().to_string();
    session.backend.drop_schema(&collection).await?;
    dropped.push(collection);

    tracing::warn!(objects_dropped = dropped.len(), "Clean completed");
    Ok(dropped)
}
