//! The backend capability set the engine is built against.
//!
//! The core never talks to a concrete database driver. It depends on
//! [`Backend`] for everything stateful: executing script bodies, inspecting
//! and dropping schemas, advisory locking, and reading/writing the raw
//! metadata documents the [`crate::store::MetadataStore`] is layered on.
//! Drivers implement this trait out of tree; [`crate::testing::MemoryBackend`]
//! implements it in memory for tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// A script about to be executed, with placeholders already substituted.
#[derive(Debug, Clone, Copy)]
pub struct ScriptBody<'a> {
    /// Script identity, e.g. the filename.
    pub name: &'a str,
    /// Full script source.
    pub source: &'a str,
    /// Which interpreter should run this script (e.g. `"js"`).
    pub executor_tag: &'a str,
}

/// A raw metadata document as stored by the backend.
///
/// Fields added by newer layouts are optional so that legacy collections can
/// be read before [`crate::store::MetadataStore::upgrade_if_necessary`]
/// rewrites them.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    pub install_rank: i64,
    pub version: Option<String>,
    pub description: String,
    /// `"VERSIONED"`, `"REPEATABLE"`, `"BASELINE"` or `"SCHEMA"`; absent in
    /// legacy layouts.
    pub kind: Option<String>,
    pub script: String,
    pub checksum: Option<i32>,
    pub installed_by: Option<String>,
    pub installed_on: Option<DateTime<Utc>>,
    pub execution_time: Option<i32>,
    pub success: Option<bool>,
}

/// Capability set a storage backend must provide.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Verify connectivity; called once per command before anything else.
    async fn ping(&self) -> Result<()>;

    /// Execute one script body against the database.
    async fn execute_script(&self, script: ScriptBody<'_>) -> Result<()>;

    /// Names of user schemas/collections currently present (the metadata
    /// collection excluded).
    async fn enumerate_schemas(&self) -> Result<Vec<String>>;

    /// Drop a schema/collection and everything in it.
    async fn drop_schema(&self, name: &str) -> Result<()>;

    /// Whether the target database holds no user data.
    async fn is_empty(&self) -> Result<bool>;

    /// The authenticated user of this connection, recorded as `installed_by`
    /// unless overridden in the configuration.
    async fn session_user(&self) -> Result<String>;

    /// Try to take the advisory lock for `key`; `false` when already held by
    /// someone else. Must survive crashes (native advisory lock, or a lock
    /// document with a lease).
    async fn try_lock(&self, key: i64) -> Result<bool>;

    /// Release the advisory lock for `key`.
    async fn unlock(&self, key: i64) -> Result<()>;

    async fn collection_exists(&self, collection: &str) -> Result<bool>;

    /// Create the metadata collection and its `install_rank` index.
    /// Idempotent.
    async fn create_collection(&self, collection: &str) -> Result<()>;

    /// All metadata documents, ordered by `install_rank`.
    async fn read_entries(&self, collection: &str) -> Result<Vec<RawEntry>>;

    async fn insert_entry(&self, collection: &str, entry: RawEntry) -> Result<()>;

    /// Replace the document with the given `install_rank` (layout upgrades).
    async fn rewrite_entry(&self, collection: &str, install_rank: i64, entry: RawEntry)
        -> Result<()>;

    /// Delete documents with `success = false`; returns how many were removed.
    async fn delete_failed(&self, collection: &str) -> Result<u64>;

    /// Rewrite the checksum of the entries matching the given identity:
    /// by version string for versioned entries, by description for
    /// repeatable ones (`version` absent).
    async fn update_checksum(
        &self,
        collection: &str,
        version: Option<&str>,
        description: &str,
        checksum: i32,
    ) -> Result<()>;

    /// Whether a failed script leaves no partial state behind. When true,
    /// migrate does not record failed entries; when false it records them so
    /// that repair can clear them.
    fn supports_transactions(&self) -> bool {
        false
    }

    /// Release the underlying connection. Only called for backends the
    /// engine opened itself (through a [`BackendFactory`]).
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens a fresh backend per command.
///
/// When the engine is configured with a factory instead of a shared backend,
/// each command opens its own connection and closes it on exit. A backend
/// supplied directly by the caller is borrowed and never closed.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn Backend>>;
}
