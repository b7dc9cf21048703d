//! Metadata store operations: the persistent ordered log of applied
//! migrations, schema/baseline markers, the exclusive advisory lock, and
//! the layout upgrade of the store's own format.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backend::{Backend, RawEntry};
use crate::config::Configuration;
use crate::error::{MilepostError, Result};
use crate::version::VersionKey;

/// Description stored with the schema marker entry.
pub const SCHEMA_MARKER_DESCRIPTION: &str = "<< Schema Creation >>";

/// How long to sleep between advisory-lock attempts (plus jitter).
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// The kind of a metadata entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    Versioned,
    Repeatable,
    Baseline,
    Schema,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Versioned => "VERSIONED",
            EntryKind::Repeatable => "REPEATABLE",
            EntryKind::Baseline => "BASELINE",
            EntryKind::Schema => "SCHEMA",
        }
    }

    fn parse(s: &str) -> Option<EntryKind> {
        match s {
            "VERSIONED" => Some(EntryKind::Versioned),
            "REPEATABLE" => Some(EntryKind::Repeatable),
            "BASELINE" => Some(EntryKind::Baseline),
            "SCHEMA" => Some(EntryKind::Schema),
            _ => None,
        }
    }

    /// Markers are bookkeeping entries, not applied migrations.
    pub fn is_marker(&self) -> bool {
        matches!(self, EntryKind::Baseline | EntryKind::Schema)
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entry from the metadata collection.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedEntry {
    /// Monotonically increasing rank assigned by the store on append.
    pub install_rank: i64,
    /// Version, or `None` for repeatable migrations and the schema marker.
    pub version: Option<VersionKey>,
    pub description: String,
    pub kind: EntryKind,
    /// Script identity as resolved at application time.
    pub script: String,
    /// CRC32 of the script body, or `None` for markers.
    pub checksum: Option<i32>,
    pub installed_by: String,
    pub installed_on: DateTime<Utc>,
    pub execution_time_ms: i32,
    pub success: bool,
}

impl AppliedEntry {
    fn from_raw(raw: RawEntry) -> Result<Self> {
        let version = raw.version.as_deref().map(VersionKey::parse).transpose()?;
        let kind = match raw.kind.as_deref().and_then(EntryKind::parse) {
            Some(kind) => kind,
            None => infer_kind(&raw),
        };
        Ok(AppliedEntry {
            install_rank: raw.install_rank,
            version,
            description: raw.description,
            kind,
            script: raw.script,
            checksum: raw.checksum,
            installed_by: raw.installed_by.unwrap_or_else(|| "unknown".to_string()),
            installed_on: raw.installed_on.unwrap_or_else(Utc::now),
            execution_time_ms: raw.execution_time.unwrap_or(0),
            success: raw.success.unwrap_or(true),
        })
    }
}

/// Conservative kind inference for legacy documents without a `kind` field.
fn infer_kind(raw: &RawEntry) -> EntryKind {
    if raw.description == SCHEMA_MARKER_DESCRIPTION {
        EntryKind::Schema
    } else if raw.version.is_some() {
        EntryKind::Versioned
    } else {
        EntryKind::Repeatable
    }
}

fn is_legacy(raw: &RawEntry) -> bool {
    raw.kind.is_none()
        || raw.installed_by.is_none()
        || raw.installed_on.is_none()
        || raw.execution_time.is_none()
        || raw.success.is_none()
}

/// Releases the advisory lock if the guarded future is dropped mid-flight
/// (cancellation). The normal path disarms the guard and unlocks explicitly.
struct UnlockGuard {
    backend: Arc<dyn Backend>,
    key: i64,
    armed: bool,
}

impl Drop for UnlockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let backend = Arc::clone(&self.backend);
            let key = self.key;
            handle.spawn(async move {
                if let Err(e) = backend.unlock(key).await {
                    tracing::warn!(error = %e, "Failed to release metadata lock on cancellation");
                }
            });
        }
    }
}

/// Handle to the metadata collection of one engine instance.
pub struct MetadataStore {
    backend: Arc<dyn Backend>,
    collection: String,
    lock_key: i64,
    lock_timeout: Option<Duration>,
    held: AtomicBool,
}

impl MetadataStore {
    pub fn new(backend: Arc<dyn Backend>, config: &Configuration) -> Self {
        // CRC32 of the collection name: stable across engine versions, unlike
        // the std hasher.
        let lock_key = crc32fast::hash(config.metadata_table.as_bytes()) as i64;
        Self {
            backend,
            collection: config.metadata_table.clone(),
            lock_key,
            lock_timeout: match config.lock_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs as u64)),
            },
            held: AtomicBool::new(false),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The advisory-lock key guarding this store.
    pub fn lock_key(&self) -> i64 {
        self.lock_key
    }

    /// Whether the metadata collection is present.
    pub async fn exists(&self) -> Result<bool> {
        self.backend.collection_exists(&self.collection).await
    }

    /// Create the metadata collection and its index. Idempotent.
    pub async fn create_if_absent(&self) -> Result<()> {
        if self.exists().await? {
            return Ok(());
        }
        tracing::info!(collection = %self.collection, "Creating metadata collection");
        self.backend.create_collection(&self.collection).await
    }

    /// Migrate documents in a legacy layout to the current one, filling
    /// missing fields with conservative defaults. Returns `true` when
    /// anything was rewritten; the caller is expected to re-run the checksum
    /// repair afterwards.
    pub async fn upgrade_if_necessary(&self) -> Result<bool> {
        let raws = self.backend.read_entries(&self.collection).await?;
        let mut upgraded = false;

        for raw in raws {
            if !is_legacy(&raw) {
                continue;
            }
            let rank = raw.install_rank;
            let fixed = RawEntry {
                kind: Some(
                    raw.kind
                        .as_deref()
                        .and_then(EntryKind::parse)
                        .unwrap_or_else(|| infer_kind(&raw))
                        .as_str()
                        .to_string(),
                ),
                installed_by: raw.installed_by.clone().or_else(|| Some("unknown".to_string())),
                installed_on: raw.installed_on.or_else(|| Some(Utc::now())),
                execution_time: raw.execution_time.or(Some(0)),
                success: raw.success.or(Some(true)),
                ..raw
            };
            self.backend
                .rewrite_entry(&self.collection, rank, fixed)
                .await?;
            upgraded = true;
        }

        Ok(upgraded)
    }

    /// Run `body` while holding the store's exclusive advisory lock.
    ///
    /// The lock is released on every exit path: success, failure, and
    /// cancellation (via a drop guard that spawns the unlock). Reentrant for
    /// the owning store instance. Acquisition polls with jittered retries,
    /// bounded by the configured lock timeout.
    pub async fn lock<T, Fut>(&self, body: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        if self.held.load(Ordering::Acquire) {
            return body.await;
        }

        let started = Instant::now();
        loop {
            if self.backend.try_lock(self.lock_key).await? {
                break;
            }
            if let Some(timeout) = self.lock_timeout {
                if started.elapsed() >= timeout {
                    return Err(MilepostError::LockTimeout {
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
            let jitter = Duration::from_millis(fastrand::u64(0..50));
            tokio::time::sleep(LOCK_RETRY_INTERVAL + jitter).await;
        }

        self.held.store(true, Ordering::Release);
        let mut guard = UnlockGuard {
            backend: Arc::clone(&self.backend),
            key: self.lock_key,
            armed: true,
        };

        let result = body.await;

        guard.armed = false;
        self.held.store(false, Ordering::Release);
        if let Err(e) = self.backend.unlock(self.lock_key).await {
            tracing::warn!(error = %e, "Failed to release metadata lock");
        }

        result
    }

    /// All entries, ordered by `install_rank`.
    pub async fn all_applied(&self) -> Result<Vec<AppliedEntry>> {
        let raws = self.backend.read_entries(&self.collection).await?;
        raws.into_iter().map(AppliedEntry::from_raw).collect()
    }

    /// Append an entry, assigning the next `install_rank`.
    ///
    /// Fails when the identity would duplicate an existing successful
    /// versioned entry. Returns the assigned rank.
    #[allow(clippy::too_many_arguments)]
    pub async fn append(
        &self,
        version: Option<&VersionKey>,
        description: &str,
        kind: EntryKind,
        script: &str,
        checksum: Option<i32>,
        installed_by: &str,
        execution_time_ms: i32,
        success: bool,
    ) -> Result<i64> {
        let existing = self.all_applied().await?;

        if kind == EntryKind::Versioned {
            let version = version.ok_or_else(|| {
                MilepostError::InvalidVersion("versioned entry without a version".to_string())
            })?;
            if let Some(prior) = existing.iter().find(|e| {
                e.kind == EntryKind::Versioned
                    && e.success
                    && e.version.as_ref() == Some(version)
                    && e.description == description
            }) {
                return Err(MilepostError::DuplicateMigration {
                    identity: format!("version {} ('{}')", version, description),
                    first: prior.script.clone(),
                    second: script.to_string(),
                });
            }
        }

        let rank = existing.iter().map(|e| e.install_rank).max().unwrap_or(0) + 1;
        self.backend
            .insert_entry(
                &self.collection,
                RawEntry {
                    install_rank: rank,
                    version: version.map(|v| v.raw.clone()),
                    description: description.to_string(),
                    kind: Some(kind.as_str().to_string()),
                    script: script.to_string(),
                    checksum,
                    installed_by: Some(installed_by.to_string()),
                    installed_on: Some(Utc::now()),
                    execution_time: Some(execution_time_ms),
                    success: Some(success),
                },
            )
            .await?;

        Ok(rank)
    }

    /// Record which schemas the engine created, as the distinguished rank-0
    /// entry. A second call is a no-op; a call after versioned entries exist
    /// is an error (the marker must precede them).
    pub async fn add_schema_marker(&self, schemas: &[String], installed_by: &str) -> Result<()> {
        let existing = self.all_applied().await?;
        if existing.iter().any(|e| e.kind == EntryKind::Schema) {
            tracing::debug!("Schema marker already present");
            return Ok(());
        }
        if existing.iter().any(|e| e.kind == EntryKind::Versioned) {
            return Err(MilepostError::NonEmptyHistory);
        }

        self.backend
            .insert_entry(
                &self.collection,
                RawEntry {
                    install_rank: 0,
                    version: None,
                    description: SCHEMA_MARKER_DESCRIPTION.to_string(),
                    kind: Some(EntryKind::Schema.as_str().to_string()),
                    script: schemas.join(","),
                    checksum: None,
                    installed_by: Some(installed_by.to_string()),
                    installed_on: Some(Utc::now()),
                    execution_time: Some(0),
                    success: Some(true),
                },
            )
            .await
    }

    /// Anchor the starting version with a baseline marker.
    pub async fn add_baseline_marker(
        &self,
        version: &VersionKey,
        description: &str,
        installed_by: &str,
    ) -> Result<()> {
        let existing = self.all_applied().await?;
        if existing.iter().any(|e| e.kind == EntryKind::Baseline) {
            return Err(MilepostError::AlreadyBaselined);
        }
        if existing.iter().any(|e| !e.kind.is_marker() && e.success) {
            return Err(MilepostError::NonEmptyHistory);
        }

        self.append(
            Some(version),
            description,
            EntryKind::Baseline,
            description,
            None,
            installed_by,
            0,
            true,
        )
        .await?;

        tracing::info!(version = %version, "Baselined metadata collection");
        Ok(())
    }

    /// Delete entries with `success = false`; returns how many were removed.
    pub async fn remove_failed(&self) -> Result<u64> {
        self.backend.delete_failed(&self.collection).await
    }

    /// Rewrite the stored checksum of the entries sharing `entry`'s identity.
    pub async fn update_checksum(&self, entry: &AppliedEntry, checksum: i32) -> Result<()> {
        self.backend
            .update_checksum(
                &self.collection,
                entry.version.as_ref().map(|v| v.raw.as_str()),
                &entry.description,
                checksum,
            )
            .await
    }

    pub async fn has_schema_marker(&self) -> Result<bool> {
        Ok(self
            .all_applied()
            .await?
            .iter()
            .any(|e| e.kind == EntryKind::Schema))
    }

    pub async fn has_baseline_marker(&self) -> Result<bool> {
        Ok(self
            .all_applied()
            .await?
            .iter()
            .any(|e| e.kind == EntryKind::Baseline))
    }

    /// Whether any non-marker entries exist, successful or failed.
    pub async fn has_applied_migrations(&self) -> Result<bool> {
        Ok(self
            .all_applied()
            .await?
            .iter()
            .any(|e| !e.kind.is_marker()))
    }
}
