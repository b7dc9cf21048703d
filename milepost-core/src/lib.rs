//! Schema migration engine with pluggable storage backends.
//!
//! Milepost applies versioned (`V1__desc.js`) and repeatable (`R__desc.js`)
//! migration scripts to a target database, recording each application in a
//! metadata collection so that runs are idempotent and safe across restarts.
//! The database driver stays out of tree: the engine is written against the
//! [`backend::Backend`] capability set.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use milepost_core::config::Configuration;
//! use milepost_core::testing::MemoryBackend;
//! use milepost_core::Milepost;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Configuration::load(None)?;
//! let engine = Milepost::with_backend(config, Arc::new(MemoryBackend::new()));
//! let report = engine.migrate().await?;
//! println!("Applied {} migrations", report.migrations_applied);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`config`] — Configuration loading (TOML, key/value properties)
//! - [`version`] — Version keys and target resolution
//! - [`resolver`] — Script filename grammar and migration resolution
//! - [`backend`] — The capability set drivers implement
//! - [`store`] — Metadata collection operations and the advisory lock
//! - [`info`] — Joined per-migration state view
//! - [`validator`] — Resolved-vs-applied validation policy
//! - [`commands`] — Command bodies (migrate, info, validate, repair, baseline, clean)
//! - [`executor`] — The envelope every command runs in
//! - [`callbacks`] — Lifecycle callback bus
//! - [`checksum`] — CRC32 checksums
//! - [`placeholder`] — `${key}` placeholder replacement in script bodies
//! - [`testing`] — In-memory backend for tests
//! - [`error`] — Error types

pub mod backend;
pub mod callbacks;
pub mod checksum;
pub mod commands;
pub mod config;
pub mod error;
pub mod executor;
pub mod info;
pub mod placeholder;
pub mod resolver;
pub mod store;
pub mod testing;
pub mod validator;
pub mod version;

use std::sync::Arc;

use error::Result;

pub use backend::{Backend, BackendFactory};
pub use commands::clean::CleanReport;
pub use commands::migrate::MigrateReport;
pub use commands::repair::RepairReport;
pub use commands::validate::ValidateReport;
pub use config::Configuration;
pub use error::{ErrorKind, MilepostError};
pub use executor::BackendSource;
pub use info::{InfoRow, MigrationState};
pub use version::{Target, VersionKey};

/// Main entry point for the Milepost library.
///
/// Create a `Milepost` instance with a configuration and a backend (or a
/// backend factory) and use its methods to run migration commands. Each
/// command runs under the store's exclusive advisory lock; concurrent
/// engine instances against the same database serialize on it.
pub struct Milepost {
    pub config: Configuration,
    source: BackendSource,
}

impl Milepost {
    /// An engine without a backend; commands fail with `NOT_CONFIGURED`
    /// until one is attached through the other constructors.
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            source: BackendSource::None,
        }
    }

    /// Borrow a caller-supplied backend. The engine never closes it.
    pub fn with_backend(config: Configuration, backend: Arc<dyn Backend>) -> Self {
        Self {
            config,
            source: BackendSource::Shared(backend),
        }
    }

    /// Open a fresh backend per command through `factory` and close it on
    /// command exit.
    pub fn with_backend_factory(config: Configuration, factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            config,
            source: BackendSource::Factory(factory),
        }
    }

    /// Apply pending migrations up to the configured target.
    pub async fn migrate(&self) -> Result<MigrateReport> {
        let session = executor::open(&self.config, &self.source).await?;
        let result = session.store.lock(commands::migrate::run(&session)).await;
        executor::close(session).await;
        result
    }

    /// Show the joined per-migration state view.
    pub async fn info(&self) -> Result<Vec<InfoRow>> {
        let session = executor::open(&self.config, &self.source).await?;
        let result = session.store.lock(commands::info::run(&session)).await;
        executor::close(session).await;
        result
    }

    /// Validate applied migrations against the resolved scripts.
    pub async fn validate(&self) -> Result<ValidateReport> {
        let session = executor::open(&self.config, &self.source).await?;
        let result = session.store.lock(commands::validate::run(&session)).await;
        executor::close(session).await;
        result
    }

    /// Repair the metadata collection.
    pub async fn repair(&self) -> Result<RepairReport> {
        let session = executor::open(&self.config, &self.source).await?;
        let result = session.store.lock(commands::repair::run(&session)).await;
        executor::close(session).await;
        result
    }

    /// Baseline an existing database at the configured baseline version.
    pub async fn baseline(&self) -> Result<()> {
        let session = executor::open(&self.config, &self.source).await?;
        let result = session.store.lock(commands::baseline::run(&session)).await;
        executor::close(session).await;
        result
    }

    /// Drop the objects the engine owns.
    pub async fn clean(&self) -> Result<CleanReport> {
        let session = executor::open(&self.config, &self.source).await?;
        let result = session.store.lock(commands::clean::run(&session)).await;
        executor::close(session).await;
        result
    }
}
