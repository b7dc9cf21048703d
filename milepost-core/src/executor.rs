//! The command envelope shared by every lifecycle command: backend
//! acquisition, resolver and callback construction, metadata bootstrap and
//! layout upgrade. The command bodies themselves live in [`crate::commands`]
//! and run inside [`crate::store::MetadataStore::lock`].

use std::sync::Arc;

use crate::backend::{Backend, BackendFactory};
use crate::callbacks::CallbackBus;
use crate::commands;
use crate::config::Configuration;
use crate::error::{MilepostError, Result};
use crate::resolver::{collect_migrations, MigrationDescriptor};
use crate::store::MetadataStore;

/// Where the engine gets its backend from.
#[derive(Clone)]
pub enum BackendSource {
    /// No backend attached; every command fails with `NOT_CONFIGURED`.
    None,
    /// Borrowed from the caller; never closed by the engine.
    Shared(Arc<dyn Backend>),
    /// Opened by the engine per command and closed on exit.
    Factory(Arc<dyn BackendFactory>),
}

/// Everything a command body needs, assembled once per command.
pub(crate) struct Session<'a> {
    pub config: &'a Configuration,
    pub backend: Arc<dyn Backend>,
    pub store: MetadataStore,
    pub callbacks: CallbackBus,
    pub resolved: Vec<MigrationDescriptor>,
    pub installed_by: String,
    owned: bool,
}

pub(crate) async fn open<'a>(
    config: &'a Configuration,
    source: &BackendSource,
) -> Result<Session<'a>> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Milepost");

    let (backend, owned) = match source {
        BackendSource::None => return Err(MilepostError::NotConfigured),
        BackendSource::Shared(backend) => (Arc::clone(backend), false),
        BackendSource::Factory(factory) => (factory.open().await?, true),
    };
    backend.ping().await?;

    let callbacks = CallbackBus::from_config(config)?;
    let resolved = collect_migrations(config)?;
    let store = MetadataStore::new(Arc::clone(&backend), config);

    store.create_if_absent().await?;
    if store.upgrade_if_necessary().await? {
        let (checksums_updated, _) = commands::repair::repair_checksums(&store, &resolved).await?;
        tracing::info!(
            checksums_updated = checksums_updated,
            "Metadata collection upgraded to the current layout"
        );
    }

    let installed_by = match &config.installed_by {
        Some(name) => name.clone(),
        None => backend
            .session_user()
            .await
            .unwrap_or_else(|_| "unknown".to_string()),
    };

    Ok(Session {
        config,
        backend,
        store,
        callbacks,
        resolved,
        installed_by,
        owned,
    })
}

/// End a command: a factory-opened backend is closed, a shared one is not.
pub(crate) async fn close(session: Session<'_>) {
    if session.owned {
        if let Err(e) = session.backend.close().await {
            tracing::warn!(error = %e, "Failed to close backend");
        }
    }
}
