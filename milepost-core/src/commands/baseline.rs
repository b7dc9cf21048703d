//! Anchor an existing database at the configured baseline version.

use crate::callbacks::Event;
use crate::error::Result;
use crate::executor::Session;

pub(crate) async fn run(session: &Session<'_>) -> Result<()> {
    let config = session.config;
    let backend = session.backend.as_ref();

    session.callbacks.fire(Event::BeforeBaseline, backend).await?;

    session
        .store
        .add_baseline_marker(
            &config.baseline_version,
            &config.baseline_description,
            &session.installed_by,
        )
        .await?;

    session.callbacks.fire(Event::AfterBaseline, backend).await?;
    Ok(())
}
