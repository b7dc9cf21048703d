use crate::callbacks::Event;
use crate::error::Result;
use crate::executor::Session;
use crate::info::{build_info, InfoRow};

/// Build the joined per-migration view. Read-only apart from the shared
/// command envelope.
pub(crate) async fn run(session: &Session<'_>) -> Result<Vec<InfoRow>> {
    let backend = session.backend.as_ref();

    session.callbacks.fire(Event::BeforeInfo, backend).await?;

    let applied = session.store.all_applied().await?;
    let set = build_info(&session.resolved, &applied, session.config);

    session.callbacks.fire(Event::AfterInfo, backend).await?;

    Ok(set.rows)
}
