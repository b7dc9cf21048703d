use serde::Serialize;

use crate::callbacks::Event;
use crate::error::{MilepostError, Result};
use crate::executor::Session;
use crate::info::build_info;
use crate::validator::{validate, ValidationOptions};

/// Report returned after a validate operation.
#[derive(Debug, Serialize)]
pub struct ValidateReport {
    pub valid: bool,
    pub warnings: Vec<String>,
}

/// Strict validation: pending migrations are an error here, unlike the
/// implicit validation migrate performs.
pub(crate) async fn run(session: &Session<'_>) -> Result<ValidateReport> {
    let config = session.config;
    let backend = session.backend.as_ref();

    session.callbacks.fire(Event::BeforeValidate, backend).await?;

    let applied = session.store.all_applied().await?;
    let set = build_info(&session.resolved, &applied, config);
    let verdict = validate(
        &set,
        &ValidationOptions {
            pending_not_ok: true,
            ignore_future: config.ignore_future,
        },
    );

    for warning in &verdict.warnings {
        tracing::warn!("{}", warning);
    }

    if let Some(error) = verdict.error {
        tracing::error!(error = %error, "Validation failed");
        if config.clean_on_validation_error {
            super::clean::drop_managed(session).await?;
            session.store.create_if_absent().await?;
        } else {
            return Err(MilepostError::ValidationFailed(error.to_string()));
        }
    }

    session.callbacks.fire(Event::AfterValidate, backend).await?;

    Ok(ValidateReport {
        valid: true,
        warnings: verdict.warnings,
    })
}
