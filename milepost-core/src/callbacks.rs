//! Lifecycle callbacks: an ordered, typed event bus.
//!
//! Every command fires `before_<command>` on entry and `after_<command>` on
//! normal exit; migrate additionally brackets each script with the
//! `each_migrate` pair. Handlers run in list order and their errors abort
//! the command. The default handler executes callback script files found in
//! the configured locations (`beforeMigrate.js`,
//! `afterEachMigrate__refresh_views.js`, ...).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::{Backend, ScriptBody};
use crate::config::Configuration;
use crate::error::{MilepostError, Result};
use crate::placeholder::replace_placeholders;

/// A lifecycle event, named after the command phase it brackets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Event {
    BeforeMigrate,
    AfterMigrate,
    BeforeEachMigrate,
    AfterEachMigrate,
    BeforeValidate,
    AfterValidate,
    BeforeInfo,
    AfterInfo,
    BeforeBaseline,
    AfterBaseline,
    BeforeClean,
    AfterClean,
    BeforeRepair,
    AfterRepair,
}

impl Event {
    pub const ALL: [Event; 14] = [
        Event::BeforeMigrate,
        Event::AfterMigrate,
        Event::BeforeEachMigrate,
        Event::AfterEachMigrate,
        Event::BeforeValidate,
        Event::AfterValidate,
        Event::BeforeInfo,
        Event::AfterInfo,
        Event::BeforeBaseline,
        Event::AfterBaseline,
        Event::BeforeClean,
        Event::AfterClean,
        Event::BeforeRepair,
        Event::AfterRepair,
    ];

    /// The event's script-file name, e.g. `beforeMigrate`.
    pub fn name(&self) -> &'static str {
        match self {
            Event::BeforeMigrate => "beforeMigrate",
            Event::AfterMigrate => "afterMigrate",
            Event::BeforeEachMigrate => "beforeEachMigrate",
            Event::AfterEachMigrate => "afterEachMigrate",
            Event::BeforeValidate => "beforeValidate",
            Event::AfterValidate => "afterValidate",
            Event::BeforeInfo => "beforeInfo",
            Event::AfterInfo => "afterInfo",
            Event::BeforeBaseline => "beforeBaseline",
            Event::AfterBaseline => "afterBaseline",
            Event::BeforeClean => "beforeClean",
            Event::AfterClean => "afterClean",
            Event::BeforeRepair => "beforeRepair",
            Event::AfterRepair => "afterRepair",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A lifecycle handler.
///
/// Configuration-aware handlers receive the configuration once at
/// registration time, not per event.
#[async_trait]
pub trait Callback: Send + Sync {
    /// Handler name for diagnostics.
    fn name(&self) -> &str;

    /// Called once when the handler is registered on the bus.
    fn inject_configuration(&self, _config: &Configuration) {}

    async fn handle(&self, event: Event, backend: &dyn Backend) -> Result<()>;
}

/// Ordered list of lifecycle handlers.
pub struct CallbackBus {
    callbacks: Vec<Arc<dyn Callback>>,
}

impl CallbackBus {
    /// Custom handlers first, then the default script-file handler unless
    /// `skip_default_callbacks` is set. Every handler gets the configuration
    /// injected once.
    pub fn from_config(config: &Configuration) -> Result<Self> {
        let mut callbacks: Vec<Arc<dyn Callback>> = config.custom_callbacks.clone();
        if !config.skip_default_callbacks {
            callbacks.push(Arc::new(ScriptCallback::scan(config)?));
        }
        for callback in &callbacks {
            callback.inject_configuration(config);
        }
        Ok(Self { callbacks })
    }

    /// Fire one event through every handler in order; the first error aborts.
    pub async fn fire(&self, event: Event, backend: &dyn Backend) -> Result<()> {
        for callback in &self.callbacks {
            if let Err(e) = callback.handle(event, backend).await {
                return Err(MilepostError::CallbackFailed {
                    callback: callback.name().to_string(),
                    event: event.to_string(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }
}

struct CallbackScript {
    event: Event,
    name: String,
    body: String,
    executor_tag: String,
}

/// Default handler: executes callback script files from the configured
/// locations at the matching lifecycle point. Multiple files per event run
/// in lexicographic order.
pub struct ScriptCallback {
    scripts: Vec<CallbackScript>,
    placeholders: HashMap<String, String>,
    table: String,
}

impl ScriptCallback {
    pub fn scan(config: &Configuration) -> Result<Self> {
        let suffixes: Vec<(String, &'static str)> = match &config.suffix {
            Some(s) => vec![(s.clone(), "js")],
            None => vec![(".js".to_string(), "js"), (".json".to_string(), "json")],
        };

        let mut scripts = Vec::new();

        for location in &config.locations {
            let dir = location.dir();
            if !dir.exists() {
                continue;
            }

            let entries =
                std::fs::read_dir(&dir).map_err(|e| MilepostError::LocationUnreadable {
                    location: location.to_string(),
                    reason: e.to_string(),
                })?;

            for entry in entries {
                let entry = entry.map_err(|e| MilepostError::LocationUnreadable {
                    location: location.to_string(),
                    reason: e.to_string(),
                })?;
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let filename = match path.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name.to_string(),
                    None => continue,
                };

                for (suffix, tag) in &suffixes {
                    let Some(stem) = filename.strip_suffix(suffix.as_str()) else {
                        continue;
                    };
                    let Some(event) = match_event(stem, &config.separator) else {
                        continue;
                    };
                    let body = std::fs::read_to_string(&path).map_err(|e| {
                        MilepostError::LocationUnreadable {
                            location: location.to_string(),
                            reason: format!("failed to read '{}': {}", filename, e),
                        }
                    })?;
                    scripts.push(CallbackScript {
                        event,
                        name: filename.clone(),
                        body,
                        executor_tag: tag.to_string(),
                    });
                    break;
                }
            }
        }

        scripts.sort_by(|a, b| a.event.cmp(&b.event).then_with(|| a.name.cmp(&b.name)));

        Ok(Self {
            scripts,
            placeholders: config.placeholders.clone(),
            table: config.metadata_table.clone(),
        })
    }

    /// How many scripts were discovered, across all events.
    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

/// Match a filename stem against the event names: either `<event>` exactly
/// or `<event><separator><description>`.
fn match_event(stem: &str, separator: &str) -> Option<Event> {
    Event::ALL.into_iter().find(|event| {
        stem == event.name()
            || stem
                .strip_prefix(event.name())
                .is_some_and(|rest| rest.starts_with(separator))
    })
}

#[async_trait]
impl Callback for ScriptCallback {
    fn name(&self) -> &str {
        "script-callback"
    }

    async fn handle(&self, event: Event, backend: &dyn Backend) -> Result<()> {
        for script in self.scripts.iter().filter(|s| s.event == event) {
            tracing::info!(event = %event, script = %script.name, "Running callback script");

            let user = backend
                .session_user()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            let placeholders = crate::placeholder::build_placeholders(
                &self.placeholders,
                &self.table,
                &user,
                &script.name,
            );
            let source = replace_placeholders(&script.body, &placeholders)?;

            backend
                .execute_script(ScriptBody {
                    name: &script.name,
                    source: &source,
                    executor_tag: &script.executor_tag,
                })
                .await?;
        }
        Ok(())
    }
}
