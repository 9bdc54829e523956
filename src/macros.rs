//! Field macros
//!
//! A macro is a named, ordered list of field steps (set, clear, append)
//! with optional explicit delays. Steps run one after another with a short
//! pause between field writes so the host form can react to each commit.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::events::{self, event_names, EventSink, ToastLevel};
use crate::fields::{FieldError, FieldRegistry, WriteOptions};
use crate::pattern::{substitute, SubstitutionContext};
use crate::storage::{keys, Persistence, PersistenceExt};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MacroStep {
    SetField { field: String, value: String },
    ClearField { field: String },
    AppendField { field: String, value: String },
    Delay { ms: u64 },
}

impl MacroStep {
    fn field(&self) -> Option<&str> {
        match self {
            MacroStep::SetField { field, .. }
            | MacroStep::ClearField { field }
            | MacroStep::AppendField { field, .. } => Some(field),
            MacroStep::Delay { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Macro {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub steps: Vec<MacroStep>,
}

impl Macro {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: MacroStep) -> Self {
        self.steps.push(step);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MacroError {
    #[error("Macro '{0}' not found")]
    NotFound(String),

    #[error("Macro '{0}' already exists")]
    DuplicateId(String),

    #[error("Macro step {step} failed: {source}")]
    Step {
        step: usize,
        #[source]
        source: FieldError,
    },
}

/// What a macro run did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MacroReport {
    pub macro_id: String,
    /// Fields actually written, in order (repeats possible)
    pub fields_set: Vec<String>,
    /// Steps skipped because their field is unknown
    pub skipped: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persisted macro list
pub struct MacroStore {
    macros: RwLock<Arc<Vec<Macro>>>,
    persistence: Option<Arc<dyn Persistence>>,
}

impl Default for MacroStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MacroStore {
    pub fn new() -> Self {
        Self {
            macros: RwLock::new(Arc::new(Vec::new())),
            persistence: None,
        }
    }

    pub fn load(persistence: Arc<dyn Persistence>) -> Self {
        let stored: Vec<Macro> = persistence.load(keys::MACROS, Vec::new());
        Self {
            macros: RwLock::new(Arc::new(stored)),
            persistence: Some(persistence),
        }
    }

    pub fn all(&self) -> Arc<Vec<Macro>> {
        self.macros.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<Macro> {
        self.macros.read().iter().find(|m| m.id == id).cloned()
    }

    pub fn add(&self, item: Macro) -> Result<(), MacroError> {
        {
            let mut guard = self.macros.write();
            if guard.iter().any(|m| m.id == item.id) {
                return Err(MacroError::DuplicateId(item.id));
            }
            let mut next = guard.as_ref().clone();
            next.push(item);
            *guard = Arc::new(next);
        }
        self.persist();
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<Macro, MacroError> {
        let removed = {
            let mut guard = self.macros.write();
            let index = guard
                .iter()
                .position(|m| m.id == id)
                .ok_or_else(|| MacroError::NotFound(id.to_string()))?;
            let mut next = guard.as_ref().clone();
            let removed = next.remove(index);
            *guard = Arc::new(next);
            removed
        };
        self.persist();
        Ok(removed)
    }

    fn persist(&self) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.save(keys::MACROS, self.all().as_ref()) {
                tracing::error!("Failed to persist macros: {}", e);
            }
        }
    }
}

/// Runs macros against the field registry
pub struct MacroExecutor {
    fields: Arc<dyn FieldRegistry>,
    events: Arc<dyn EventSink>,
    step_delay: Duration,
}

impl MacroExecutor {
    pub fn new(fields: Arc<dyn FieldRegistry>, events: Arc<dyn EventSink>, step_delay: Duration) -> Self {
        Self {
            fields,
            events,
            step_delay,
        }
    }

    /// Run every step in order. Stops at the first failed write.
    pub async fn run(&self, item: &Macro) -> Result<MacroReport, MacroError> {
        tracing::info!("Running macro '{}' ({} steps)", item.name, item.steps.len());
        let mut report = MacroReport {
            macro_id: item.id.clone(),
            ..MacroReport::default()
        };
        let mut wrote_before = false;

        for (index, step) in item.steps.iter().enumerate() {
            if let MacroStep::Delay { ms } = step {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                continue;
            }
            let Some(field) = step.field() else {
                continue;
            };
            if !self.fields.exists(field) {
                tracing::warn!("Macro '{}' step {} targets unknown field '{}'", item.name, index, field);
                report.skipped.push(field.to_string());
                continue;
            }

            if wrote_before && !self.step_delay.is_zero() {
                tokio::time::sleep(self.step_delay).await;
            }
            wrote_before = true;

            let value = self.resolve(step, field);
            match self.fields.write(field, &value, WriteOptions::default()) {
                Ok(true) => report.fields_set.push(field.to_string()),
                Ok(false) => {}
                Err(source) => {
                    tracing::error!("Macro '{}' stopped at step {}: {}", item.name, index, source);
                    report.error = Some(source.to_string());
                    events::emit(self.events.as_ref(), event_names::MACRO_FINISHED, &report);
                    events::toast(
                        self.events.as_ref(),
                        ToastLevel::Error,
                        &format!("Macro {} failed: {}", item.name, source),
                    );
                    return Err(MacroError::Step { step: index, source });
                }
            }
        }

        events::emit(self.events.as_ref(), event_names::MACRO_FINISHED, &report);
        Ok(report)
    }

    /// New value for a field step, reading current values for `${field:key}`
    fn resolve(&self, step: &MacroStep, field: &str) -> String {
        let snapshot: HashMap<String, String> = self.fields.snapshot();
        let ctx = SubstitutionContext {
            scan: "",
            directive: None,
            groups: &[],
            fields: &snapshot,
        };
        match step {
            MacroStep::SetField { value, .. } => substitute(value, &ctx),
            MacroStep::ClearField { .. } => String::new(),
            MacroStep::AppendField { value, .. } => {
                format!("{}{}", self.fields.read(field), substitute(value, &ctx))
            }
            MacroStep::Delay { .. } => String::new(),
        }
    }
}
