//! Notification side-channel
//!
//! Components report observable changes (mode transitions, processed scans,
//! leadership changes) and user-facing failures through an [`EventSink`]
//! instead of returning them to the caller. The UI layer decides how to
//! render them; the core never waits on it.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

/// Event names emitted by the core
pub mod event_names {
    pub const MODE_CHANGED: &str = "mode-changed";
    pub const SCAN_CAPTURED: &str = "scan-captured";
    pub const SCAN_PROCESSED: &str = "scan-processed";
    pub const LEADER_CHANGED: &str = "leader-changed";
    pub const MACRO_FINISHED: &str = "macro-finished";
    pub const TOAST: &str = "toast";
}

/// Receiver for core notifications
pub trait EventSink: Send + Sync {
    fn emit_value(&self, event: &str, payload: Value);
}

/// Toast severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
struct ToastPayload<'a> {
    level: ToastLevel,
    message: &'a str,
}

/// Serialise `payload` and hand it to the sink, logging serialisation failures
pub fn emit<T: Serialize>(sink: &dyn EventSink, event: &str, payload: &T) {
    match serde_json::to_value(payload) {
        Ok(value) => sink.emit_value(event, value),
        Err(e) => tracing::error!("Failed to serialise '{}' payload: {}", event, e),
    }
}

/// Emit a user-visible toast
pub fn toast(sink: &dyn EventSink, level: ToastLevel, message: &str) {
    emit(sink, event_names::TOAST, &ToastPayload { level, message });
}

/// Sink that forwards every event to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit_value(&self, event: &str, payload: Value) {
        tracing::info!(event, %payload, "event");
    }
}

/// Sink that records events in memory, used by tests and the terminal driver
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<(String, Value)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events, oldest first
    pub fn events(&self) -> Vec<(String, Value)> {
        self.events.lock().clone()
    }

    /// Payloads of every event with the given name
    pub fn payloads(&self, event: &str) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|(name, _)| name == event).count()
    }

    /// Remove and return everything recorded so far
    pub fn drain(&self) -> Vec<(String, Value)> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for MemorySink {
    fn emit_value(&self, event: &str, payload: Value) {
        self.events.lock().push((event.to_string(), payload));
    }
}
