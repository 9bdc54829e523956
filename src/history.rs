//! Scan history
//!
//! Append-only log of processing outcomes, capped at a fixed number of
//! entries (oldest evicted first) and persisted after every append.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use crate::rules::Directive;
use crate::storage::{keys, Persistence, PersistenceExt};

/// Default number of entries kept
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Outcome of processing one scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    /// When processing finished (RFC 3339)
    pub timestamp: String,
    /// The scan as captured, without any prefix
    pub scan: String,
    /// The string the rules were matched against (prefix applied)
    pub matched_against: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directive: Option<Directive>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_matched: Option<String>,
    #[serde(default)]
    pub fields_set: Vec<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HistoryEntry {
    fn base(scan: &str, matched_against: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            scan: scan.to_string(),
            matched_against: matched_against.to_string(),
            directive: None,
            rule_matched: None,
            fields_set: Vec::new(),
            success: true,
            error: None,
        }
    }

    /// Entry for a scan that ran through the rules without error
    pub fn processed(
        scan: &str,
        matched_against: &str,
        rule_matched: Option<String>,
        directive: Option<Directive>,
        fields_set: Vec<String>,
    ) -> Self {
        Self {
            directive,
            rule_matched,
            fields_set,
            ..Self::base(scan, matched_against)
        }
    }

    /// Entry for a scan whose processing failed
    pub fn failed(scan: &str, matched_against: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::base(scan, matched_against)
        }
    }

    /// Stamp the entry with `now_ms` (Unix milliseconds)
    pub fn at(mut self, now_ms: i64) -> Self {
        match DateTime::<Utc>::from_timestamp_millis(now_ms) {
            Some(time) => self.timestamp = time.to_rfc3339(),
            None => tracing::warn!("Clock time {}ms out of range, keeping {}", now_ms, self.timestamp),
        }
        self
    }

    /// Fields left written on the form by a failed scan
    pub fn with_fields_set(mut self, fields_set: Vec<String>) -> Self {
        self.fields_set = fields_set;
        self
    }

    pub fn matched(&self) -> bool {
        self.rule_matched.is_some()
    }
}

/// Aggregate counts over the retained entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub matched: usize,
}

/// Bounded scan log
pub struct ScanHistory {
    entries: RwLock<VecDeque<HistoryEntry>>,
    limit: usize,
    persistence: Option<Arc<dyn Persistence>>,
}

impl std::fmt::Debug for ScanHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanHistory")
            .field("entries", &self.len())
            .field("limit", &self.limit)
            .finish()
    }
}

impl Default for ScanHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl ScanHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(limit)),
            limit: limit.max(1),
            persistence: None,
        }
    }

    /// Load stored history, trimming it to `limit`
    pub fn load(persistence: Arc<dyn Persistence>, limit: usize) -> Self {
        let stored: Vec<HistoryEntry> = persistence.load(keys::HISTORY, Vec::new());
        let mut history = Self::new(limit);
        {
            let mut entries = history.entries.write();
            entries.extend(stored);
            while entries.len() > history.limit {
                entries.pop_front();
            }
        }
        history.persistence = Some(persistence);
        history
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Append an entry, evicting the oldest beyond the limit
    pub fn record(&self, entry: HistoryEntry) {
        {
            let mut entries = self.entries.write();
            entries.push_back(entry);
            while entries.len() > self.limit {
                entries.pop_front();
            }
        }
        self.persist();
    }

    /// All entries, oldest first
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.read().iter().cloned().collect()
    }

    /// The `n` most recent entries, newest first
    pub fn recent(&self, n: usize) -> Vec<HistoryEntry> {
        self.entries.read().iter().rev().take(n).cloned().collect()
    }

    pub fn latest(&self) -> Option<HistoryEntry> {
        self.entries.read().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
        self.persist();
        tracing::info!("Scan history cleared");
    }

    pub fn stats(&self) -> HistoryStats {
        let entries = self.entries.read();
        let succeeded = entries.iter().filter(|e| e.success).count();
        HistoryStats {
            total: entries.len(),
            succeeded,
            failed: entries.len() - succeeded,
            matched: entries.iter().filter(|e| e.matched()).count(),
        }
    }

    fn persist(&self) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.save(keys::HISTORY, &self.entries()) {
                tracing::error!("Failed to persist scan history: {}", e);
            }
        }
    }
}
