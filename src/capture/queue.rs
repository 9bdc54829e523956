//! Pending scan queue shared between capture and the processor

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::Notify;

/// Where a scan came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanSource {
    /// Assembled from scanner keystrokes
    Keyboard,
    /// Typed into the panel's manual entry box
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedScan {
    pub value: String,
    pub source: ScanSource,
}

/// Unbounded FIFO of raw scans
///
/// Pushing wakes the processor worker. A wakeup is stored if the worker is
/// busy, so a push made during processing is never lost.
#[derive(Debug, Default)]
pub struct ScanQueue {
    items: Mutex<VecDeque<QueuedScan>>,
    notify: Notify,
}

impl ScanQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a scan, returning the new queue length
    pub fn push(&self, value: impl Into<String>, source: ScanSource) -> usize {
        let len = {
            let mut items = self.items.lock();
            items.push_back(QueuedScan {
                value: value.into(),
                source,
            });
            items.len()
        };
        self.notify.notify_one();
        len
    }

    /// Remove the oldest scan
    pub fn pop(&self) -> Option<QueuedScan> {
        self.items.lock().pop_front()
    }

    /// Remove the oldest scan from `source`, leaving the others in order
    pub fn pop_from(&self, source: ScanSource) -> Option<QueuedScan> {
        let mut items = self.items.lock();
        let index = items.iter().position(|s| s.source == source)?;
        items.remove(index)
    }

    /// Drop every pending scan, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let dropped = items.len();
        items.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Pending scan values, oldest first
    pub fn values(&self) -> Vec<String> {
        self.items.lock().iter().map(|s| s.value.clone()).collect()
    }

    /// Wake the worker without pushing (e.g. after a mode change)
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Resolves after the next push or wake
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
