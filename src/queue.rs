//! Scan queue processor
//!
//! Drains the [`ScanQueue`] one scan at a time:
//! 1. Acquire the single-flight lock (no-op if held, paused or empty)
//! 2. Dequeue the oldest scan
//! 3. Apply the active prefix
//! 4. Snapshot field values
//! 5. Run the rule engine
//! 6. Write back only the fields whose value changed
//! 7. Record the outcome in history
//! 8. Release the lock; throttle and continue while work remains
//!
//! A failure in steps 3-7 becomes a failed history entry and never stops
//! the loop. Fields written before a failed write are restored to their
//! snapshot values.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::capture::{CaptureMode, ScanQueue, ScanSource};
use crate::clock::Clock;
use crate::coordinator::Broadcaster;
use crate::events::{self, event_names, EventSink, ToastLevel};
use crate::fields::{FieldError, FieldRegistry, WriteOptions};
use crate::history::{HistoryEntry, ScanHistory};
use crate::prefix::PrefixStore;
use crate::rules::RuleEngine;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("Scan is empty")]
    EmptyScan,

    #[error("Scanner is off; manual scans are disabled")]
    ManualScanRejected,

    #[error(transparent)]
    Field(#[from] FieldError),
}

/// Result of one [`ScanQueueProcessor::process_next`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// A scan was processed (successfully or not) and recorded
    Processed(HistoryEntry),
    /// Another call holds the lock
    Locked,
    /// Mode is not `on` and only keyboard scans are queued
    Paused,
    /// Nothing queued
    Empty,
}

pub struct ScanQueueProcessor {
    queue: Arc<ScanQueue>,
    engine: Arc<RuleEngine>,
    fields: Arc<dyn FieldRegistry>,
    prefixes: Arc<PrefixStore>,
    history: Arc<ScanHistory>,
    events: Arc<dyn EventSink>,
    broadcaster: Option<Arc<Broadcaster>>,
    mode: watch::Receiver<CaptureMode>,
    clock: Arc<dyn Clock>,
    locked: AtomicBool,
    throttle: Duration,
    allow_manual_in_off: bool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ScanQueueProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanQueueProcessor")
            .field("queued", &self.queue.len())
            .field("locked", &self.is_locked())
            .field("throttle", &self.throttle)
            .finish()
    }
}

struct PipelineFailure {
    matched_against: String,
    error: ScanError,
    /// Fields still holding this scan's values after the rollback
    left_written: Vec<String>,
}

/// Clears the single-flight flag however processing exits
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Collaborators of a [`ScanQueueProcessor`]
pub struct ProcessorParts {
    pub queue: Arc<ScanQueue>,
    pub engine: Arc<RuleEngine>,
    pub fields: Arc<dyn FieldRegistry>,
    pub prefixes: Arc<PrefixStore>,
    pub history: Arc<ScanHistory>,
    pub events: Arc<dyn EventSink>,
    pub broadcaster: Option<Arc<Broadcaster>>,
    pub mode: watch::Receiver<CaptureMode>,
    /// Stamps history entries
    pub clock: Arc<dyn Clock>,
}

impl ScanQueueProcessor {
    pub fn new(parts: ProcessorParts, throttle: Duration, allow_manual_in_off: bool) -> Self {
        Self {
            queue: parts.queue,
            engine: parts.engine,
            fields: parts.fields,
            prefixes: parts.prefixes,
            history: parts.history,
            events: parts.events,
            broadcaster: parts.broadcaster,
            mode: parts.mode,
            clock: parts.clock,
            locked: AtomicBool::new(false),
            throttle,
            allow_manual_in_off,
            worker: Mutex::new(None),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    fn mode(&self) -> CaptureMode {
        *self.mode.borrow()
    }

    /// Queue a manually typed scan. Rejected with a toast when the scanner
    /// is off and manual scans are not allowed then.
    pub fn submit_manual(&self, scan: &str) -> Result<usize, ScanError> {
        let scan = scan.trim();
        if scan.is_empty() {
            return Err(ScanError::EmptyScan);
        }
        if self.mode() == CaptureMode::Off && !self.allow_manual_in_off {
            tracing::warn!("Manual scan rejected: scanner is off");
            events::toast(
                self.events.as_ref(),
                ToastLevel::Error,
                "Scanner is off. Turn it on to submit manual scans.",
            );
            return Err(ScanError::ManualScanRejected);
        }
        let len = self.queue.push(scan, ScanSource::Manual);
        tracing::info!("Manual scan queued, queue length {}", len);
        Ok(len)
    }

    /// Process at most one queued scan
    pub fn process_next(&self) -> Step {
        if self.locked.swap(true, Ordering::SeqCst) {
            tracing::debug!("Processor busy, skipping");
            return Step::Locked;
        }
        let _guard = ProcessingGuard(&self.locked);

        // Outside `on`, keyboard scans wait while manual ones go ahead of them
        let item = if self.mode() == CaptureMode::On {
            self.queue.pop()
        } else {
            self.queue.pop_from(ScanSource::Manual)
        };
        let Some(item) = item else {
            return if self.queue.is_empty() {
                Step::Empty
            } else {
                Step::Paused
            };
        };

        let entry = match self.run_pipeline(&item.value) {
            Ok(entry) => entry,
            Err(failure) => {
                tracing::error!("Processing '{}' failed: {}", item.value, failure.error);
                events::toast(
                    self.events.as_ref(),
                    ToastLevel::Error,
                    &format!("Scan {} failed: {}", item.value, failure.error),
                );
                HistoryEntry::failed(&item.value, &failure.matched_against, failure.error.to_string())
                    .with_fields_set(failure.left_written)
            }
        }
        .at(self.clock.now_ms());

        self.history.record(entry.clone());
        events::emit(self.events.as_ref(), event_names::SCAN_PROCESSED, &entry);
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.notify_peers(event_names::SCAN_PROCESSED, &entry);
        }
        Step::Processed(entry)
    }

    /// Steps 3 to 6. A failed write rolls back the writes made before it.
    fn run_pipeline(&self, scan: &str) -> Result<HistoryEntry, PipelineFailure> {
        let matched_against = self.prefixes.apply(scan);
        let snapshot = self.fields.snapshot();
        let outcome = self.engine.process(&matched_against, &snapshot);

        let mut fields_set = Vec::with_capacity(outcome.changed.len());
        for key in &outcome.changed {
            let value = outcome.fields.get(key).map(String::as_str).unwrap_or_default();
            match self.fields.write(key, value, WriteOptions::default()) {
                Ok(true) => fields_set.push(key.clone()),
                Ok(false) => {}
                Err(e) => {
                    let left_written = self.roll_back(fields_set, &snapshot);
                    return Err(PipelineFailure {
                        matched_against,
                        error: e.into(),
                        left_written,
                    });
                }
            }
        }

        match &outcome.rule {
            Some(rule) => tracing::info!(
                "Scan '{}' matched '{}', {} field(s) written",
                matched_against,
                rule.rule_name,
                fields_set.len()
            ),
            None => tracing::info!("Scan '{}' matched no rule", matched_against),
        }

        Ok(HistoryEntry::processed(
            scan,
            &matched_against,
            outcome.rule.map(|r| r.rule_name),
            outcome.directive,
            fields_set,
        ))
    }

    /// Restore `written` fields to their snapshot values, newest first.
    /// Returns the fields that could not be restored.
    fn roll_back(&self, written: Vec<String>, snapshot: &HashMap<String, String>) -> Vec<String> {
        let mut left_written = Vec::new();
        for key in written.into_iter().rev() {
            let previous = snapshot.get(&key).map(String::as_str).unwrap_or_default();
            match self.fields.write(&key, previous, WriteOptions::default()) {
                Ok(_) => tracing::debug!("Rolled back field '{}'", key),
                Err(e) => {
                    tracing::error!("Failed to roll back field '{}': {}", key, e);
                    left_written.push(key);
                }
            }
        }
        left_written.reverse();
        left_written
    }

    /// Drain the queue, yielding `throttle` between scans. Returns how many
    /// scans this call processed.
    pub async fn process_queue(&self) -> usize {
        let mut processed = 0;
        loop {
            match self.process_next() {
                Step::Processed(_) => processed += 1,
                Step::Locked | Step::Paused | Step::Empty => break,
            }
            if self.queue.is_empty() {
                break;
            }
            tokio::time::sleep(self.throttle).await;
        }
        processed
    }

    /// Run the drain loop in the background, woken by pushes and mode changes
    pub fn spawn_worker(self: &Arc<Self>) {
        let processor = Arc::clone(self);
        let mut mode = self.mode.clone();
        let handle = tokio::spawn(async move {
            loop {
                processor.process_queue().await;
                tokio::select! {
                    _ = processor.queue.notified() => {}
                    changed = mode.changed() => {
                        if changed.is_err() {
                            tracing::debug!("Capture mode channel closed, worker exiting");
                            break;
                        }
                    }
                }
            }
        });
        if let Some(previous) = self.worker.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::MemorySink;
    use crate::fields::{FieldCatalog, FieldDescriptor, FieldRole, MemoryFieldRegistry};
    use crate::pattern::PatternType;
    use crate::prefix::Prefix;
    use crate::rules::{Action, Directive, MatchMode, Rule};
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        processor: Arc<ScanQueueProcessor>,
        queue: Arc<ScanQueue>,
        fields: Arc<MemoryFieldRegistry>,
        prefixes: Arc<PrefixStore>,
        history: Arc<ScanHistory>,
        sink: Arc<MemorySink>,
        mode: watch::Sender<CaptureMode>,
        clock: Arc<ManualClock>,
    }

    fn directive_rule() -> Rule {
        Rule::new("r1", "Asset", PatternType::Regex, r"^([/*])(\d{5})$")
            .with_directive_group(1)
            .with_action(Action::set("asset_tag", "${2}"))
            .with_action(Action::set("type", "${directive}"))
    }

    fn harness_with(registry: Arc<dyn FieldRegistry>, fields: Arc<MemoryFieldRegistry>, rules: Vec<Rule>) -> Harness {
        let queue = Arc::new(ScanQueue::new());
        let engine = Arc::new(RuleEngine::new(MatchMode::FirstMatch));
        engine.set_rules(rules).unwrap();
        let prefixes = Arc::new(PrefixStore::new());
        let history = Arc::new(ScanHistory::default());
        let sink = Arc::new(MemorySink::new());
        let (mode, mode_rx) = watch::channel(CaptureMode::On);
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let processor = Arc::new(ScanQueueProcessor::new(
            ProcessorParts {
                queue: queue.clone(),
                engine,
                fields: registry,
                prefixes: prefixes.clone(),
                history: history.clone(),
                events: sink.clone(),
                broadcaster: None,
                mode: mode_rx,
                clock: clock.clone(),
            },
            Duration::from_millis(100),
            false,
        ));
        Harness {
            processor,
            queue,
            fields,
            prefixes,
            history,
            sink,
            mode,
            clock,
        }
    }

    fn harness(rules: Vec<Rule>) -> Harness {
        let fields = Arc::new(MemoryFieldRegistry::new(FieldCatalog::with_defaults()));
        harness_with(fields.clone(), fields.clone(), rules)
    }

    // ========================================
    // Single item
    // ========================================

    #[test]
    fn test_process_next_records_history() {
        let h = harness(vec![directive_rule()]);
        h.queue.push("/01234", ScanSource::Keyboard);

        let Step::Processed(entry) = h.processor.process_next() else {
            panic!("expected a processed scan");
        };
        assert!(entry.success);
        assert_eq!(entry.directive, Some(Directive::Return));
        assert_eq!(entry.rule_matched.as_deref(), Some("Asset"));
        assert_eq!(entry.fields_set, vec!["asset_tag".to_string(), "type".to_string()]);
        assert_eq!(h.fields.read("asset_tag"), "01234");
        assert_eq!(h.fields.read("type"), "Return");
        assert_eq!(h.history.len(), 1);
        assert_eq!(h.sink.count(event_names::SCAN_PROCESSED), 1);
        assert!(!h.processor.is_locked());
    }

    #[test]
    fn test_unmatched_scan_is_recorded() {
        let h = harness(vec![directive_rule()]);
        h.queue.push("hello", ScanSource::Keyboard);
        let Step::Processed(entry) = h.processor.process_next() else {
            panic!("expected a processed scan");
        };
        assert!(entry.success);
        assert!(!entry.matched());
        assert!(entry.fields_set.is_empty());
        assert_eq!(h.fields.write_count(), 0);
    }

    #[test]
    fn test_gates() {
        let h = harness(vec![]);
        assert_eq!(h.processor.process_next(), Step::Empty);

        h.queue.push("/01234", ScanSource::Keyboard);
        h.mode.send_replace(CaptureMode::Standby);
        assert_eq!(h.processor.process_next(), Step::Paused);
        assert_eq!(h.queue.len(), 1);

        h.processor.locked.store(true, Ordering::SeqCst);
        h.mode.send_replace(CaptureMode::On);
        assert_eq!(h.processor.process_next(), Step::Locked);
        // A refused acquire must not clear someone else's lock
        assert!(h.processor.is_locked());
    }

    #[test]
    fn test_write_if_changed() {
        let h = harness(vec![directive_rule()]);
        h.queue.push("/01234", ScanSource::Keyboard);
        h.queue.push("/01234", ScanSource::Keyboard);
        h.processor.process_next();
        let before = h.fields.snapshot();
        h.processor.process_next();

        assert_eq!(h.fields.snapshot(), before);
        // Second scan produced identical values: no further writes
        assert_eq!(h.fields.write_count(), 2);
        assert!(h.history.latest().unwrap().fields_set.is_empty());
    }

    #[test]
    fn test_prefix_applied_but_canonical_scan_recorded() {
        let rule = Rule::new("r1", "Dept deploy", PatternType::Regex, r"^DEPT-([/*])(\d{5})$")
            .with_directive_group(1)
            .with_action(Action::set("type", "${directive}"));
        let h = harness(vec![rule]);
        let mut prefix = Prefix::new("dept", "Department", "DEPT-");
        prefix.active = true;
        h.prefixes.add(prefix).unwrap();

        h.queue.push("*99999", ScanSource::Keyboard);
        h.processor.process_next();

        let entry = h.history.latest().unwrap();
        assert_eq!(entry.scan, "*99999");
        assert_eq!(entry.matched_against, "DEPT-*99999");
        assert_eq!(h.fields.read("type"), "Deployment");
    }

    #[test]
    fn test_write_failure_becomes_failed_entry() {
        let h = harness(vec![directive_rule()]);
        h.fields.fail_writes_to("type");
        h.queue.push("/01234", ScanSource::Keyboard);
        h.queue.push("/55555", ScanSource::Keyboard);

        let Step::Processed(entry) = h.processor.process_next() else {
            panic!("expected a processed scan");
        };
        assert!(!entry.success);
        assert!(entry.error.unwrap().contains("type"));
        assert!(!h.processor.is_locked());
        assert_eq!(h.sink.count(event_names::TOAST), 1);

        // asset_tag was written before the failing write and is restored
        assert_eq!(h.fields.read("asset_tag"), "");
        assert!(entry.fields_set.is_empty());
        assert_eq!(
            h.fields.writes(),
            vec![
                ("asset_tag".to_string(), "01234".to_string()),
                ("asset_tag".to_string(), String::new()),
            ]
        );

        // Queue keeps draining
        assert!(matches!(h.processor.process_next(), Step::Processed(_)));
        assert_eq!(h.history.len(), 2);
    }

    #[test]
    fn test_failed_rollback_is_reported_in_fields_set() {
        let rule = Rule::new("r1", "Asset", PatternType::Regex, r"^([/*])(\d{5})$")
            .with_action(Action::set("asset_tag", "${2}"))
            .with_action(Action::set("comments", "scanned ${scan}"))
            .with_action(Action::set("type", "x"));
        let fields = Arc::new(MemoryFieldRegistry::new(FieldCatalog::with_defaults()));
        let registry = Arc::new(FailAfterRegistry {
            inner: fields.clone(),
            writes_allowed: AtomicUsize::new(2),
        });
        let h = harness_with(registry, fields, vec![rule]);
        h.queue.push("/01234", ScanSource::Keyboard);

        let Step::Processed(entry) = h.processor.process_next() else {
            panic!("expected a processed scan");
        };
        // Both rollbacks fail, so both written fields stay on the form
        assert!(!entry.success);
        assert_eq!(entry.fields_set, vec!["asset_tag".to_string(), "comments".to_string()]);
        assert_eq!(h.fields.read("asset_tag"), "01234");
        assert_eq!(h.history.latest().unwrap().fields_set, entry.fields_set);
    }

    /// Accepts the first `writes_allowed` writes, then fails every write
    struct FailAfterRegistry {
        inner: Arc<MemoryFieldRegistry>,
        writes_allowed: AtomicUsize,
    }

    impl FieldRegistry for FailAfterRegistry {
        fn read(&self, key: &str) -> String {
            self.inner.read(key)
        }

        fn write(&self, key: &str, value: &str, opts: WriteOptions) -> Result<bool, FieldError> {
            let allowed = self
                .writes_allowed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !allowed {
                return Err(FieldError::WriteFailed {
                    key: key.to_string(),
                    reason: "form detached".to_string(),
                });
            }
            self.inner.write(key, value, opts)
        }

        fn exists(&self, key: &str) -> bool {
            self.inner.exists(key)
        }

        fn for_role(&self, role: FieldRole) -> Vec<FieldDescriptor> {
            self.inner.for_role(role)
        }

        fn keys(&self) -> Vec<String> {
            self.inner.keys()
        }
    }

    #[test]
    fn test_entries_are_stamped_by_the_injected_clock() {
        let h = harness(vec![directive_rule()]);
        h.fields.fail_writes_to("type");
        h.queue.push("/01234", ScanSource::Keyboard);
        h.queue.push("*99999", ScanSource::Keyboard);

        h.processor.process_next();
        h.clock.advance(60_000);
        h.processor.process_next();

        let entries = h.history.entries();
        assert_eq!(entries[0].timestamp, "2023-11-14T22:13:20+00:00");
        assert_eq!(entries[1].timestamp, "2023-11-14T22:14:20+00:00");
    }

    // ========================================
    // Manual scans
    // ========================================

    #[test]
    fn test_manual_scan_rejected_when_off() {
        let h = harness(vec![]);
        h.mode.send_replace(CaptureMode::Off);
        assert_eq!(h.processor.submit_manual("/01234"), Err(ScanError::ManualScanRejected));
        assert!(h.queue.is_empty());
        let toasts = h.sink.payloads(event_names::TOAST);
        assert_eq!(toasts[0]["level"], "error");
    }

    #[test]
    fn test_manual_scan_allowed_when_off_if_configured() {
        let h = harness(vec![directive_rule()]);
        let processor = ScanQueueProcessor::new(
            ProcessorParts {
                queue: h.queue.clone(),
                engine: Arc::new(RuleEngine::default()),
                fields: h.fields.clone(),
                prefixes: h.prefixes.clone(),
                history: h.history.clone(),
                events: h.sink.clone(),
                broadcaster: None,
                mode: h.mode.subscribe(),
                clock: h.clock.clone(),
            },
            Duration::from_millis(100),
            true,
        );
        h.mode.send_replace(CaptureMode::Off);
        assert_eq!(processor.submit_manual("  /01234 "), Ok(1));
        assert_eq!(h.queue.values(), vec!["/01234".to_string()]);
        // Manual scans are processed even though the scanner is off
        assert!(matches!(processor.process_next(), Step::Processed(_)));
    }

    #[test]
    fn test_manual_scan_in_standby_is_processed() {
        let h = harness(vec![directive_rule()]);
        h.mode.send_replace(CaptureMode::Standby);
        h.processor.submit_manual("/01234").unwrap();
        assert!(matches!(h.processor.process_next(), Step::Processed(_)));
        assert_eq!(h.fields.read("type"), "Return");
    }

    #[test]
    fn test_manual_scan_overtakes_held_keyboard_scans() {
        let h = harness(vec![directive_rule()]);
        h.mode.send_replace(CaptureMode::Standby);
        h.queue.push("/11111", ScanSource::Keyboard);
        h.processor.submit_manual("/22222").unwrap();

        let Step::Processed(entry) = h.processor.process_next() else {
            panic!("expected the manual scan to be processed");
        };
        assert_eq!(entry.scan, "/22222");
        assert_eq!(h.processor.process_next(), Step::Paused);
        assert_eq!(h.queue.values(), vec!["/11111".to_string()]);

        h.mode.send_replace(CaptureMode::On);
        assert!(matches!(h.processor.process_next(), Step::Processed(e) if e.scan == "/11111"));
    }

    #[test]
    fn test_empty_manual_scan() {
        let h = harness(vec![]);
        assert_eq!(h.processor.submit_manual("   "), Err(ScanError::EmptyScan));
    }

    // ========================================
    // Draining
    // ========================================

    #[tokio::test(start_paused = true)]
    async fn test_process_queue_drains_in_fifo_order() {
        let h = harness(vec![directive_rule()]);
        for scan in ["/00001", "*00002", "/00003"] {
            h.queue.push(scan, ScanSource::Keyboard);
        }
        let start = tokio::time::Instant::now();
        assert_eq!(h.processor.process_queue().await, 3);

        let scans: Vec<_> = h.history.entries().into_iter().map(|e| e.scan).collect();
        assert_eq!(scans, vec!["/00001", "*00002", "/00003"]);
        // Two throttle pauses between three scans
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_processes_pushed_scans() {
        let h = harness(vec![directive_rule()]);
        h.processor.spawn_worker();
        h.queue.push("/01234", ScanSource::Keyboard);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.history.len(), 1);

        // Paused mode holds scans until capture resumes
        h.mode.send_replace(CaptureMode::Standby);
        h.queue.push("/55555", ScanSource::Keyboard);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.history.len(), 1);

        h.mode.send_replace(CaptureMode::On);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.history.len(), 2);
        h.processor.shutdown();
    }

    /// Registry that counts overlapping snapshots
    struct CountingRegistry {
        inner: Arc<MemoryFieldRegistry>,
        in_flight: AtomicUsize,
        violations: AtomicUsize,
    }

    impl FieldRegistry for CountingRegistry {
        fn read(&self, key: &str) -> String {
            self.inner.read(key)
        }

        fn write(&self, key: &str, value: &str, opts: WriteOptions) -> Result<bool, FieldError> {
            self.inner.write(key, value, opts)
        }

        fn exists(&self, key: &str) -> bool {
            self.inner.exists(key)
        }

        fn for_role(&self, role: FieldRole) -> Vec<FieldDescriptor> {
            self.inner.for_role(role)
        }

        fn keys(&self) -> Vec<String> {
            self.inner.keys()
        }

        fn snapshot(&self) -> HashMap<String, String> {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(1));
            let snapshot = self
                .inner
                .keys()
                .into_iter()
                .map(|k| {
                    let v = self.inner.read(&k);
                    (k, v)
                })
                .collect();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            snapshot
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_drains_never_overlap() {
        let inner = Arc::new(MemoryFieldRegistry::new(FieldCatalog::with_defaults()));
        let counting = Arc::new(CountingRegistry {
            inner: inner.clone(),
            in_flight: AtomicUsize::new(0),
            violations: AtomicUsize::new(0),
        });
        let h = harness_with(counting.clone(), inner, vec![directive_rule()]);
        let processor = Arc::new(ScanQueueProcessor::new(
            ProcessorParts {
                queue: h.queue.clone(),
                engine: Arc::new(RuleEngine::default()),
                fields: counting.clone(),
                prefixes: h.prefixes.clone(),
                history: h.history.clone(),
                events: h.sink.clone(),
                broadcaster: None,
                mode: h.mode.subscribe(),
                clock: h.clock.clone(),
            },
            Duration::from_millis(1),
            false,
        ));

        const N: usize = 20;
        let mut tasks = Vec::new();
        for i in 0..N {
            h.queue.push(format!("scan-{:02}", i), ScanSource::Keyboard);
            let p = processor.clone();
            tasks.push(tokio::spawn(async move { p.process_queue().await }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        // Anything left behind by a racing early exit
        while processor.process_queue().await > 0 {}

        assert_eq!(counting.violations.load(Ordering::SeqCst), 0);
        let scans: Vec<_> = h.history.entries().into_iter().map(|e| e.scan).collect();
        let expected: Vec<_> = (0..N).map(|i| format!("scan-{:02}", i)).collect();
        assert_eq!(scans, expected);
    }
}
