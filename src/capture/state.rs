//! Scan capture state machine
//!
//! Owns the capture mode and turns a stream of keydowns into completed
//! scans. The keystroke listener is attached only while the mode is `on`
//! and this tab holds leadership; hotkeys are recognised regardless.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use super::keys::{detect_hotkey, HotkeyAction, KeyEvent};
use super::mode::{CaptureMode, ModeChange};
use super::queue::{ScanQueue, ScanSource};
use crate::config::CaptureConfig;
use crate::events::{self, event_names, EventSink};

/// What happened to a keydown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    /// A hotkey combination; the caller decides what to do with it
    Hotkey(HotkeyAction),
    /// Listener detached (mode not `on` or not leader)
    NotListening,
    /// Focus was inside an editable element
    EditableTarget,
    /// Modified or non-printable key
    Ignored,
    /// Character appended to the buffer
    Buffered { len: usize },
    /// Enter completed a scan and it was queued
    Enqueued { scan: String, queue_len: usize },
    /// Enter on a buffer shorter than the minimum length
    Discarded { len: usize },
}

impl KeyOutcome {
    /// Whether the keydown should be kept from the host page
    pub fn prevent_default(&self) -> bool {
        match self {
            KeyOutcome::Hotkey(action) => action.consumes_event(),
            KeyOutcome::Buffered { .. } | KeyOutcome::Enqueued { .. } => true,
            _ => false,
        }
    }
}

pub struct ScanCapture {
    mode: watch::Sender<CaptureMode>,
    is_leader: bool,
    listening: bool,
    buffer: String,
    last_key_at: Option<Instant>,
    idle_timeout: Duration,
    min_scan_length: usize,
    clear_queue_on_off: bool,
    queue: Arc<ScanQueue>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ScanCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanCapture")
            .field("mode", &self.mode())
            .field("is_leader", &self.is_leader)
            .field("listening", &self.listening)
            .field("buffer_len", &self.buffer.len())
            .finish()
    }
}

impl ScanCapture {
    /// Create a capture in `config.initial_mode`. Not leader until told.
    pub fn new(config: &CaptureConfig, queue: Arc<ScanQueue>, events: Arc<dyn EventSink>) -> Self {
        let (mode, _) = watch::channel(config.initial_mode);
        Self {
            mode,
            is_leader: false,
            listening: false,
            buffer: String::new(),
            last_key_at: None,
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            min_scan_length: config.min_scan_length,
            clear_queue_on_off: config.clear_queue_on_off,
            queue,
            events,
        }
    }

    pub fn mode(&self) -> CaptureMode {
        *self.mode.borrow()
    }

    /// Receiver that observes every mode change
    pub fn subscribe_mode(&self) -> watch::Receiver<CaptureMode> {
        self.mode.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Current partial scan
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn queue(&self) -> &Arc<ScanQueue> {
        &self.queue
    }

    /// Switch mode. Returns `None` when already in `mode`.
    pub fn set_mode(&mut self, mode: CaptureMode) -> Option<ModeChange> {
        let previous = self.mode();
        if previous == mode {
            return None;
        }

        self.mode.send_replace(mode);
        match mode {
            CaptureMode::Off => {
                self.reset_buffer();
                if self.clear_queue_on_off {
                    let dropped = self.queue.clear();
                    if dropped > 0 {
                        tracing::info!("Cleared {} pending scan(s)", dropped);
                    }
                }
            }
            CaptureMode::Standby => self.reset_buffer(),
            CaptureMode::On => self.queue.wake(),
        }
        self.refresh_listener();

        tracing::info!("Capture mode: {} -> {}", previous, mode);
        let change = ModeChange { mode, previous };
        events::emit(self.events.as_ref(), event_names::MODE_CHANGED, &change);
        Some(change)
    }

    /// Record whether this tab currently holds leadership
    pub fn set_leader(&mut self, is_leader: bool) {
        if self.is_leader != is_leader {
            self.is_leader = is_leader;
            self.refresh_listener();
        }
    }

    /// Feed one keydown through the machine
    pub fn handle_key(&mut self, event: &KeyEvent, now: Instant) -> KeyOutcome {
        if let Some(action) = detect_hotkey(event) {
            tracing::debug!("Hotkey detected: {:?}", action);
            return KeyOutcome::Hotkey(action);
        }

        if !self.listening {
            return KeyOutcome::NotListening;
        }
        if event.target.is_editable() {
            return KeyOutcome::EditableTarget;
        }

        self.tick(now);

        if event.is_enter() {
            let len = self.buffer.chars().count();
            let scan = std::mem::take(&mut self.buffer);
            self.last_key_at = None;
            if len < self.min_scan_length {
                if len > 0 {
                    tracing::debug!("Discarded {}-character input (minimum {})", len, self.min_scan_length);
                }
                return KeyOutcome::Discarded { len };
            }
            let queue_len = self.queue.push(scan.clone(), ScanSource::Keyboard);
            tracing::info!("Scan captured ({} chars), queue length {}", len, queue_len);
            events::emit(
                self.events.as_ref(),
                event_names::SCAN_CAPTURED,
                &serde_json::json!({ "scan": scan, "queueLength": queue_len }),
            );
            return KeyOutcome::Enqueued { scan, queue_len };
        }

        match event.printable_char() {
            Some(c) => {
                self.buffer.push(c);
                self.last_key_at = Some(now);
                KeyOutcome::Buffered {
                    len: self.buffer.chars().count(),
                }
            }
            None => KeyOutcome::Ignored,
        }
    }

    /// Expire a partial scan whose last key is older than the idle timeout.
    /// Returns true if a buffer was discarded.
    pub fn tick(&mut self, now: Instant) -> bool {
        let Some(last) = self.last_key_at else {
            return false;
        };
        if now.saturating_duration_since(last) <= self.idle_timeout {
            return false;
        }
        tracing::debug!("Idle timeout, discarding partial input of {} chars", self.buffer.len());
        self.reset_buffer();
        true
    }

    /// Instant at which the current partial scan expires
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.last_key_at.map(|last| last + self.idle_timeout)
    }

    fn reset_buffer(&mut self) {
        self.buffer.clear();
        self.last_key_at = None;
    }

    fn refresh_listener(&mut self) {
        let should_listen = self.mode() == CaptureMode::On && self.is_leader;
        if should_listen == self.listening {
            return;
        }
        self.listening = should_listen;
        if should_listen {
            tracing::info!("Keystroke listener attached");
        } else {
            self.reset_buffer();
            tracing::info!("Keystroke listener detached");
        }
    }
}
