//! Scanner keystroke capture
//!
//! - `mode`: the `on`/`standby`/`off` capture mode
//! - `keys`: key events, focus targets and hotkey detection
//! - `queue`: FIFO of completed scans shared with the processor
//! - `state`: the capture state machine

pub mod keys;
pub mod mode;
pub mod queue;
pub mod state;

pub use keys::{detect_hotkey, FocusTarget, HotkeyAction, KeyEvent};
pub use mode::{CaptureMode, ModeChange};
pub use queue::{QueuedScan, ScanQueue, ScanSource};
pub use state::{KeyOutcome, ScanCapture};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("Invalid capture mode '{0}' (expected on, standby or off)")]
    InvalidMode(String),
}
