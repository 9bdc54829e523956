//! Scanfill: barcode-scanner driven form autofill
//!
//! A hardware scanner types into the page like a keyboard. Scanfill picks
//! those keystrokes out of normal typing, runs each completed scan through
//! an ordered list of pattern rules and writes the resulting values into
//! form fields. When several tabs are open, a lease-based election makes
//! sure only one of them listens to the scanner.
//!
//! The host page is reached only through traits: [`fields::FieldRegistry`]
//! for form values, [`storage::Persistence`] for settings,
//! [`storage::SharedStore`] for cross-tab state and [`events::EventSink`]
//! for notifications. [`runtime::ScanRuntime`] wires everything together.

pub mod capture;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod fields;
pub mod history;
pub mod logging;
pub mod macros;
pub mod pattern;
pub mod prefix;
pub mod queue;
pub mod rules;
pub mod runtime;
pub mod storage;

pub use capture::{CaptureMode, KeyEvent, KeyOutcome};
pub use config::Config;
pub use rules::{Action, Directive, Rule, RuleEngine};
pub use runtime::{Collaborators, ScanRuntime};
