//! Key events and hotkeys
//!
//! Key events arrive in the shape of a host-page `keydown`: the logical
//! `key`, the physical `code`, modifier flags and where focus was.

use serde::{Deserialize, Serialize};

use super::CaptureMode;

/// Element that had focus when the key was pressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusTarget {
    /// Page body or a non-editable element
    #[default]
    Document,
    TextInput,
    TextArea,
    ContentEditable,
}

impl FocusTarget {
    /// The user is typing into a form control
    pub fn is_editable(&self) -> bool {
        !matches!(self, FocusTarget::Document)
    }
}

/// A single keydown
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyEvent {
    pub key: String,
    pub code: String,
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub meta: bool,
    pub target: FocusTarget,
}

impl KeyEvent {
    /// Unmodified key on the document
    pub fn key(key: &str) -> Self {
        Self {
            key: key.to_string(),
            code: code_for_key(key),
            ..Self::default()
        }
    }

    pub fn enter() -> Self {
        Self::key("Enter")
    }

    /// Alt+Shift+`letter`
    pub fn alt_shift(letter: char) -> Self {
        Self {
            alt: true,
            shift: true,
            ..Self::key(&letter.to_ascii_uppercase().to_string())
        }
    }

    /// Ctrl+Shift+`letter`
    pub fn ctrl_shift(letter: char) -> Self {
        Self {
            ctrl: true,
            shift: true,
            ..Self::key(&letter.to_ascii_uppercase().to_string())
        }
    }

    pub fn in_target(mut self, target: FocusTarget) -> Self {
        self.target = target;
        self
    }

    pub fn is_enter(&self) -> bool {
        self.key == "Enter" || self.code == "Enter" || self.code == "NumpadEnter"
    }

    /// The character this key types, if it is a plain printable key.
    /// Shift is allowed (upper case, symbols); Ctrl/Alt/Meta are not.
    pub fn printable_char(&self) -> Option<char> {
        if self.ctrl || self.alt || self.meta {
            return None;
        }
        let mut chars = self.key.chars();
        let c = chars.next()?;
        if chars.next().is_some() || c.is_control() {
            return None;
        }
        Some(c)
    }

    /// Letter named by the event, from `code` first (`KeyO`) then `key`
    fn letter(&self) -> Option<char> {
        if let Some(letter) = self.code.strip_prefix("Key") {
            let mut chars = letter.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                return Some(c.to_ascii_uppercase());
            }
        }
        let mut chars = self.key.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_alphabetic() => Some(c.to_ascii_uppercase()),
            _ => None,
        }
    }
}

/// Build the `code` a plain key would produce
fn code_for_key(key: &str) -> String {
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => format!("Key{}", c.to_ascii_uppercase()),
        (Some(c), None) if c.is_ascii_digit() => format!("Digit{}", c),
        (Some(' '), None) => "Space".to_string(),
        (Some('/'), None) => "Slash".to_string(),
        (Some('-'), None) => "Minus".to_string(),
        _ => key.to_string(),
    }
}

/// Action bound to a hotkey
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "mode")]
pub enum HotkeyAction {
    /// Alt+Shift+O / S / X
    SetMode(CaptureMode),
    /// Ctrl+Shift+B: handled by the panel, must reach the page
    TogglePanel,
}

impl HotkeyAction {
    /// Whether the capture layer swallows the keystroke
    pub fn consumes_event(&self) -> bool {
        matches!(self, HotkeyAction::SetMode(_))
    }
}

/// Recognise a hotkey combination
pub fn detect_hotkey(event: &KeyEvent) -> Option<HotkeyAction> {
    if event.meta {
        return None;
    }
    let letter = event.letter()?;

    if event.alt && event.shift && !event.ctrl {
        return match letter {
            'O' => Some(HotkeyAction::SetMode(CaptureMode::On)),
            'S' => Some(HotkeyAction::SetMode(CaptureMode::Standby)),
            'X' => Some(HotkeyAction::SetMode(CaptureMode::Off)),
            _ => None,
        };
    }

    if event.ctrl && event.shift && !event.alt && letter == 'B' {
        return Some(HotkeyAction::TogglePanel);
    }

    None
}
