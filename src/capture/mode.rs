//! Capture mode

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::CaptureError;

/// Whether scanner keystrokes are being captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Capturing and processing scans
    On,
    /// Paused: no capture, queued scans are kept
    #[default]
    Standby,
    /// Stopped: no capture, queue optionally cleared
    Off,
}

impl CaptureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMode::On => "on",
            CaptureMode::Standby => "standby",
            CaptureMode::Off => "off",
        }
    }

    /// Returns a human-readable description of the mode
    pub fn description(&self) -> &'static str {
        match self {
            CaptureMode::On => "Scanner active",
            CaptureMode::Standby => "Scanner paused",
            CaptureMode::Off => "Scanner off",
        }
    }
}

impl std::fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptureMode {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(CaptureMode::On),
            "standby" => Ok(CaptureMode::Standby),
            "off" => Ok(CaptureMode::Off),
            _ => Err(CaptureError::InvalidMode(s.to_string())),
        }
    }
}

/// Payload of the `mode-changed` notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeChange {
    pub mode: CaptureMode,
    pub previous: CaptureMode,
}
