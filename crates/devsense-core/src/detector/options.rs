//! Detector configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Width thresholds (exclusive) separating device classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoints {
    /// Viewports narrower than this are mobile
    #[serde(default = "default_mobile_breakpoint")]
    pub mobile: u32,
    /// Viewports narrower than this (and not mobile) are tablets
    #[serde(default = "default_tablet_breakpoint")]
    pub tablet: u32,
}

impl Default for Breakpoints {
    fn default() -> Self {
        Self {
            mobile: default_mobile_breakpoint(),
            tablet: default_tablet_breakpoint(),
        }
    }
}

fn default_mobile_breakpoint() -> u32 {
    768
}

fn default_tablet_breakpoint() -> u32 {
    1024
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorOptions {
    /// React to host resize signals
    #[serde(default = "default_true")]
    pub enable_resize: bool,
    /// React to host orientation-change signals
    #[serde(default = "default_true")]
    pub enable_orientation: bool,
    #[serde(default)]
    pub breakpoints: Breakpoints,
    /// Quiet period after the last signal before refreshing
    #[serde(default = "default_debounce_delay_ms")]
    pub debounce_delay_ms: u64,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            enable_resize: true,
            enable_orientation: true,
            breakpoints: Breakpoints::default(),
            debounce_delay_ms: default_debounce_delay_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_debounce_delay_ms() -> u64 {
    250
}

impl DetectorOptions {
    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_delay_ms)
    }

    /// Whether any host signal is listened to
    pub fn listens(&self) -> bool {
        self.enable_resize || self.enable_orientation
    }
}
