// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

pub const DEFAULT_STEP: f64 = 0.01;
pub const DEFAULT_BORDER_WIDTH: u32 = 2;

/// A normalized corner position, `(0, 0)` being the top left of the screen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CornerPosition {
    pub x: f64,
    pub y: f64,
}

impl CornerPosition {
    pub const fn new(x: f64, y: f64) -> Self {
        CornerPosition { x, y }
    }
}

/// Persisted keystone settings.
///
/// Corners are stored in the fixed order top-left, top-right, bottom-left, bottom-right.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeystoneConfig {
    pub enabled: bool,
    pub corners: [CornerPosition; 4],
    #[serde(default = "default_true")]
    pub border_visible: bool,
    #[serde(default = "default_border_width")]
    pub border_width: u32,
    #[serde(default)]
    pub markers_visible: bool,
    #[serde(default)]
    pub active_corner: usize,
    #[serde(default = "default_step")]
    pub step: f64,
}

impl KeystoneConfig {
    pub const UNWARPED: [CornerPosition; 4] = [
        CornerPosition::new(0.0, 0.0),
        CornerPosition::new(1.0, 0.0),
        CornerPosition::new(0.0, 1.0),
        CornerPosition::new(1.0, 1.0),
    ];
}

impl Default for KeystoneConfig {
    fn default() -> Self {
        KeystoneConfig {
            enabled: false,
            corners: Self::UNWARPED,
            border_visible: true,
            border_width: DEFAULT_BORDER_WIDTH,
            markers_visible: false,
            active_corner: 0,
            step: DEFAULT_STEP,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_border_width() -> u32 {
    DEFAULT_BORDER_WIDTH
}

fn default_step() -> f64 {
    DEFAULT_STEP
}
