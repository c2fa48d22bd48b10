//! Soft button edge detection
//!
//! The SDK reports the full set of held buttons on every change. Comparing
//! consecutive bitmasks yields discrete press/release edges.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SoftButton {
    Select,
    Up,
    Down,
}

impl SoftButton {
    /// Tracked buttons, in the order edges are reported.
    pub const ALL: [SoftButton; 3] = [SoftButton::Select, SoftButton::Up, SoftButton::Down];

    pub fn mask(&self) -> u32 {
        match self {
            Self::Select => 0x0000_0001,
            Self::Up => 0x0000_0002,
            Self::Down => 0x0000_0004,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Select => "Select",
            Self::Up => "Up",
            Self::Down => "Down",
        }
    }
}

impl fmt::Display for SoftButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ButtonEdge {
    pub button: SoftButton,
    pub pressed: bool,
}

impl ButtonEdge {
    pub fn press(button: SoftButton) -> Self {
        Self { button, pressed: true }
    }

    pub fn release(button: SoftButton) -> Self {
        Self { button, pressed: false }
    }
}

/// Edges between two bitmask snapshots, in `tracked` order. Bits outside
/// `tracked` are ignored.
pub fn detect_edges(previous: u32, current: u32, tracked: &[SoftButton]) -> Vec<ButtonEdge> {
    let changed = previous ^ current;
    tracked
        .iter()
        .filter(|button| changed & button.mask() != 0)
        .map(|&button| ButtonEdge {
            button,
            pressed: current & button.mask() != 0,
        })
        .collect()
}
