use serde::{Deserialize, Serialize};
use std::fmt;

/// Absolute stage coordinate in controller units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl Position {
    pub fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }
}

impl From<(i64, i64, i64)> for Position {
    fn from((x, y, z): (i64, i64, i64)) -> Self {
        Self::new(x, y, z)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, {}", self.x, self.y, self.z)
    }
}

/// Axis identifiers understood by the ProScan controller.
///
/// `S` addresses the XY stage as a whole and doubles as the auxiliary bit in
/// status replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StageAxis {
    X,
    Y,
    Z,
    S,
}

impl StageAxis {
    /// Axes in status-bit order.
    pub const ALL: [StageAxis; 4] = [StageAxis::X, StageAxis::Y, StageAxis::Z, StageAxis::S];

    pub fn letter(self) -> char {
        match self {
            StageAxis::X => 'X',
            StageAxis::Y => 'Y',
            StageAxis::Z => 'Z',
            StageAxis::S => 'S',
        }
    }

    pub fn status_bit(self) -> u8 {
        match self {
            StageAxis::X => 0b0001,
            StageAxis::Y => 0b0010,
            StageAxis::Z => 0b0100,
            StageAxis::S => 0b1000,
        }
    }
}

impl fmt::Display for StageAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Per-axis in-motion bitset decoded from a `$` status reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusyMask(u8);

impl BusyMask {
    pub fn from_status(status: u32) -> Self {
        Self((status & 0x0f) as u8)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, axis: StageAxis) -> bool {
        self.0 & axis.status_bit() != 0
    }

    /// Named motion axes still moving, in X, Y, Z order.
    pub fn moving_axes(self) -> Vec<StageAxis> {
        [StageAxis::X, StageAxis::Y, StageAxis::Z]
            .into_iter()
            .filter(|axis| self.contains(*axis))
            .collect()
    }
}
