//! Math types.
//!
//! The client treats placement transforms as opaque payload for the
//! presentation engine, so this module intentionally stays small.

use serde::{Deserialize, Serialize};

/// 4x4 affine placement transform, row-major.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mat4 {
    pub m: [[f32; 4]; 4],
}

impl Mat4 {
    pub const IDENTITY: Self = Self {
        m: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };

    pub const fn new(m: [[f32; 4]; 4]) -> Self {
        Self { m }
    }

    /// Translation column, useful for logging entity placements.
    pub fn translation(&self) -> [f32; 3] {
        [self.m[0][3], self.m[1][3], self.m[2][3]]
    }
}

impl Default for Mat4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}
