//! Rigid-body transforms between the LiDAR and sensor housing frames.
//!
//! The sensor calibration carries a homogeneous 4×4 `lidar_to_sensor`
//! matrix (row-major, translation in millimetres).  [`RigidTransform`]
//! wraps the rotation block and the translation column so beam directions
//! and beam-origin offsets can be moved into the sensor frame.
//!
//! # Example
//!
//! ```rust
//! use armscan_perception::transform::{RigidTransform, Vec3};
//!
//! // Pure translation of 36.18 mm along +Z.
//! let t = RigidTransform::from_row_major(&[
//!     1.0, 0.0, 0.0, 0.0,
//!     0.0, 1.0, 0.0, 0.0,
//!     0.0, 0.0, 1.0, 36.18,
//!     0.0, 0.0, 0.0, 1.0,
//! ]).unwrap();
//!
//! let p = t.apply_point(Vec3::zero());
//! assert!((p.z - 36.18).abs() < 1e-9);
//! ```

// ────────────────────────────────────────────────────────────────────────────
// Vec3
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D vector in double precision.  Lookup tables are built in `f64` and
/// narrowed to `f32` once per pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    /// Create a new vector.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// The zero vector.
    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    pub fn scale(self, k: f64) -> Self {
        Self::new(self.x * k, self.y * k, self.z * k)
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RigidTransform
// ────────────────────────────────────────────────────────────────────────────

/// Rotation followed by translation.
///
/// To express a point given in the LiDAR frame in the sensor frame, rotate
/// it by `rotation` and add `translation`.  Directions are only rotated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    /// Row-major 3×3 rotation block.
    pub rotation: [[f64; 3]; 3],
    pub translation: Vec3,
}

impl RigidTransform {
    /// The identity transform (no translation, no rotation).
    pub fn identity() -> Self {
        Self {
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            translation: Vec3::zero(),
        }
    }

    /// Parse a row-major homogeneous 4×4 matrix.
    ///
    /// Returns `None` unless exactly 16 finite values are given and the
    /// last row is `[0, 0, 0, 1]`.
    pub fn from_row_major(values: &[f64]) -> Option<Self> {
        if values.len() != 16 || values.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let bottom = &values[12..16];
        if bottom[0] != 0.0 || bottom[1] != 0.0 || bottom[2] != 0.0 || bottom[3] != 1.0 {
            return None;
        }
        let mut rotation = [[0.0; 3]; 3];
        for (r, row) in rotation.iter_mut().enumerate() {
            row.copy_from_slice(&values[r * 4..r * 4 + 3]);
        }
        Some(Self {
            rotation,
            translation: Vec3::new(values[3], values[7], values[11]),
        })
    }

    /// Rotate a direction vector.
    pub fn apply_direction(&self, v: Vec3) -> Vec3 {
        let m = &self.rotation;
        Vec3::new(
            m[0][0] * v.x + m[0][1] * v.y + m[0][2] * v.z,
            m[1][0] * v.x + m[1][1] * v.y + m[1][2] * v.z,
            m[2][0] * v.x + m[2][1] * v.y + m[2][2] * v.z,
        )
    }

    /// Rotate then translate a point.
    pub fn apply_point(&self, p: Vec3) -> Vec3 {
        self.apply_direction(p).add(self.translation)
    }
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
