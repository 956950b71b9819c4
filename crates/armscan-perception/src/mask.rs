//! Arm region-of-interest masks.
//!
//! The upper arm and forearm are approximated as two constant-radius
//! cylinders in pixel space: shoulder→elbow and elbow→wrist.  Each segment
//! is clipped to the image, walked in steps of at most one pixel, and a
//! filled disk is stamped at every sample.  The mask is binary, so stamping the same pixel twice is
//! harmless and rasterisation is idempotent.

use armscan_types::{ArmScanError, Grid, KeypointIndex, Keypoint, Pose, Shape};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Confidence a landmark must strictly exceed to be used.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

/// Disk radius stamped along each arm segment (pixels).
pub const DEFAULT_MASK_RADIUS: u32 = 1;

/// Largest disk radius honoured; larger values are clamped.
pub const MAX_MASK_RADIUS: u32 = 1024;

/// Schema positions of the three tracked landmarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmIndices {
    pub shoulder: usize,
    pub elbow: usize,
    pub wrist: usize,
}

impl ArmIndices {
    /// COCO left arm (5, 7, 9).
    pub fn left() -> Self {
        Self {
            shoulder: KeypointIndex::LeftShoulder.into(),
            elbow: KeypointIndex::LeftElbow.into(),
            wrist: KeypointIndex::LeftWrist.into(),
        }
    }

    /// COCO right arm (6, 8, 10).
    pub fn right() -> Self {
        Self {
            shoulder: KeypointIndex::RightShoulder.into(),
            elbow: KeypointIndex::RightElbow.into(),
            wrist: KeypointIndex::RightWrist.into(),
        }
    }
}

impl Default for ArmIndices {
    fn default() -> Self {
        Self::left()
    }
}

/// The three confident landmarks of one arm, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArmJoints {
    pub shoulder: Keypoint,
    pub elbow: Keypoint,
    pub wrist: Keypoint,
}

/// Turns a [`Pose`] into a binary arm mask.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskBuilder {
    indices: ArmIndices,
    threshold: f32,
    radius: u32,
}

impl MaskBuilder {
    /// `radius` is clamped to [`MAX_MASK_RADIUS`].
    pub fn new(indices: ArmIndices, threshold: f32, radius: u32) -> Self {
        if radius > MAX_MASK_RADIUS {
            warn!(radius, max = MAX_MASK_RADIUS, "mask radius clamped");
        }
        Self {
            indices,
            threshold,
            radius: radius.min(MAX_MASK_RADIUS),
        }
    }

    /// Pick the tracked landmarks out of `pose`.
    ///
    /// Returns `None` ("insufficient evidence") when the pose lacks one of
    /// the three landmarks, when any of their confidences is at or below the
    /// threshold or outside `[0, 1]`, or when a coordinate is not finite.
    pub fn arm_joints(&self, pose: &Pose) -> Option<ArmJoints> {
        let shoulder = pose.keypoint(self.indices.shoulder)?;
        let elbow = pose.keypoint(self.indices.elbow)?;
        let wrist = pose.keypoint(self.indices.wrist)?;
        let joints = [shoulder, elbow, wrist];

        if !joints.iter().all(|k| k.is_usable(self.threshold)) {
            debug!(
                shoulder = shoulder.confidence,
                elbow = elbow.confidence,
                wrist = wrist.confidence,
                "low confidence in arm keypoints"
            );
            return None;
        }
        if !joints.iter().all(|k| k.x.is_finite() && k.y.is_finite()) {
            return None;
        }
        Some(ArmJoints {
            shoulder: *shoulder,
            elbow: *elbow,
            wrist: *wrist,
        })
    }

    /// Rasterise `joints` into a fresh mask of `shape`.
    ///
    /// # Errors
    ///
    /// Returns [`ArmScanError::InvalidGrid`] if `shape` overflows `usize`.
    pub fn rasterise(&self, joints: &ArmJoints, shape: Shape) -> Result<Grid<u8>, ArmScanError> {
        let mut mask = Grid::try_new(shape.rows, shape.cols, 0u8)?;
        draw_cylinder(&mut mask, &joints.shoulder, &joints.elbow, self.radius);
        draw_cylinder(&mut mask, &joints.elbow, &joints.wrist, self.radius);
        Ok(mask)
    }

    /// Rasterise the arm of `pose` into a mask of `shape`.
    ///
    /// `None` means insufficient evidence (see [`MaskBuilder::arm_joints`])
    /// or an unrepresentable `shape`.
    pub fn build_arm_mask(&self, pose: &Pose, shape: Shape) -> Option<Grid<u8>> {
        let joints = self.arm_joints(pose)?;
        self.rasterise(&joints, shape).ok()
    }
}

impl Default for MaskBuilder {
    fn default() -> Self {
        Self::new(
            ArmIndices::default(),
            DEFAULT_CONFIDENCE_THRESHOLD,
            DEFAULT_MASK_RADIUS,
        )
    }
}

/// Stamp disks of `radius` along the segment `from → to`, endpoints included.
///
/// The segment is first clipped to the mask grown by `radius + 1` pixels on
/// every side; a segment entirely outside stamps nothing.  The step count is
/// the clipped length rounded up, so consecutive samples are never more than
/// one pixel apart and the walk is bounded by the mask size.  A zero-length
/// segment stamps a single disk.
pub fn draw_cylinder(mask: &mut Grid<u8>, from: &Keypoint, to: &Keypoint, radius: u32) {
    let margin = f64::from(radius.min(MAX_MASK_RADIUS)) + 1.0;
    let lo = (-margin, -margin);
    let hi = (mask.cols() as f64 + margin, mask.rows() as f64 + margin);
    let from = (f64::from(from.x), f64::from(from.y));
    let to = (f64::from(to.x), f64::from(to.y));
    let Some((from, to)) = clip_segment(from, to, lo, hi) else {
        return;
    };

    let (dx, dy) = (to.0 - from.0, to.1 - from.1);
    let steps = dx.hypot(dy).ceil() as usize;
    if steps == 0 {
        stamp_disk(mask, from.0.floor() as i64, from.1.floor() as i64, radius);
        return;
    }
    for i in 0..=steps {
        let t = i as f64 / steps as f64;
        let x = from.0 + dx * t;
        let y = from.1 + dy * t;
        stamp_disk(mask, x.floor() as i64, y.floor() as i64, radius);
    }
}

/// Liang–Barsky clip of `from → to` against the box `[lo, hi]`.
fn clip_segment(
    from: (f64, f64),
    to: (f64, f64),
    lo: (f64, f64),
    hi: (f64, f64),
) -> Option<((f64, f64), (f64, f64))> {
    let (dx, dy) = (to.0 - from.0, to.1 - from.1);
    let (mut t0, mut t1) = (0.0_f64, 1.0_f64);
    for (p, q) in [
        (-dx, from.0 - lo.0),
        (dx, hi.0 - from.0),
        (-dy, from.1 - lo.1),
        (dy, hi.1 - from.1),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            if r > t1 {
                return None;
            }
            t0 = t0.max(r);
        } else {
            if r < t0 {
                return None;
            }
            t1 = t1.min(r);
        }
    }
    let at = |t: f64| (from.0 + dx * t, from.1 + dy * t);
    Some((at(t0), at(t1)))
}

/// Set every pixel within `radius` of `(cx, cy)` to 1, clipped to the mask.
///
/// `radius` is clamped to [`MAX_MASK_RADIUS`].
pub fn stamp_disk(mask: &mut Grid<u8>, cx: i64, cy: i64, radius: u32) {
    let r = i64::from(radius.min(MAX_MASK_RADIUS));
    let r2 = r * r;
    let (rows, cols) = (mask.rows() as i64, mask.cols() as i64);
    let (y0, y1) = (cy.saturating_sub(r).max(0), cy.saturating_add(r).min(rows - 1));
    let (x0, x1) = (cx.saturating_sub(r).max(0), cx.saturating_add(r).min(cols - 1));
    for y in y0..=y1 {
        for x in x0..=x1 {
            let (dx, dy) = (x - cx, y - cy);
            if dx * dx + dy * dy > r2 {
                continue;
            }
            if let Some(px) = mask.get_mut(y as usize, x as usize) {
                *px = 1;
            }
        }
    }
}
