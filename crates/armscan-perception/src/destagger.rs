//! Column-stagger alignment for spinning-LiDAR range images.
//!
//! Each row of a staggered image is circularly shifted by the per-row
//! `pixel_shift_by_row` offset from the calibration.  Passing
//! `inverse = false` shifts row `r` right by `shift[r]`; `inverse = true`
//! shifts it left by the same amount, undoing the forward pass.
//!
//! Choosing the wrong direction silently corrupts every projected point, so
//! callers always pass the direction explicitly.

use armscan_types::{ArmScanError, Grid};

use crate::geometry::SensorCalibration;

/// Shift every row of `image` by its calibration offset.
///
/// # Errors
///
/// Returns [`ArmScanError::ShapeMismatch`] if `image` does not have the
/// calibration's `rows × cols` shape.
pub fn destagger<T: Copy + Default>(
    image: &Grid<T>,
    calibration: &SensorCalibration,
    inverse: bool,
) -> Result<Grid<T>, ArmScanError> {
    let expected = calibration.shape();
    if image.shape() != expected || calibration.pixel_shift_by_row.len() != expected.rows {
        return Err(ArmScanError::ShapeMismatch {
            expected,
            found: image.shape(),
        });
    }

    let cols = expected.cols as i64;
    let mut out = Vec::with_capacity(expected.len());
    for (r, &shift) in calibration.pixel_shift_by_row.iter().enumerate() {
        let shift = if inverse { -i64::from(shift) } else { i64::from(shift) };
        let src = image.row(r);
        let mut row = vec![T::default(); expected.cols];
        for (c, &value) in src.iter().enumerate() {
            let dst = (c as i64 + shift).rem_euclid(cols) as usize;
            row[dst] = value;
        }
        out.extend(row);
    }
    Grid::from_vec(expected.rows, expected.cols, out)
}
