//! Masked range-to-XYZ projection.
//!
//! The mask gates samples *before* geometric conversion: every pixel whose
//! mask value is zero becomes NaN, as does every zero ("no return") range.
//! After multiplying through the lookup table any point with a non-finite
//! coordinate is dropped.  Rows are processed in parallel and collected in
//! order, so the output is always in row-major pixel scan order.

use armscan_types::{ArmScanError, Grid, Point3};
use rayon::prelude::*;

use crate::geometry::LookupTable;

/// Project masked, aligned range samples into 3-D points.
///
/// `ranges` must already carry the range pre-scale factor; the lookup
/// table's range unit converts them to output units.
///
/// # Errors
///
/// Returns [`ArmScanError::ShapeMismatch`] unless `mask`, `ranges` and `lut`
/// all have the same shape.
pub fn project(
    mask: &Grid<u8>,
    ranges: &Grid<u32>,
    lut: &LookupTable,
) -> Result<Vec<Point3>, ArmScanError> {
    let expected = lut.shape();
    for found in [mask.shape(), ranges.shape()] {
        if found != expected {
            return Err(ArmScanError::ShapeMismatch { expected, found });
        }
    }

    let rows: Vec<Vec<Point3>> = (0..expected.rows)
        .into_par_iter()
        .map(|r| {
            let gated = mask
                .row(r)
                .iter()
                .zip(ranges.row(r))
                .map(|(&m, &range)| gate(m, range));
            lut.row_points(r, gated).filter(Point3::is_finite).collect()
        })
        .collect();

    Ok(rows.into_iter().flatten().collect())
}

/// Masked-out pixels and missing returns become NaN.
fn gate(mask: u8, range: u32) -> f32 {
    if mask == 0 || range == 0 {
        f32::NAN
    } else {
        range as f32
    }
}
