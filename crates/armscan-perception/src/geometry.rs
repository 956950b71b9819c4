//! Sensor geometry: calibration metadata and the per-pixel XYZ lookup table.
//!
//! A spinning LiDAR reports one range sample per (beam, azimuth step).  The
//! calibration document describes the beam elevation and azimuth offsets,
//! the per-row pixel stagger and the LiDAR-to-sensor extrinsic.  From these
//! [`LookupTable`] precomputes, for every pixel of the native (staggered)
//! layout, a unit direction vector and a beam-origin offset so that
//!
//! ```text
//! xyz = direction * (range * range_unit) + offset
//! ```
//!
//! Two document layouts are accepted: the current nested one
//! (`lidar_data_format`/`data_format`, `beam_intrinsics`,
//! `lidar_intrinsics.lidar_to_sensor_transform`) and the legacy flat one
//! with the beam and transform keys at the top level.

use std::f64::consts::PI;

use armscan_types::{ArmScanError, Grid, Point3, Shape};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::transform::{RigidTransform, Vec3};

/// Default conversion from sensor range counts (millimetres) to metres.
pub const MILLIMETRES_TO_METRES: f64 = 0.001;

/// Widest scan accepted from a calibration document.
pub const MAX_COLUMNS_PER_FRAME: usize = 1 << 16;

// ────────────────────────────────────────────────────────────────────────────
// Metadata document
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DataFormat {
    pixels_per_column: usize,
    columns_per_frame: usize,
    pixel_shift_by_row: Vec<i32>,
}

#[derive(Debug, Deserialize)]
struct BeamIntrinsics {
    beam_altitude_angles: Vec<f64>,
    beam_azimuth_angles: Vec<f64>,
    #[serde(default)]
    lidar_origin_to_beam_origin_mm: f64,
}

fn invalid(msg: impl Into<String>) -> ArmScanError {
    ArmScanError::InvalidCalibration(msg.into())
}

// ────────────────────────────────────────────────────────────────────────────
// SensorCalibration
// ────────────────────────────────────────────────────────────────────────────

/// Intrinsic description of the LiDAR.  Immutable once validated.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorCalibration {
    /// Beams per column (image rows).
    pub rows: usize,
    /// Azimuth steps per frame (image columns).
    pub cols: usize,
    /// Circular column shift of each row in the staggered layout.
    pub pixel_shift_by_row: Vec<i32>,
    /// Beam elevation per row (degrees).
    pub beam_altitude_angles: Vec<f64>,
    /// Beam azimuth offset per row (degrees).
    pub beam_azimuth_angles: Vec<f64>,
    pub lidar_origin_to_beam_origin_mm: f64,
    pub lidar_to_sensor: RigidTransform,
    /// Multiplier taking a (pre-scaled) range sample to output units.
    pub range_unit: f64,
}

impl SensorCalibration {
    /// Parse and validate a JSON calibration document.
    ///
    /// # Errors
    ///
    /// Returns [`ArmScanError::InvalidCalibration`] if the document is not
    /// JSON, a required field is missing, or the field lengths disagree with
    /// the declared row count.
    pub fn from_metadata(text: &str) -> Result<Self, ArmScanError> {
        let doc: Value = serde_json::from_str(text)
            .map_err(|e| invalid(format!("metadata is not valid JSON: {e}")))?;

        let format_value = doc
            .get("lidar_data_format")
            .or_else(|| doc.get("data_format"))
            .ok_or_else(|| invalid("missing `data_format` section"))?;
        let format = DataFormat::deserialize(format_value)
            .map_err(|e| invalid(format!("malformed data format: {e}")))?;

        let beams_value = doc.get("beam_intrinsics").unwrap_or(&doc);
        let beams = BeamIntrinsics::deserialize(beams_value)
            .map_err(|e| invalid(format!("malformed beam intrinsics: {e}")))?;

        let transform_value = doc
            .get("lidar_intrinsics")
            .and_then(|v| v.get("lidar_to_sensor_transform"))
            .or_else(|| doc.get("lidar_to_sensor_transform"));
        let lidar_to_sensor = match transform_value {
            Some(v) => {
                let values = Vec::<f64>::deserialize(v)
                    .map_err(|e| invalid(format!("malformed lidar_to_sensor_transform: {e}")))?;
                RigidTransform::from_row_major(&values).ok_or_else(|| {
                    invalid("lidar_to_sensor_transform must be 16 finite values of a rigid transform")
                })?
            }
            None => RigidTransform::identity(),
        };

        let calibration = Self {
            rows: format.pixels_per_column,
            cols: format.columns_per_frame,
            pixel_shift_by_row: format.pixel_shift_by_row,
            beam_altitude_angles: beams.beam_altitude_angles,
            beam_azimuth_angles: beams.beam_azimuth_angles,
            lidar_origin_to_beam_origin_mm: beams.lidar_origin_to_beam_origin_mm,
            lidar_to_sensor,
            range_unit: MILLIMETRES_TO_METRES,
        };
        calibration.validate()?;
        Ok(calibration)
    }

    /// Replace the range unit (e.g. `1.0` to keep raw units).
    pub fn with_range_unit(mut self, range_unit: f64) -> Self {
        self.range_unit = range_unit;
        self
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.rows, self.cols)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ArmScanError> {
        if self.rows == 0 || self.cols == 0 {
            return Err(invalid(format!(
                "image shape must be non-empty, got {}",
                self.shape()
            )));
        }
        if self.cols > MAX_COLUMNS_PER_FRAME || self.shape().checked_len().is_none() {
            return Err(invalid(format!(
                "columns_per_frame must be at most {MAX_COLUMNS_PER_FRAME}, got {}",
                self.cols
            )));
        }
        let per_row = [
            ("pixel_shift_by_row", self.pixel_shift_by_row.len()),
            ("beam_altitude_angles", self.beam_altitude_angles.len()),
            ("beam_azimuth_angles", self.beam_azimuth_angles.len()),
        ];
        for (name, len) in per_row {
            if len != self.rows {
                return Err(invalid(format!(
                    "{name} has {len} entries but pixels_per_column is {}",
                    self.rows
                )));
            }
        }
        let angles_finite = self
            .beam_altitude_angles
            .iter()
            .chain(&self.beam_azimuth_angles)
            .all(|a| a.is_finite());
        if !angles_finite {
            return Err(invalid("beam angles must be finite"));
        }
        if !self.lidar_origin_to_beam_origin_mm.is_finite() {
            return Err(invalid("lidar_origin_to_beam_origin_mm must be finite"));
        }
        if !(self.range_unit.is_finite() && self.range_unit > 0.0) {
            return Err(invalid(format!(
                "range unit must be positive, got {}",
                self.range_unit
            )));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// LookupTable
// ────────────────────────────────────────────────────────────────────────────

/// Per-pixel unit directions and beam-origin offsets, in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupTable {
    directions: Grid<Point3>,
    offsets: Grid<Point3>,
    range_unit: f32,
}

impl LookupTable {
    /// Build the table for every pixel of the staggered layout.
    pub fn from_calibration(cal: &SensorCalibration) -> Result<Self, ArmScanError> {
        cal.validate()?;
        let (rows, cols) = (cal.rows, cal.cols);
        let n = cal.lidar_origin_to_beam_origin_mm;
        let mut directions = Vec::with_capacity(rows * cols);
        let mut offsets = Vec::with_capacity(rows * cols);

        for r in 0..rows {
            let altitude = cal.beam_altitude_angles[r] * 2.0 * PI / 360.0;
            let azimuth = -cal.beam_azimuth_angles[r] * 2.0 * PI / 360.0;
            for c in 0..cols {
                let encoder = 2.0 * PI * (1.0 - c as f64 / cols as f64);
                let dir = Vec3::new(
                    (encoder + azimuth).cos() * altitude.cos(),
                    (encoder + azimuth).sin() * altitude.cos(),
                    altitude.sin(),
                );
                let beam_origin = Vec3::new(encoder.cos() * n, encoder.sin() * n, 0.0);
                let offset = beam_origin.sub(dir.scale(n));

                let dir = cal.lidar_to_sensor.apply_direction(dir);
                let offset = cal.lidar_to_sensor.apply_point(offset).scale(cal.range_unit);
                directions.push(narrow(dir));
                offsets.push(narrow(offset));
            }
        }

        debug!(shape = %cal.shape(), "built xyz lookup table");
        Ok(Self {
            directions: Grid::from_vec(rows, cols, directions)?,
            offsets: Grid::from_vec(rows, cols, offsets)?,
            range_unit: cal.range_unit as f32,
        })
    }

    /// Table with caller-supplied directions and no beam-origin offset.
    ///
    /// Directions are expected to be unit length.
    pub fn from_directions(directions: Grid<Point3>, range_unit: f32) -> Self {
        let shape = directions.shape();
        Self {
            offsets: Grid::new(shape.rows, shape.cols, Point3::new(0.0, 0.0, 0.0)),
            directions,
            range_unit,
        }
    }

    pub fn shape(&self) -> Shape {
        self.directions.shape()
    }

    pub fn range_unit(&self) -> f32 {
        self.range_unit
    }

    pub fn direction(&self, row: usize, col: usize) -> Option<&Point3> {
        self.directions.get(row, col)
    }

    pub fn offset(&self, row: usize, col: usize) -> Option<&Point3> {
        self.offsets.get(row, col)
    }

    /// Convert the range samples of row `row` into points, column by column.
    ///
    /// `ranges` must hold one value per column of the table.
    pub(crate) fn row_points<'a>(
        &'a self,
        row: usize,
        ranges: impl Iterator<Item = f32> + 'a,
    ) -> impl Iterator<Item = Point3> + 'a {
        let dirs = self.directions.row(row);
        let offs = self.offsets.row(row);
        ranges
            .zip(dirs.iter().zip(offs))
            .map(move |(range, (d, o))| {
                let s = range * self.range_unit;
                Point3::new(d.x * s + o.x, d.y * s + o.y, d.z * s + o.z)
            })
    }
}

fn narrow(v: Vec3) -> Point3 {
    Point3::new(v.x as f32, v.y as f32, v.z as f32)
}

// ────────────────────────────────────────────────────────────────────────────
// SensorGeometry
// ────────────────────────────────────────────────────────────────────────────

/// A validated calibration together with the lookup table derived from it.
///
/// Held behind an `Arc` by the pipeline and swapped as one unit when the
/// calibration is re-delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorGeometry {
    pub calibration: SensorCalibration,
    pub lut: LookupTable,
}

impl SensorGeometry {
    /// Parse `metadata` and build the lookup table in one step.
    pub fn load(metadata: &str) -> Result<Self, ArmScanError> {
        Self::from_calibration(SensorCalibration::from_metadata(metadata)?)
    }

    pub fn from_calibration(calibration: SensorCalibration) -> Result<Self, ArmScanError> {
        let lut = LookupTable::from_calibration(&calibration)?;
        Ok(Self { calibration, lut })
    }

    pub fn shape(&self) -> Shape {
        self.calibration.shape()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
