//! `armscan-perception` – arm region extraction from LiDAR range images.
//!
//! Fuses a 2-D human pose with the range image of a spinning LiDAR and keeps
//! only the 3-D points that fall on the tracked arm.
//!
//! # Modules
//!
//! - [`geometry`] – [`SensorGeometry`][geometry::SensorGeometry]: parses the
//!   calibration document and precomputes the per-pixel XYZ
//!   [`LookupTable`][geometry::LookupTable].
//! - [`mask`] – [`MaskBuilder`][mask::MaskBuilder]: rasterises the
//!   shoulder → elbow → wrist chain into a binary region-of-interest mask.
//! - [`destagger`] – [`destagger`][destagger::destagger]: undoes the per-row
//!   column stagger of the native range image.
//! - [`projector`] – [`project`][projector::project]: multiplies masked range
//!   samples through the lookup table and drops invalid points.
//! - [`pipeline`] – [`FusionPipeline`][pipeline::FusionPipeline]: caches the
//!   latest calibration, range image and point-cloud header and runs one
//!   extraction cycle per pose.
//! - [`transform`] – [`RigidTransform`][transform::RigidTransform]: the
//!   LiDAR-to-sensor extrinsic applied while building the lookup table.

pub mod destagger;
pub mod geometry;
pub mod mask;
pub mod pipeline;
pub mod projector;
pub mod transform;

pub use geometry::{LookupTable, SensorCalibration, SensorGeometry};
pub use mask::{ArmIndices, ArmJoints, MaskBuilder};
pub use pipeline::{CycleOutcome, FusionPipeline, PipelineConfig, PipelineStats, SkipReason};
