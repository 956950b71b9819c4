//! Fusion pipeline: pose + range image → filtered arm points.
//!
//! [`FusionPipeline`] caches the latest value of each inbound stream in its
//! own slot.  Calibration, range-image and point-cloud handlers each write
//! only their slot; a pose arrival triggers one cycle:
//!
//! 1. pick the arm landmarks (declines on low confidence),
//! 2. snapshot the range image, point-cloud header and sensor geometry,
//! 3. rasterise the arm mask at the sensor shape and re-align the range image with the calibration's stagger offsets,
//! 4. project the masked samples through the lookup table,
//! 5. stamp the result with the cached header's timestamp.
//!
//! No timestamp matching is attempted: whichever values are cached when the
//! pose arrives are fused.  Every per-frame fault is reported in the
//! [`CycleOutcome`] and never poisons later cycles.
//!
//! # Example
//!
//! ```rust
//! use armscan_perception::pipeline::{CycleOutcome, FusionPipeline, PipelineConfig, SkipReason};
//! use armscan_types::{Keypoint, Pose, PoseFrame, Shape};
//!
//! let pipeline = FusionPipeline::new(PipelineConfig::default());
//! let frame = PoseFrame {
//!     pose: Pose::new(vec![Keypoint::new(1.0, 1.0, 0.9); 17]),
//!     image_shape: Shape::new(8, 16),
//! };
//!
//! // No calibration or range image yet: the cycle is skipped, not failed.
//! let outcome = pipeline.ingest_pose(&frame);
//! assert!(matches!(outcome, CycleOutcome::Skipped(SkipReason::MissingRangeImage)));
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use armscan_types::{
    ArmScanError, FilteredPointSet, Grid, Point3, PointCloudHeader, PoseFrame, RangeImageFrame,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::destagger::destagger;
use crate::geometry::{MILLIMETRES_TO_METRES, SensorCalibration, SensorGeometry};
use crate::mask::{
    ArmIndices, ArmJoints, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_MASK_RADIUS, MaskBuilder,
};
use crate::projector::project;

/// Factor by which delivered range images are multiplied on ingestion to
/// undo the driver's coarser range encoding.
pub const DEFAULT_RANGE_SCALE: u32 = 4;

/// Frame id stamped on every emitted point set.
pub const DEFAULT_OUTPUT_FRAME_ID: &str = "os_sensor";

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Tunables for [`FusionPipeline`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Range pre-scale factor, applied exactly once on ingestion.
    pub range_scale: u32,
    /// Conversion from scaled range counts to output units.
    pub range_unit: f64,
    pub confidence_threshold: f32,
    /// Disk radius stamped along the arm segments (pixels), clamped to
    /// [`MAX_MASK_RADIUS`](crate::mask::MAX_MASK_RADIUS).
    pub mask_radius: u32,
    pub output_frame_id: String,
    /// Direction handed to [`destagger`] before projection.
    pub inverse_destagger: bool,
    pub arm_indices: ArmIndices,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            range_scale: DEFAULT_RANGE_SCALE,
            range_unit: MILLIMETRES_TO_METRES,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            mask_radius: DEFAULT_MASK_RADIUS,
            output_frame_id: DEFAULT_OUTPUT_FRAME_ID.to_string(),
            inverse_destagger: true,
            arm_indices: ArmIndices::default(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Outcomes
// ────────────────────────────────────────────────────────────────────────────

/// Why a pose cycle produced no output.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// A tracked landmark was missing or not confident enough.
    InsufficientEvidence,
    MissingRangeImage,
    MissingPointCloud,
    GeometryNotReady,
    /// A data-integrity fault confined to this frame.
    Fault(ArmScanError),
}

/// Result of one pose-triggered cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Emitted(FilteredPointSet),
    Skipped(SkipReason),
}

/// Running counters, readable at any time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub poses: u64,
    pub range_images: u64,
    pub emitted: u64,
    pub skipped_insufficient: u64,
    pub skipped_not_ready: u64,
    pub skipped_missing: u64,
    pub faults: u64,
}

#[derive(Debug, Default)]
struct Counters {
    poses: AtomicU64,
    range_images: AtomicU64,
    emitted: AtomicU64,
    skipped_insufficient: AtomicU64,
    skipped_not_ready: AtomicU64,
    skipped_missing: AtomicU64,
    faults: AtomicU64,
}

fn bump(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

// ────────────────────────────────────────────────────────────────────────────
// Latest-value slot
// ────────────────────────────────────────────────────────────────────────────

/// A single-writer "latest value" cell.  Writers swap the `Arc`; readers
/// clone it and compute without holding the lock.
#[derive(Debug)]
struct Slot<T>(RwLock<Option<Arc<T>>>);

impl<T> Slot<T> {
    fn empty() -> Self {
        Self(RwLock::new(None))
    }

    fn store(&self, value: T) {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(Arc::new(value));
    }

    fn load(&self) -> Option<Arc<T>> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FusionPipeline
// ────────────────────────────────────────────────────────────────────────────

/// Orchestrates mask building, de-staggering and projection.
///
/// All ingestion methods take `&self`, so one pipeline can be shared behind
/// an `Arc` between the handlers of independent streams.
#[derive(Debug)]
pub struct FusionPipeline {
    config: PipelineConfig,
    mask_builder: MaskBuilder,
    geometry: Slot<SensorGeometry>,
    range_image: Slot<Grid<u32>>,
    point_cloud: Slot<PointCloudHeader>,
    counters: Counters,
}

impl FusionPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let mask_builder = MaskBuilder::new(
            config.arm_indices,
            config.confidence_threshold,
            config.mask_radius,
        );
        Self {
            config,
            mask_builder,
            geometry: Slot::empty(),
            range_image: Slot::empty(),
            point_cloud: Slot::empty(),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// `true` once a valid calibration has been loaded.
    pub fn is_ready(&self) -> bool {
        self.geometry.load().is_some()
    }

    /// Currently installed geometry, if any.
    pub fn geometry(&self) -> Option<Arc<SensorGeometry>> {
        self.geometry.load()
    }

    // ── Ingestion ───────────────────────────────────────────────────────────

    /// Parse a calibration document and atomically install the derived
    /// geometry.
    ///
    /// On failure the previously installed geometry (if any) stays active,
    /// and a pipeline that was not ready stays not ready.
    pub fn ingest_metadata(&self, metadata: &str) -> Result<(), ArmScanError> {
        let geometry = SensorCalibration::from_metadata(metadata).and_then(|cal| {
            SensorGeometry::from_calibration(cal.with_range_unit(self.config.range_unit))
        });
        match geometry {
            Ok(geometry) => {
                info!(shape = %geometry.shape(), "sensor metadata loaded");
                self.install_geometry(geometry);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to process sensor metadata");
                Err(e)
            }
        }
    }

    /// Install an already-built geometry.
    pub fn install_geometry(&self, geometry: SensorGeometry) {
        self.geometry.store(geometry);
    }

    /// Cache a range image, applying the pre-scale factor once.
    pub fn ingest_range_image(&self, frame: RangeImageFrame) {
        let scale = self.config.range_scale;
        let scaled = frame.ranges.map(|&r| r.saturating_mul(scale));
        let n = bump(&self.counters.range_images);
        if n % 10 == 0 {
            info!(shape = %scaled.shape(), received = n, "received range image");
        }
        self.range_image.store(scaled);
    }

    /// Cache the provenance header of the latest point cloud.
    pub fn ingest_point_cloud(&self, header: PointCloudHeader) {
        debug!(frame_id = %header.frame_id, "cached point cloud header");
        self.point_cloud.store(header);
    }

    /// Run one fusion cycle for a freshly detected pose.
    pub fn ingest_pose(&self, frame: &PoseFrame) -> CycleOutcome {
        let n = bump(&self.counters.poses);
        debug!(detected = n, "pose detected");

        let Some(joints) = self.mask_builder.arm_joints(&frame.pose) else {
            warn!("failed to create arm region mask");
            bump(&self.counters.skipped_insufficient);
            return CycleOutcome::Skipped(SkipReason::InsufficientEvidence);
        };

        // One consistent snapshot; later writes do not affect this cycle.
        let range_image = self.range_image.load();
        let header = self.point_cloud.load();
        let geometry = self.geometry.load();

        let (range_image, header) = match (range_image, header) {
            (Some(range_image), Some(header)) => (range_image, header),
            (range_image, _) => {
                warn!("no point cloud or range image data available");
                bump(&self.counters.skipped_missing);
                let reason = if range_image.is_none() {
                    SkipReason::MissingRangeImage
                } else {
                    SkipReason::MissingPointCloud
                };
                return CycleOutcome::Skipped(reason);
            }
        };

        match self.extract(frame, &joints, &range_image, geometry.as_deref()) {
            Ok(points) => {
                info!(points = points.len(), "publishing filtered arm points");
                bump(&self.counters.emitted);
                CycleOutcome::Emitted(FilteredPointSet {
                    timestamp: header.timestamp,
                    frame_id: self.config.output_frame_id.clone(),
                    points,
                })
            }
            Err(ArmScanError::GeometryNotReady) => {
                warn!("metadata or lookup table not ready");
                bump(&self.counters.skipped_not_ready);
                CycleOutcome::Skipped(SkipReason::GeometryNotReady)
            }
            Err(e) => {
                error!(error = %e, "error filtering points; frame discarded");
                bump(&self.counters.faults);
                CycleOutcome::Skipped(SkipReason::Fault(e))
            }
        }
    }

    /// Mask, re-align and project one frame against `geometry`.
    ///
    /// The pose image must match the sensor shape before any mask is
    /// allocated, so an absurd `image_shape` costs nothing.
    fn extract(
        &self,
        frame: &PoseFrame,
        joints: &ArmJoints,
        range_image: &Grid<u32>,
        geometry: Option<&SensorGeometry>,
    ) -> Result<Vec<Point3>, ArmScanError> {
        let geometry = geometry.ok_or(ArmScanError::GeometryNotReady)?;
        let expected = geometry.shape();
        if frame.image_shape != expected {
            return Err(ArmScanError::ShapeMismatch {
                expected,
                found: frame.image_shape,
            });
        }
        let mask = self.mask_builder.rasterise(joints, expected)?;
        let aligned = destagger(
            range_image,
            &geometry.calibration,
            self.config.inverse_destagger,
        )?;
        project(&mask, &aligned, &geometry.lut)
    }

    /// Snapshot of the running counters.
    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            poses: c.poses.load(Ordering::Relaxed),
            range_images: c.range_images.load(Ordering::Relaxed),
            emitted: c.emitted.load(Ordering::Relaxed),
            skipped_insufficient: c.skipped_insufficient.load(Ordering::Relaxed),
            skipped_not_ready: c.skipped_not_ready.load(Ordering::Relaxed),
            skipped_missing: c.skipped_missing.load(Ordering::Relaxed),
            faults: c.faults.load(Ordering::Relaxed),
        }
    }
}

impl Default for FusionPipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{LookupTable, SensorCalibration};
    use crate::transform::RigidTransform;
    use armscan_types::{Keypoint, Pose, Shape};
    use chrono::{TimeZone, Utc};

    /// 2×4 sensor with no stagger whose beams all point straight up.
    fn upward_geometry() -> SensorGeometry {
        let calibration = SensorCalibration {
            rows: 2,
            cols: 4,
            pixel_shift_by_row: vec![0, 0],
            beam_altitude_angles: vec![90.0, 90.0],
            beam_azimuth_angles: vec![0.0, 0.0],
            lidar_origin_to_beam_origin_mm: 0.0,
            lidar_to_sensor: RigidTransform::identity(),
            range_unit: 1.0,
        };
        SensorGeometry {
            lut: LookupTable::from_directions(Grid::new(2, 4, Point3::new(0.0, 0.0, 1.0)), 1.0),
            calibration,
        }
    }

    fn unscaled() -> PipelineConfig {
        PipelineConfig {
            range_scale: 1,
            range_unit: 1.0,
            mask_radius: 0,
            ..PipelineConfig::default()
        }
    }

    /// Left arm along the top row: pixels (0,0) → (0,2) → (0,2).
    fn arm_pose(elbow_confidence: f32) -> PoseFrame {
        let mut keypoints = vec![Keypoint::new(0.0, 0.0, 0.0); 17];
        keypoints[5] = Keypoint::new(0.0, 0.0, 0.9);
        keypoints[7] = Keypoint::new(2.0, 0.0, elbow_confidence);
        keypoints[9] = Keypoint::new(2.0, 0.0, 0.9);
        PoseFrame {
            pose: Pose::new(keypoints),
            image_shape: Shape::new(2, 4),
        }
    }

    fn range_frame() -> RangeImageFrame {
        RangeImageFrame {
            timestamp: Utc::now(),
            ranges: Grid::from_rows(vec![vec![1, 1, 1, 1], vec![2, 2, 2, 2]]).unwrap(),
        }
    }

    fn header() -> PointCloudHeader {
        PointCloudHeader {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            frame_id: "os_lidar".to_string(),
        }
    }

    fn ready_pipeline(config: PipelineConfig) -> FusionPipeline {
        let pipeline = FusionPipeline::new(config);
        pipeline.install_geometry(upward_geometry());
        pipeline.ingest_range_image(range_frame());
        pipeline.ingest_point_cloud(header());
        pipeline
    }

    #[test]
    fn emits_masked_points_with_borrowed_timestamp() {
        let pipeline = ready_pipeline(unscaled());
        match pipeline.ingest_pose(&arm_pose(0.9)) {
            CycleOutcome::Emitted(set) => {
                // Columns 0, 1, 2 of row 0 are masked.
                assert_eq!(set.points, vec![Point3::new(0.0, 0.0, 1.0); 3]);
                assert_eq!(set.timestamp, header().timestamp);
                assert_eq!(set.frame_id, DEFAULT_OUTPUT_FRAME_ID);
            }
            other => panic!("expected emission, got {other:?}"),
        }
        assert_eq!(pipeline.stats().emitted, 1);
    }

    #[test]
    fn range_scale_applied_once_on_ingestion() {
        let pipeline = ready_pipeline(PipelineConfig {
            range_scale: 4,
            ..unscaled()
        });
        let CycleOutcome::Emitted(set) = pipeline.ingest_pose(&arm_pose(0.9)) else {
            panic!("expected emission");
        };
        assert!(set.points.iter().all(|p| p.z == 4.0));
        // A second cycle on the same cached image must not scale again.
        let CycleOutcome::Emitted(again) = pipeline.ingest_pose(&arm_pose(0.9)) else {
            panic!("expected emission");
        };
        assert_eq!(set.points, again.points);
    }

    #[test]
    fn low_confidence_elbow_skips_cycle() {
        let pipeline = ready_pipeline(unscaled());
        assert_eq!(
            pipeline.ingest_pose(&arm_pose(0.4)),
            CycleOutcome::Skipped(SkipReason::InsufficientEvidence)
        );
        assert_eq!(pipeline.stats().skipped_insufficient, 1);
    }

    #[test]
    fn missing_inputs_skip_cycle() {
        let pipeline = FusionPipeline::new(unscaled());
        pipeline.install_geometry(upward_geometry());
        assert_eq!(
            pipeline.ingest_pose(&arm_pose(0.9)),
            CycleOutcome::Skipped(SkipReason::MissingRangeImage)
        );
        pipeline.ingest_range_image(range_frame());
        assert_eq!(
            pipeline.ingest_pose(&arm_pose(0.9)),
            CycleOutcome::Skipped(SkipReason::MissingPointCloud)
        );
        assert_eq!(pipeline.stats().skipped_missing, 2);
    }

    #[test]
    fn geometry_not_ready_skips_cycle() {
        let pipeline = FusionPipeline::new(unscaled());
        pipeline.ingest_range_image(range_frame());
        pipeline.ingest_point_cloud(header());
        assert!(!pipeline.is_ready());
        assert_eq!(
            pipeline.ingest_pose(&arm_pose(0.9)),
            CycleOutcome::Skipped(SkipReason::GeometryNotReady)
        );
        let stats = pipeline.stats();
        assert_eq!((stats.skipped_not_ready, stats.faults), (1, 0));
    }

    #[test]
    fn shape_mismatch_is_contained_to_one_frame() {
        let pipeline = ready_pipeline(unscaled());
        let mut wrong = arm_pose(0.9);
        wrong.image_shape = Shape::new(3, 4);
        assert!(matches!(
            pipeline.ingest_pose(&wrong),
            CycleOutcome::Skipped(SkipReason::Fault(ArmScanError::ShapeMismatch { .. }))
        ));
        // The next good frame is unaffected.
        assert!(matches!(
            pipeline.ingest_pose(&arm_pose(0.9)),
            CycleOutcome::Emitted(_)
        ));
        let stats = pipeline.stats();
        assert_eq!((stats.faults, stats.emitted, stats.poses), (1, 1, 2));
    }

    #[test]
    fn huge_pose_image_shape_is_a_contained_fault() {
        let pipeline = ready_pipeline(unscaled());
        let mut wrong = arm_pose(0.9);
        wrong.image_shape = Shape::new(usize::MAX, 2);
        assert_eq!(
            pipeline.ingest_pose(&wrong),
            CycleOutcome::Skipped(SkipReason::Fault(ArmScanError::ShapeMismatch {
                expected: Shape::new(2, 4),
                found: Shape::new(usize::MAX, 2),
            }))
        );
        assert!(matches!(
            pipeline.ingest_pose(&arm_pose(0.9)),
            CycleOutcome::Emitted(_)
        ));
    }

    #[test]
    fn far_wrist_still_emits_and_later_frames_flow() {
        let pipeline = ready_pipeline(unscaled());
        let mut far = arm_pose(0.9);
        far.pose.keypoints[9] = Keypoint::new(1e30, 0.0, 0.9);
        let CycleOutcome::Emitted(set) = pipeline.ingest_pose(&far) else {
            panic!("expected emission");
        };
        // The forearm is clipped at the image edge: all of row 0.
        assert_eq!(set.points, vec![Point3::new(0.0, 0.0, 1.0); 4]);
        assert!(matches!(
            pipeline.ingest_pose(&arm_pose(0.9)),
            CycleOutcome::Emitted(_)
        ));
        assert_eq!(pipeline.stats().emitted, 2);
    }

    #[test]
    fn invalid_metadata_keeps_pipeline_not_ready() {
        let pipeline = FusionPipeline::new(unscaled());
        let err = pipeline.ingest_metadata("{\"data_format\": {}}").unwrap_err();
        assert!(matches!(err, ArmScanError::InvalidCalibration(_)));
        assert!(!pipeline.is_ready());
    }

    #[test]
    fn invalid_redelivery_keeps_previous_geometry() {
        let pipeline = ready_pipeline(unscaled());
        assert!(pipeline.ingest_metadata("garbage").is_err());
        assert_eq!(pipeline.geometry().map(|g| g.shape()), Some(Shape::new(2, 4)));
    }

    #[test]
    fn metadata_redelivery_swaps_geometry() {
        let pipeline = FusionPipeline::new(unscaled());
        let doc = |cols: usize| {
            serde_json::json!({
                "data_format": {
                    "pixels_per_column": 2,
                    "columns_per_frame": cols,
                    "pixel_shift_by_row": [0, 0]
                },
                "beam_altitude_angles": [90.0, 90.0],
                "beam_azimuth_angles": [0.0, 0.0]
            })
            .to_string()
        };
        pipeline.ingest_metadata(&doc(4)).unwrap();
        let first = pipeline.geometry().unwrap();
        pipeline.ingest_metadata(&doc(8)).unwrap();
        assert_eq!(first.shape(), Shape::new(2, 4));
        assert_eq!(pipeline.geometry().unwrap().shape(), Shape::new(2, 8));
        assert_eq!(pipeline.geometry().unwrap().calibration.range_unit, 1.0);
    }

    #[test]
    fn latest_range_image_wins() {
        let pipeline = ready_pipeline(unscaled());
        pipeline.ingest_range_image(RangeImageFrame {
            timestamp: Utc::now(),
            ranges: Grid::new(2, 4, 9),
        });
        let CycleOutcome::Emitted(set) = pipeline.ingest_pose(&arm_pose(0.9)) else {
            panic!("expected emission");
        };
        assert!(set.points.iter().all(|p| p.z == 9.0));
    }

    #[test]
    fn shared_pipeline_accepts_concurrent_writers() {
        let pipeline = Arc::new(ready_pipeline(unscaled()));
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let p = Arc::clone(&pipeline);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        p.ingest_range_image(RangeImageFrame {
                            timestamp: Utc::now(),
                            ranges: Grid::new(2, 4, i + 1),
                        });
                        p.ingest_point_cloud(header());
                    }
                })
            })
            .collect();
        for _ in 0..50 {
            // Every snapshot is internally consistent: one z value per set.
            if let CycleOutcome::Emitted(set) = pipeline.ingest_pose(&arm_pose(0.9)) {
                let z0 = set.points[0].z;
                assert!(set.points.iter().all(|p| p.z == z0));
            }
        }
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(pipeline.stats().range_images, 201);
    }
}
