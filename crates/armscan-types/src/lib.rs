use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod grid;

pub use grid::{Grid, Shape};

/// Number of landmarks in the COCO body-pose schema.
pub const COCO_KEYPOINT_COUNT: usize = 17;

/// COCO landmark indices as emitted by YOLO-style pose estimators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeypointIndex {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

impl From<KeypointIndex> for usize {
    fn from(index: KeypointIndex) -> usize {
        index as usize
    }
}

/// One estimated body landmark in image-pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Detector confidence, nominally in `[0, 1]`.
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }

    /// `true` when the confidence lies in `[0, 1]` and strictly exceeds
    /// `threshold`.  NaN confidences are never usable.
    pub fn is_usable(&self, threshold: f32) -> bool {
        (0.0..=1.0).contains(&self.confidence) && self.confidence > threshold
    }
}

/// One detected skeleton: landmarks ordered by the pose schema.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub keypoints: Vec<Keypoint>,
}

impl Pose {
    pub fn new(keypoints: Vec<Keypoint>) -> Self {
        Self { keypoints }
    }

    /// Landmark at schema position `index`, if the detector emitted it.
    pub fn keypoint(&self, index: usize) -> Option<&Keypoint> {
        self.keypoints.get(index)
    }
}

/// A pose together with the shape of the image it was detected in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseFrame {
    pub pose: Pose,
    pub image_shape: Shape,
}

/// One range image as delivered by the sensor driver.
///
/// Values are raw driver counts; `0` means "no return".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeImageFrame {
    pub timestamp: DateTime<Utc>,
    pub ranges: Grid<u32>,
}

/// Provenance of a raw point cloud: only the header is consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointCloudHeader {
    pub timestamp: DateTime<Utc>,
    pub frame_id: String,
}

/// A Cartesian point in the sensor frame (metres by default).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// The arm points extracted from one LiDAR frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredPointSet {
    /// Borrowed from the cached point-cloud header.
    pub timestamp: DateTime<Utc>,
    pub frame_id: String,
    /// Row-major pixel scan order; every coordinate is finite.
    pub points: Vec<Point3>,
}

/// Unified event wrapper for the in-process bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "armscan-cli::replay"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Stamp `payload` with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// Sensor calibration document (JSON text).
    Metadata(String),
    RangeImage(RangeImageFrame),
    PointCloud(PointCloudHeader),
    Pose(PoseFrame),
    FilteredPoints(FilteredPointSet),
}

/// Error taxonomy for the arm-segmentation pipeline.
///
/// Every variant is contained to the frame or the calibration update that
/// produced it; none of them is meant to terminate the process.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArmScanError {
    #[error("Invalid calibration: {0}")]
    InvalidCalibration(String),

    #[error("Sensor geometry not ready: no calibration has been loaded")]
    GeometryNotReady,

    #[error("Shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch { expected: Shape, found: Shape },

    #[error("Grid of {rows}x{cols} cannot hold {len} elements")]
    InvalidGrid { rows: usize, cols: usize, len: usize },

    #[error("Event bus channel error: {0}")]
    Channel(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypoint_usable_requires_strictly_above_threshold() {
        assert!(Keypoint::new(0.0, 0.0, 0.51).is_usable(0.5));
        assert!(!Keypoint::new(0.0, 0.0, 0.5).is_usable(0.5));
        assert!(!Keypoint::new(0.0, 0.0, 1.5).is_usable(0.5));
        assert!(!Keypoint::new(0.0, 0.0, f32::NAN).is_usable(0.5));
    }

    #[test]
    fn keypoint_index_maps_to_coco_slot() {
        assert_eq!(usize::from(KeypointIndex::LeftShoulder), 5);
        assert_eq!(usize::from(KeypointIndex::LeftElbow), 7);
        assert_eq!(usize::from(KeypointIndex::LeftWrist), 9);
        assert_eq!(usize::from(KeypointIndex::RightAnkle), COCO_KEYPOINT_COUNT - 1);
    }

    #[test]
    fn pose_keypoint_out_of_range_is_none() {
        let pose = Pose::new(vec![Keypoint::new(1.0, 2.0, 0.9)]);
        assert!(pose.keypoint(0).is_some());
        assert!(pose.keypoint(5).is_none());
    }

    #[test]
    fn event_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let event = Event::new(
            "armscan-cli::replay",
            EventPayload::PointCloud(PointCloudHeader {
                timestamp: Utc::now(),
                frame_id: "os_sensor".to_string(),
            }),
        );
        let json = serde_json::to_string(&event)?;
        let back: Event = serde_json::from_str(&json)?;
        assert_eq!(event.id, back.id);
        assert_eq!(event.source, back.source);
        assert!(matches!(back.payload, EventPayload::PointCloud(ref h) if h.frame_id == "os_sensor"));
        Ok(())
    }

    #[test]
    fn range_image_payload_rejects_bad_grid() {
        let json = r#"{"RangeImage":{"timestamp":"2024-01-01T00:00:00Z","ranges":{"rows":2,"cols":2,"data":[1]}}}"#;
        assert!(serde_json::from_str::<EventPayload>(json).is_err());
    }

    #[test]
    fn error_display() {
        let err = ArmScanError::ShapeMismatch {
            expected: Shape::new(64, 1024),
            found: Shape::new(480, 640),
        };
        assert!(err.to_string().contains("64x1024"));
        assert!(err.to_string().contains("480x640"));
        assert!(ArmScanError::GeometryNotReady.to_string().contains("not ready"));
    }

    #[test]
    fn point_finiteness() {
        assert!(Point3::new(0.0, 1.0, 2.0).is_finite());
        assert!(!Point3::new(f32::NAN, 1.0, 2.0).is_finite());
        assert!(!Point3::new(0.0, f32::INFINITY, 2.0).is_finite());
    }
}
