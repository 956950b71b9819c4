//! `armscan replay` – push a recorded session through a live fusion node.
//!
//! The calibration document (if given) is published first, followed by every
//! payload of the session in file order.  All traffic goes through the
//! in-process [`EventBus`] exactly as it would from live drivers, and every
//! point set the node publishes is written as one JSON line.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use armscan_middleware::{EventBus, Topic};
use armscan_perception::FusionPipeline;
use armscan_runtime::{FusionNode, NodeSummary};
use armscan_types::{Event, EventPayload};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::config::Config;
use crate::session::{load_session, write_point_set};

/// `source` tag on every replayed event.
const REPLAY_SOURCE: &str = "armscan-cli::replay";

/// Inputs of one replay run.
#[derive(Debug, Clone)]
pub struct ReplayRequest {
    pub metadata: Option<PathBuf>,
    pub session: PathBuf,
}

/// What a replay did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    /// Events published on the sensor lane.
    pub replayed: usize,
    /// Point sets written to the output.
    pub written: usize,
    pub node: NodeSummary,
}

/// Run one replay, writing point sets to `out`.
///
/// `interrupt` resolves when the user asks to stop early; remaining session
/// events are then not published.
pub async fn run(
    cfg: &Config,
    request: &ReplayRequest,
    out: &mut impl Write,
    interrupt: impl std::future::Future<Output = ()>,
) -> Result<ReplayReport, String> {
    let mut payloads = Vec::new();
    if let Some(path) = &request.metadata {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read metadata at {}: {}", path.display(), e))?;
        payloads.push(EventPayload::Metadata(text));
    }
    payloads.extend(load_session(&request.session)?);

    // The node only drains after publishing stops, so the buffer must hold
    // the whole session to avoid lag.
    let capacity = cfg.bus_capacity.max(payloads.len() + 1);
    let bus = EventBus::new(capacity);
    let mut outputs = bus.subscribe_to(Topic::FilteredPoints);

    let pipeline = Arc::new(FusionPipeline::new(cfg.pipeline.clone()));
    let node = FusionNode::new(pipeline, bus.clone(), cfg.metadata_timeout());
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(node.run(stop_rx));

    tokio::pin!(interrupt);
    let mut replayed = 0;
    for payload in payloads {
        if Topic::for_payload(&payload) != Topic::Sensors {
            warn!("skipping non-sensor payload in session");
            continue;
        }
        tokio::select! {
            biased;
            () = &mut interrupt => {
                warn!(replayed, "replay interrupted");
                break;
            }
            () = std::future::ready(()) => {}
        }
        bus.publish(Event::new(REPLAY_SOURCE, payload))
            .map_err(|e| format!("Failed to publish event: {}", e))?;
        replayed += 1;
        // Let the node keep pace with the publisher.
        tokio::task::yield_now().await;
    }

    // The send only fails if the node already exited.
    let _ = stop_tx.send(true);
    let node = handle
        .await
        .map_err(|e| format!("Fusion node task failed: {}", e))?;

    let mut written = 0;
    loop {
        match outputs.try_recv() {
            Ok(event) => {
                if let EventPayload::FilteredPoints(set) = event.payload {
                    write_point_set(&mut *out, &set)?;
                    written += 1;
                }
            }
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                warn!(lagged_by = n, "output lane lagged; point sets lost");
            }
            Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed) => {
                break;
            }
        }
    }
    out.flush()
        .map_err(|e| format!("Failed to flush output: {}", e))?;

    info!(replayed, written, "replay finished");
    Ok(ReplayReport {
        replayed,
        written,
        node,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use armscan_types::FilteredPointSet;

    const METADATA: &str = r#"{
        "data_format": {"pixels_per_column": 2, "columns_per_frame": 4, "pixel_shift_by_row": [0, 0]},
        "beam_altitude_angles": [90.0, 90.0],
        "beam_azimuth_angles": [0.0, 0.0]
    }"#;

    fn pose_line(elbow_confidence: f32) -> String {
        let mut keypoints = vec![serde_json::json!({"x": 0.0, "y": 0.0, "confidence": 0.0}); 17];
        keypoints[5] = serde_json::json!({"x": 0.0, "y": 0.0, "confidence": 0.9});
        keypoints[7] = serde_json::json!({"x": 2.0, "y": 0.0, "confidence": elbow_confidence});
        keypoints[9] = serde_json::json!({"x": 2.0, "y": 0.0, "confidence": 0.9});
        serde_json::json!({
            "Pose": {
                "pose": {"keypoints": keypoints},
                "image_shape": {"rows": 2, "cols": 4}
            }
        })
        .to_string()
    }

    fn session() -> String {
        [
            pose_line(0.9),
            r#"{"RangeImage":{"timestamp":"2024-05-01T12:00:00Z","ranges":{"rows":2,"cols":4,"data":[250,250,250,250,500,500,500,500]}}}"#.to_string(),
            r#"{"PointCloud":{"timestamp":"2024-05-01T12:00:01Z","frame_id":"os_lidar"}}"#.to_string(),
            pose_line(0.9),
            pose_line(0.3),
        ]
        .join("\n")
    }

    fn config() -> Config {
        let mut cfg = Config::default();
        cfg.pipeline.mask_radius = 0;
        cfg
    }

    fn write_inputs(dir: &tempfile::TempDir) -> ReplayRequest {
        let metadata = dir.path().join("metadata.json");
        let session_path = dir.path().join("session.jsonl");
        std::fs::write(&metadata, METADATA).expect("write metadata");
        std::fs::write(&session_path, session()).expect("write session");
        ReplayRequest {
            metadata: Some(metadata),
            session: session_path,
        }
    }

    #[tokio::test]
    async fn replay_writes_one_line_per_emitted_set() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let request = write_inputs(&dir);
        let mut out = Vec::new();

        let report = run(&config(), &request, &mut out, std::future::pending()).await?;

        assert_eq!(report.replayed, 6);
        assert_eq!(report.written, 1);
        let stats = report.node.stats;
        assert_eq!(stats.poses, 3);
        assert_eq!(stats.skipped_missing, 1);
        assert_eq!(stats.skipped_insufficient, 1);

        let text = String::from_utf8(out)?;
        let set: FilteredPointSet = serde_json::from_str(text.trim())?;
        assert_eq!(set.frame_id, "os_sensor");
        assert_eq!(set.timestamp.to_rfc3339(), "2024-05-01T12:00:01+00:00");
        // Three masked pixels on row 0; 250 counts × 4 × 1 mm = 1 m.
        assert_eq!(set.points.len(), 3);
        assert!(set.points.iter().all(|p| (p.z - 1.0).abs() < 1e-4));
        Ok(())
    }

    #[tokio::test]
    async fn replay_without_metadata_emits_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let mut request = write_inputs(&dir);
        request.metadata = None;
        let mut out = Vec::new();

        let report = run(&config(), &request, &mut out, std::future::pending()).await?;

        assert_eq!(report.written, 0);
        assert_eq!(report.node.stats.skipped_not_ready, 1);
        assert!(out.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn interrupted_replay_publishes_nothing_more() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let request = write_inputs(&dir);
        let mut out = Vec::new();

        let report = run(&config(), &request, &mut out, std::future::ready(())).await?;

        assert_eq!(report.replayed, 0);
        assert_eq!(report.written, 0);
        Ok(())
    }

    #[tokio::test]
    async fn missing_session_is_reported() {
        let request = ReplayRequest {
            metadata: None,
            session: PathBuf::from("/nonexistent/session.jsonl"),
        };
        let err = run(&config(), &request, &mut Vec::<u8>::new(), std::future::pending())
            .await
            .unwrap_err();
        assert!(err.contains("Failed to read session"));
    }
}
