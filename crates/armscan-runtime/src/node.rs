//! [`FusionNode`] – event-driven host for the [`FusionPipeline`].
//!
//! The node subscribes to the [`Topic::Sensors`] lane at construction time,
//! dispatches every inbound event to the matching pipeline ingestion method
//! and publishes each extracted arm point set to [`Topic::FilteredPoints`].
//!
//! Because all sensor streams share one lane, events are handled in exactly
//! the order they were published; a pose therefore always sees every range
//! image and point-cloud header that preceded it.
//!
//! # Metadata wait
//!
//! Until a valid calibration arrives the node keeps consuming traffic (poses
//! are skipped as not ready).  If none has arrived after the configured
//! metadata timeout a single warning is logged; the node keeps waiting.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use armscan_middleware::EventBus;
//! use armscan_perception::{FusionPipeline, PipelineConfig};
//! use armscan_runtime::node::FusionNode;
//!
//! # async fn demo() {
//! let bus = EventBus::default();
//! let pipeline = Arc::new(FusionPipeline::new(PipelineConfig::default()));
//! let node = FusionNode::new(pipeline, bus.clone(), Duration::from_secs(30));
//! let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
//! let handle = tokio::spawn(node.run(stop_rx));
//! // ... publish sensor events on `bus` ...
//! let _ = stop_tx.send(true);
//! let summary = handle.await.expect("node task panicked");
//! println!("{} point sets published", summary.published);
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use armscan_middleware::{EventBus, Topic, TopicReceiver};
use armscan_perception::pipeline::{CycleOutcome, FusionPipeline, PipelineStats};
use armscan_types::{Event, EventPayload, FilteredPointSet};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// `source` tag stamped on every event the node publishes.
pub const NODE_SOURCE: &str = "armscan::fusion_node";

/// Default time to wait for sensor metadata before warning.
pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────────────────────────────────────
// Summary
// ─────────────────────────────────────────────────────────────────────────────

/// What a node did over its lifetime; returned by [`FusionNode::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeSummary {
    pub stats: PipelineStats,
    /// Point sets handed to at least one subscriber.
    pub published: u64,
    /// Metadata documents that failed to parse or validate.
    pub metadata_errors: u64,
    /// Sensor events lost because the node fell behind the bus.
    pub lagged: u64,
    /// `true` if the metadata timeout elapsed before a calibration arrived.
    pub metadata_timed_out: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// FusionNode
// ─────────────────────────────────────────────────────────────────────────────

pub struct FusionNode {
    pipeline: Arc<FusionPipeline>,
    bus: EventBus,
    sensors: TopicReceiver,
    metadata_timeout: Duration,
    published: u64,
    metadata_errors: u64,
    lagged: u64,
}

impl FusionNode {
    /// Build a node and subscribe it to the sensor lane immediately, so every
    /// event published after this call is observed.
    pub fn new(pipeline: Arc<FusionPipeline>, bus: EventBus, metadata_timeout: Duration) -> Self {
        let sensors = bus.subscribe_to(Topic::Sensors);
        Self {
            pipeline,
            bus,
            sensors,
            metadata_timeout,
            published: 0,
            metadata_errors: 0,
            lagged: 0,
        }
    }

    pub fn pipeline(&self) -> &Arc<FusionPipeline> {
        &self.pipeline
    }

    /// Route one event to the pipeline.
    ///
    /// Returns the extracted point set when the event was a pose that
    /// produced one.  Publishing is left to the caller.
    pub fn handle_event(&mut self, event: Event) -> Option<FilteredPointSet> {
        debug!(source = %event.source, id = %event.id, "sensor event");
        match event.payload {
            EventPayload::Metadata(text) => {
                if self.pipeline.ingest_metadata(&text).is_err() {
                    self.metadata_errors += 1;
                }
                None
            }
            EventPayload::RangeImage(frame) => {
                self.pipeline.ingest_range_image(frame);
                None
            }
            EventPayload::PointCloud(header) => {
                self.pipeline.ingest_point_cloud(header);
                None
            }
            EventPayload::Pose(frame) => match self.pipeline.ingest_pose(&frame) {
                CycleOutcome::Emitted(set) => Some(set),
                CycleOutcome::Skipped(reason) => {
                    debug!(?reason, "pose cycle skipped");
                    None
                }
            },
            EventPayload::FilteredPoints(_) => {
                debug!("ignoring filtered points on sensor lane");
                None
            }
        }
    }

    fn publish(&mut self, set: FilteredPointSet) {
        let event = Event::new(NODE_SOURCE, EventPayload::FilteredPoints(set));
        match self.bus.publish_to(Topic::FilteredPoints, event) {
            Ok(receivers) => {
                self.published += 1;
                debug!(receivers, "published filtered points");
            }
            Err(e) => debug!(error = %e, "filtered points dropped"),
        }
    }

    /// Consume the sensor lane until `shutdown` flips to `true` (or its
    /// sender is dropped).
    ///
    /// Buffered sensor events are drained before the shutdown signal is
    /// honoured.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> NodeSummary {
        info!(
            metadata_timeout_secs = self.metadata_timeout.as_secs_f64(),
            "fusion node started"
        );
        let deadline = tokio::time::sleep(self.metadata_timeout);
        tokio::pin!(deadline);
        let mut metadata_timed_out = false;

        loop {
            tokio::select! {
                biased;

                received = self.sensors.recv() => match received {
                    Ok(event) => {
                        if let Some(set) = self.handle_event(event) {
                            self.publish(set);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lagged_by = n, "fusion node fell behind the sensor lane");
                        self.lagged += n;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                () = &mut deadline, if !metadata_timed_out && !self.pipeline.is_ready() => {
                    metadata_timed_out = true;
                    warn!(
                        timeout_secs = self.metadata_timeout.as_secs_f64(),
                        "timed out waiting for sensor metadata; still waiting"
                    );
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let summary = NodeSummary {
            stats: self.pipeline.stats(),
            published: self.published,
            metadata_errors: self.metadata_errors,
            lagged: self.lagged,
            metadata_timed_out,
        };
        info!(
            poses = summary.stats.poses,
            published = summary.published,
            "fusion node stopped"
        );
        summary
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
