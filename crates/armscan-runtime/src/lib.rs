//! `armscan-runtime` – process-level plumbing around the fusion pipeline.
//!
//! # Modules
//!
//! - [`node`] – [`FusionNode`][node::FusionNode]: subscribes to the sensor
//!   lane of the [`EventBus`][armscan_middleware::EventBus], feeds every
//!   event to a shared [`FusionPipeline`][armscan_perception::FusionPipeline]
//!   and publishes the extracted arm points.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export
//!   to Jaeger, Grafana Tempo, or any OTLP-compatible collector.

pub mod node;
pub mod telemetry;

pub use node::{FusionNode, NodeSummary};
pub use telemetry::{init_tracing, TracerProviderGuard};
