// Library root module for request-metrics
// Prometheus request metrics for axum applications: default per-request
// series, route-level tracking layers and the metrics endpoint.
//
// Numan Thabit 2025 Nov

pub mod config;
pub mod defaults;
pub mod errors;
pub mod exporter;
pub mod exposition;
pub mod labels;
pub mod metrics;
pub mod multiprocess;
pub mod request;
pub mod server;
pub mod summary;
pub mod track;

pub use config::{ExporterSettings, GroupBy, MetricsOptions, Prefix, RuntimeEnv, NO_PREFIX};
pub use errors::{ExporterError, Result};
pub use exporter::MetricsExporter;
pub use labels::{LabelValue, Labels, Outcome};
pub use metrics::MetricKind;
pub use request::{current_request, RequestInfo};
pub use track::{TrackLayer, Tracker};
