// Error types for the request-metrics exporter
// Setup-time configuration problems, registry failures passed through
// unchanged, and the I/O surfaces of the multiprocess store and server.
//
// Numan Thabit 2025 Nov

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExporterError {
    /// Invalid label spec, conflicting `info()` arguments or bad settings.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Duplicate names, invalid buckets, cardinality mismatches.
    #[error(transparent)]
    Registry(#[from] prometheus::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding error: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("settings error: {0}")]
    Settings(#[from] config::ConfigError),
}

impl ExporterError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        ExporterError::Configuration(msg.into())
    }
}

pub type Result<T, E = ExporterError> = std::result::Result<T, E>;
