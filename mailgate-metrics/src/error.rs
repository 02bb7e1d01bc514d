//! Error types for metrics operations

use thiserror::Error;

/// Errors that can occur during metrics operations
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The OTLP exporter could not be built
    #[error("OpenTelemetry error: {0}")]
    OpenTelemetry(String),

    /// Flushing or stopping the meter provider failed
    #[error("Failed to shut down metrics: {0}")]
    Shutdown(String),
}
