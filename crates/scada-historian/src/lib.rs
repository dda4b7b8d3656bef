//! ---
//! scada_section: "03-persistence-metrics"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Historian schema rows, sinks, and the batching writer."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Buffered, retrying delivery of telemetry and audit/security rows to the
//! external time-series historian.

pub mod rows;
pub mod sink;
pub mod writer;

/// Shared result type for historian operations.
pub type Result<T> = std::result::Result<T, HistorianError>;

/// Errors raised by historian components.
#[derive(Debug, thiserror::Error)]
pub enum HistorianError {
    /// Underlying sink I/O failure.
    #[error("sink io error: {0}")]
    Io(#[from] std::io::Error),
    /// Row serialization failure.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// The writer task has shut down.
    #[error("historian writer closed")]
    Closed,
}

pub use rows::{
    AlarmRow, AuditRow, GridMetricsRow, HistorianRow, SecurityEventRow, TelemetryRow,
};
pub use sink::{HistorianSink, NdjsonSink};
pub use writer::{spawn_writer, HistorianHandle, WriterConfig, WriterStats};
