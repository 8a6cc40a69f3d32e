//! Crate-level error types for `subtrace-tracing`.
//!
//! Provides a unified [`TraceError`] covering identifier parsing, the
//! subtrace table, and span export. Pipeline hot-path code (span start)
//! never surfaces these to callers; they exist so that failure modes are
//! explicit values rather than silently impossible states.

use thiserror::Error;

/// Crate-level error type for `subtrace-tracing`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TraceError {
    /// A trace/span/subtrace id could not be parsed from hex.
    #[error("invalid {what} hex string: expected {expected} characters")]
    InvalidId {
        /// Which identifier kind was being parsed.
        what: &'static str,
        /// Expected number of hex characters.
        expected: usize,
    },

    /// A hex string contained non-hex characters.
    #[error("malformed hex: {0}")]
    MalformedHex(#[from] hex::FromHexError),

    /// The subtrace table refused a new trace id because it is at capacity.
    #[error("subtrace table at capacity ({0} traces)")]
    SubtraceTableFull(usize),

    /// A span batch could not be delivered to its destination.
    #[error("export failed: {0}")]
    Export(String),

    /// The export destination answered with a non-success HTTP status.
    #[error("export endpoint returned status {0}")]
    ExportStatus(u16),
}

/// Convenience result alias for tracing operations.
pub type TraceResult<T> = Result<T, TraceError>;
