// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-tuner.

/// Errors that can occur while grouping, scaling, restoring, or saving weights.
#[derive(Debug, thiserror::Error)]
pub enum TuneError {
    /// A group id that the active grouping table does not define.
    #[error("unknown group `{group}` for {architecture} ({granularity} grouping)")]
    UnknownGroup {
        /// Architecture tag of the table that was searched.
        architecture: String,
        /// Granularity of the table that was searched.
        granularity: String,
        /// The offending group id.
        group: String,
    },

    /// Unrecognized slider mapping mode.
    #[error("invalid scale mode: {0}")]
    InvalidMode(String),

    /// An injection was attempted on a dictionary or session that still
    /// carries an unrestored mutation.
    #[error("session already dirty: {0}")]
    SessionAlreadyDirty(String),

    /// Tensor operation error (wraps candle).
    #[error("tensor error: {0}")]
    Model(#[from] candle_core::Error),

    /// Grouping table, preset, or enum parsing error.
    #[error("config error: {0}")]
    Config(String),

    /// A matched tensor could not be scaled or restored.
    #[error("injection error: {0}")]
    Injection(String),

    /// Checkpoint encoding error (unsupported dtype, malformed header, ...).
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-tuner operations.
pub type Result<T> = std::result::Result<T, TuneError>;
