// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-steer.

/// Errors that can occur while building, applying or sweeping steering
/// interventions.
#[derive(Debug, thiserror::Error)]
pub enum SteerError {
    /// Forward pass or tensor operation error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Hook installation or application error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Invalid sweep, descriptor or sampling configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Metric function error (e.g. wrong number of scored rows).
    #[error("metric error: {0}")]
    Metric(String),

    /// Result table shape or column error.
    #[error("table error: {0}")]
    Table(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type alias for candle-steer operations.
pub type Result<T> = std::result::Result<T, SteerError>;
