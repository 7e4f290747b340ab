//! Error types for osu-dreamer-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration, detected at construction time.
    #[error("config: {0}")]
    Config(String),

    /// Inputs whose channel counts or lengths disagree.
    #[error("shape: {0}")]
    Shape(String),

    /// Argument outside its domain (e.g. zero sampling steps).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
