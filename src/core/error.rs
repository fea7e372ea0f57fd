//! Error handling - Hierarchical errors for the engine
//!
//! Recoverable conditions (bad book deltas, risk rejections, exchange
//! rejections) have their own module-local error types and never reach this
//! enum. Everything here terminates the engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown option passed through the option mapping
    #[error("Unknown configuration option: {0}")]
    UnknownOption(String),

    /// Option value that failed to parse
    #[error("Invalid value for {option}: {value}")]
    InvalidOption { option: String, value: String },

    /// Strategy kind not present in the registry
    #[error("Unknown strategy kind: {0}")]
    UnknownStrategy(String),

    /// Market-data source gave up after its own reconnect attempts
    #[error("Market data feed failed: {0}")]
    FeedFailed(String),

    /// Market-data channel closed while the engine was trading
    #[error("Market data channel closed")]
    FeedClosed,

    /// Execution client transport errors
    #[error("Execution error: {0}")]
    Execution(String),

    /// Execution event channel closed while orders could still change
    #[error("Execution event channel closed")]
    ExecutionClosed,

    /// Internal invariant violated; continuing would risk the exposure guarantee
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
