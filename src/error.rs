//! Error types for CANLink
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for CANLink operations
pub type Result<T> = std::result::Result<T, CanLinkError>;

/// Main error type for CANLink operations
#[derive(Error, Debug)]
pub enum CanLinkError {
    /// Decoding error
    #[error("Decoding error: {0}")]
    Decode(#[from] DecodeError),

    /// Delivery error
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Fault detector error
    #[error("Fault detector error: {0}")]
    Fault(#[from] canlink_fault::FaultError),

    /// Diagnostic request/response failure
    #[error("Diagnostic service error: {0}")]
    Diagnostic(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Errors while loading signal descriptions or decoding payloads
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Signal database could not be parsed
    #[error("Invalid signal database: {0}")]
    InvalidDatabase(String),

    /// Signal layout does not fit the frame payload
    #[error("Signal {signal} needs bits {start}..{end}, payload has {available}")]
    SignalOutOfRange {
        signal: String,
        start: u32,
        end: u32,
        available: usize,
    },

    /// Malformed trouble-code response
    #[error("Malformed DTC response: {0}")]
    MalformedDtc(String),
}

/// Errors from the store-and-forward delivery layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    /// Durable queue storage failed. Fatal to the delivery guarantee.
    #[error("Durable queue storage failure: {0}")]
    Storage(String),

    /// Record could not be serialized
    #[error("Serialization failed: {0}")]
    Serialize(String),

    /// Publisher refused to send while the link is down
    #[error("Disconnected: {reason}")]
    Disconnected { reason: String },

    /// Transport-level send failure
    #[error("Publish failed: {reason}")]
    PublishFailed { reason: String },

    /// Send did not complete within the timeout
    #[error("Publish timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl DeliveryError {
    /// Errors that degrade to buffering rather than propagate
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Disconnected { .. } | Self::PublishFailed { .. } | Self::Timeout { .. }
        )
    }
}

impl From<rusqlite::Error> for DeliveryError {
    fn from(err: rusqlite::Error) -> Self {
        DeliveryError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::Serialize(err.to_string())
    }
}
