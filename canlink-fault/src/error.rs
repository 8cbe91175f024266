//! Error types for the fault detector

use thiserror::Error;

/// Result type alias for fault detector operations
pub type Result<T> = std::result::Result<T, FaultError>;

/// Fault detector errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FaultError {
    /// Model asked to score before a successful fit
    #[error("Model is not fitted")]
    NotFitted,

    /// No training row carried every configured feature
    #[error("No training row contains all of: {features:?}")]
    NoValidRows { features: Vec<String> },

    /// Too few rows to fit
    #[error("Need at least {needed} rows to fit, got {got}")]
    InsufficientData { needed: usize, got: usize },

    /// Row width differs from the fitted dimensionality
    #[error("Expected {expected} features, got {got}")]
    FeatureCountMismatch { expected: usize, got: usize },

    /// Saved model does not match the configured features
    #[error("Saved model features {saved:?} do not match configured {configured:?}")]
    FeatureSetMismatch {
        saved: Vec<String>,
        configured: Vec<String>,
    },

    /// Saved model was written in another snapshot format
    #[error("Saved model format version {saved} is not supported (expected {supported})")]
    VersionMismatch { saved: u32, supported: u32 },

    /// Reading or writing a model snapshot failed
    #[error("Model persistence failed: {0}")]
    Persistence(String),
}

impl From<std::io::Error> for FaultError {
    fn from(err: std::io::Error) -> Self {
        FaultError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for FaultError {
    fn from(err: serde_json::Error) -> Self {
        FaultError::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FaultError::NoValidRows {
            features: vec!["Engine_RPM".to_string()],
        };
        assert!(err.to_string().contains("Engine_RPM"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: FaultError = io.into();
        assert!(matches!(err, FaultError::Persistence(_)));
    }
}
