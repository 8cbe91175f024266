//! Error types for the agent binary

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Empty log")]
    EmptyLog,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] canlink::CanLinkError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<AgentError> for canlink::CanLinkError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Pipeline(inner) => inner,
            other => canlink::CanLinkError::Config(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_error_round_trip() {
        let err: AgentError = canlink::CanLinkError::Config("missing".to_string()).into();
        assert!(err.to_string().contains("missing"));
        let back: canlink::CanLinkError = err.into();
        assert!(matches!(back, canlink::CanLinkError::Config(_)));
    }

    #[test]
    fn test_parser_errors_map_to_config() {
        let err: canlink::CanLinkError = AgentError::EmptyLog.into();
        assert!(err.to_string().contains("Empty log"));
    }
}
