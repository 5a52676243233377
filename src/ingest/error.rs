//! Error types for extraction from object storage

use thiserror::Error;

/// Errors that can occur while extracting a partition through DuckDB
#[derive(Debug, Error)]
pub enum IngestError {
    /// Failed to open the DuckDB connection
    #[error("connection failed: {0}")]
    Connection(String),

    /// Session setup failed (settings, extension install, secret)
    #[error("session setup failed: {0}")]
    Setup(String),

    /// Query preparation or execution failed
    #[error("query failed: {0}")]
    Query(String),

    /// Reading the result stream failed after it started
    #[error("result stream failed: {0}")]
    Stream(String),

    /// The extraction query template is malformed or unreadable
    #[error("invalid query template: {0}")]
    Template(String),

    /// The invocation was cancelled while extraction was running
    #[error("extraction cancelled")]
    Cancelled,
}

impl From<std::io::Error> for IngestError {
    fn from(e: std::io::Error) -> Self {
        IngestError::Setup(e.to_string())
    }
}

impl From<tokio::task::JoinError> for IngestError {
    fn from(e: tokio::task::JoinError) -> Self {
        IngestError::Stream(e.to_string())
    }
}
