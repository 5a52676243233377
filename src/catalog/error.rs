//! Error types for catalog appends

use thiserror::Error;

/// Errors that can occur while appending to a catalog-managed table
#[derive(Debug, Error)]
pub enum AppendError {
    /// The catalog could not be built or reached
    #[error("catalog load failed: {0}")]
    CatalogLoad(String),

    /// The target table could not be loaded (missing, denied, unavailable)
    #[error("table load failed: {0}")]
    TableLoad(String),

    /// The target table uses a layout this job does not write
    #[error("unsupported table layout: {0}")]
    Unsupported(String),

    /// Extracted batches do not match the table's current schema
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Converting batches between Arrow versions failed
    #[error("arrow conversion failed: {0}")]
    Conversion(String),

    /// Writing data files failed
    #[error("data file write failed: {0}")]
    Write(String),

    /// Stopped before the commit started; the table is unchanged
    #[error("append aborted before commit")]
    Aborted,

    /// The snapshot commit was rejected or failed
    #[error("commit failed: {0}")]
    Commit(String),
}
