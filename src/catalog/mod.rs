//! Catalog-managed target tables.

mod appender;
mod descriptor;
mod error;
mod writer;

pub use descriptor::{CatalogDescriptor, CatalogKind, TableName};
pub use error::AppendError;
pub use appender::IcebergAppender;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::ingest::AccumulatedTable;

/// What a successful append produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppendSummary {
    pub rows: usize,
    pub data_files: usize,
    pub snapshot_id: Option<i64>,
}

/// Appends a fully accumulated result to a target table.
///
/// An append either commits exactly one new snapshot containing every row, or
/// fails and leaves the table unchanged.
#[async_trait]
pub trait CatalogAppender: Send + Sync + std::fmt::Debug {
    fn target(&self) -> &TableName;

    /// `abort` is honoured until the commit starts, with [`AppendError::Aborted`].
    /// A commit in flight always runs to completion.
    async fn append(
        &self,
        data: &AccumulatedTable,
        abort: &CancellationToken,
    ) -> Result<AppendSummary, AppendError>;
}
