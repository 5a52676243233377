//! Per-invocation DuckDB sessions that stream Arrow batches out of object storage.

use async_trait::async_trait;
use datafusion::arrow::record_batch::RecordBatch;
use duckdb::{Connection, InterruptHandle};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::engine::{apply_statements, quote_literal, EngineSettings};
use super::{BatchAccumulator, Extraction, IngestError, QueryTemplate};
use crate::partition::SourceLocation;

/// Batches buffered between the DuckDB worker and the accumulator.
const DEFAULT_CHANNEL_CAPACITY: usize = 4;

/// Opens an isolated session per extraction.
#[async_trait]
pub trait SessionFactory: Send + Sync + std::fmt::Debug {
    /// Extract every row matching `location`.
    ///
    /// Returns `Extraction::NoData` when nothing matched. The session and all
    /// of its resources are released before this returns.
    async fn extract(
        &self,
        location: &SourceLocation,
        cancel: &CancellationToken,
    ) -> Result<Extraction, IngestError>;
}

/// DuckDB-backed session factory.
#[derive(Debug, Clone)]
pub struct DuckDbSessionFactory {
    settings: Arc<EngineSettings>,
    template: QueryTemplate,
    channel_capacity: usize,
}

impl DuckDbSessionFactory {
    pub fn new(settings: Arc<EngineSettings>, template: QueryTemplate) -> Self {
        Self {
            settings,
            template,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Open and configure a fresh session.
    pub async fn open_session(&self) -> Result<DuckDbSession, IngestError> {
        let settings = self.settings.clone();
        tokio::task::spawn_blocking(move || DuckDbSession::open(&settings))
            .await
            .map_err(|e| IngestError::Connection(e.to_string()))?
    }
}

#[async_trait]
impl SessionFactory for DuckDbSessionFactory {
    #[tracing::instrument(
        name = "extract_partition",
        skip(self, location, cancel),
        fields(iceload.source_path = %location)
    )]
    async fn extract(
        &self,
        location: &SourceLocation,
        cancel: &CancellationToken,
    ) -> Result<Extraction, IngestError> {
        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            session = self.open_session() => session?,
        };

        session
            .extract(location, &self.template, self.channel_capacity, cancel)
            .await
    }
}

/// One isolated DuckDB connection with its own spill directory.
///
/// Dropping the session closes the connection and removes the directory.
pub struct DuckDbSession {
    conn: Connection,
    interrupt: Arc<InterruptHandle>,
    swap_dir: TempDir,
}

impl std::fmt::Debug for DuckDbSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbSession")
            .field("swap_dir", &self.swap_dir.path())
            .finish_non_exhaustive()
    }
}

impl DuckDbSession {
    /// Blocking: opens the connection and applies settings, extensions and secret.
    pub fn open(settings: &EngineSettings) -> Result<Self, IngestError> {
        std::fs::create_dir_all(&settings.temp_directory)?;
        let swap_dir = tempfile::Builder::new()
            .prefix("session-")
            .tempdir_in(&settings.temp_directory)?;

        let conn = Connection::open_in_memory()
            .map_err(|e| IngestError::Connection(e.to_string()))?;

        apply_statements(&conn, &settings.base_statements()?)?;
        apply_statements(&conn, &settings.tuning_statements(swap_dir.path()))?;
        if let Some(secret) = settings.secret_statement() {
            apply_statements(&conn, &[secret])?;
        }

        let interrupt = conn.interrupt_handle();

        debug!(swap_dir = %swap_dir.path().display(), "DuckDB session opened");

        Ok(Self {
            conn,
            interrupt,
            swap_dir,
        })
    }

    pub fn swap_dir(&self) -> &Path {
        self.swap_dir.path()
    }

    /// Run the extraction query and collect its batches. Consumes the session.
    pub async fn extract(
        self,
        location: &SourceLocation,
        template: &QueryTemplate,
        channel_capacity: usize,
        cancel: &CancellationToken,
    ) -> Result<Extraction, IngestError> {
        let mut guard = InterruptGuard::new(self.interrupt.clone());
        let glob = location.as_str().to_string();
        let sql = template.render(location.as_str());

        let (tx, rx) = mpsc::channel(channel_capacity);
        let worker = tokio::task::spawn_blocking(move || self.stream_to_channel(&glob, &sql, tx));

        let result = drain(rx, worker, cancel).await;
        if !matches!(result, Err(IngestError::Cancelled)) {
            guard.disarm();
        }

        if let Ok(extraction) = &result {
            info!(
                rows = extraction.num_rows(),
                source_path = %location,
                "Extraction finished"
            );
        }

        result
    }

    fn count_matches(&self, glob: &str) -> Result<i64, IngestError> {
        let sql = format!("SELECT count(*) FROM glob({})", quote_literal(glob));
        self.conn
            .query_row(&sql, [], |row| row.get::<_, i64>(0))
            .map_err(|e| IngestError::Query(e.to_string()))
    }

    fn stream_to_channel(
        self,
        glob: &str,
        sql: &str,
        tx: mpsc::Sender<RecordBatch>,
    ) -> Result<StreamSummary, IngestError> {
        let matched_files = self.count_matches(glob)?;
        if matched_files == 0 {
            debug!(source_path = %glob, "No files match source glob");
            return Ok(StreamSummary::default());
        }

        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| IngestError::Query(e.to_string()))?;

        // Streaming execution: chunks are produced as they are pulled, so only
        // the channel's worth of batches is in flight. A failure while
        // fetching surfaces from `step`.
        let _ = stmt
            .stream_arrow([])
            .map_err(|e| IngestError::Query(e.to_string()))?;

        let mut batches = 0;
        while let Some(chunk) = stmt
            .step()
            .map_err(|e| IngestError::Stream(format!("after {} batches: {}", batches, e)))?
        {
            if tx.blocking_send(RecordBatch::from(&chunk)).is_err() {
                break; // Receiver dropped
            }
            batches += 1;
        }

        Ok(StreamSummary {
            matched_files,
            batches,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StreamSummary {
    pub matched_files: i64,
    pub batches: usize,
}

/// Interrupts the running query unless disarmed.
struct InterruptGuard {
    handle: Arc<InterruptHandle>,
    armed: bool,
}

impl InterruptGuard {
    fn new(handle: Arc<InterruptHandle>) -> Self {
        Self {
            handle,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!("Interrupting DuckDB query");
            self.handle.interrupt();
        }
    }
}

/// Move batches from the worker into an accumulator until the worker finishes.
///
/// On any error the accumulator is dropped before returning, releasing every
/// batch received so far.
pub(crate) async fn drain(
    mut rx: mpsc::Receiver<RecordBatch>,
    worker: JoinHandle<Result<StreamSummary, IngestError>>,
    cancel: &CancellationToken,
) -> Result<Extraction, IngestError> {
    let mut acc = BatchAccumulator::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            msg = rx.recv() => match msg {
                Some(batch) => acc.push(batch),
                None => break,
            },
        }
    }

    let summary = worker.await??;
    debug!(
        matched_files = summary.matched_files,
        batches = summary.batches,
        rows = acc.num_rows(),
        "Result stream drained"
    );

    Ok(acc.finish())
}
