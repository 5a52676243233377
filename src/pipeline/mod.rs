//! One invocation: resolve the partition, extract it, append it.

mod outcome;

pub use outcome::{InvocationEvent, RunOutcome, RunStatus, NO_DATA_MESSAGE, SUCCESS_MESSAGE};

use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::catalog::{
    AppendError, AppendSummary, CatalogAppender, CatalogDescriptor, IcebergAppender, TableName,
};
use crate::config::AppConfig;
use crate::credentials::{CredentialError, CredentialProvider};
use crate::ingest::{
    AccumulatedTable, DuckDbSessionFactory, EngineSettings, Extraction, IngestError, QueryTemplate, SessionFactory,
    WarmEngine,
};
use crate::partition::{resolve_partition, PartitionError, PartitionKey, SourceLocation};

/// Pipeline stage, used to name where a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Credentials,
    Ingest,
    Append,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Credentials => f.write_str("credential refresh"),
            Stage::Ingest => f.write_str("ingest"),
            Stage::Append => f.write_str("append"),
        }
    }
}

/// Why a single invocation failed. Rendered into the failure outcome.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Append(#[from] AppendError),

    #[error("{0} cancelled")]
    Cancelled(Stage),

    #[error("{0} timed out")]
    TimedOut(Stage),
}

/// Failures that prevent the process from serving any invocation.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("query template: {0}")]
    Template(IngestError),

    #[error("warm engine: {0}")]
    Engine(IngestError),

    #[error("catalog: {0}")]
    Catalog(AppendError),
}

/// Per-run inputs that come from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub source_bucket: String,
    pub source_prefix: String,
    pub path_template: String,
    pub default_target_date: Option<String>,
    pub validate_partition_date: bool,
    pub timeout: Option<Duration>,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            source_bucket: config.source_bucket.clone(),
            source_prefix: config.source_prefix.clone(),
            path_template: config.ingest.path_template.clone(),
            default_target_date: config.default_target_date.clone(),
            validate_partition_date: config.ingest.validate_partition_date,
            timeout: config.ingest.timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn location(&self, key: &PartitionKey) -> SourceLocation {
        SourceLocation::render(&self.path_template, &self.source_bucket, &self.source_prefix, key)
    }
}

/// Runs invocations against injected credential, ingest and catalog components.
///
/// The orchestrator holds no per-run state; a warm process reuses one instance
/// for every invocation.
#[derive(Debug)]
pub struct PipelineOrchestrator {
    credentials: Arc<dyn CredentialProvider>,
    sessions: Arc<dyn SessionFactory>,
    appender: Arc<dyn CatalogAppender>,
    settings: PipelineSettings,
}

impl PipelineOrchestrator {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        sessions: Arc<dyn SessionFactory>,
        appender: Arc<dyn CatalogAppender>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            credentials,
            sessions,
            appender,
            settings,
        }
    }

    /// Wire the production components: warm DuckDB engine, DuckDB sessions and
    /// the Iceberg appender for the configured catalog.
    pub async fn from_config(config: &AppConfig) -> Result<Self, StartupError> {
        config
            .validate()
            .map_err(|e| StartupError::Config(e.to_string()))?;

        let template = match &config.ingest.query_path {
            Some(path) => QueryTemplate::from_file(path).map_err(StartupError::Template)?,
            None => QueryTemplate::embedded().map_err(StartupError::Template)?,
        };

        let engine_settings = Arc::new(EngineSettings::from_config(config));
        let warm_settings = engine_settings.clone();
        let engine = tokio::task::spawn_blocking(move || WarmEngine::start(warm_settings))
            .await
            .map_err(|e| StartupError::Engine(e.into()))?
            .map_err(StartupError::Engine)?;

        let descriptor = CatalogDescriptor::from_config(config).map_err(StartupError::Catalog)?;
        let table = TableName::new(config.glue_database.clone(), config.glue_table.clone());
        let appender =
            IcebergAppender::new(descriptor, table, config.append.target_file_size_bytes);

        Ok(Self::new(
            Arc::new(engine),
            Arc::new(DuckDbSessionFactory::new(engine_settings, template)),
            Arc::new(appender),
            PipelineSettings::from_config(config),
        ))
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn target(&self) -> &TableName {
        self.appender.target()
    }

    /// Run one invocation. Never fails: every error becomes a failure outcome.
    pub async fn run(&self, event: InvocationEvent, cancel: CancellationToken) -> RunOutcome {
        self.run_at(event, cancel, Utc::now()).await
    }

    /// Like [`run`](Self::run) with an explicit clock for the default partition.
    pub async fn run_at(
        &self,
        event: InvocationEvent,
        cancel: CancellationToken,
        now: DateTime<Utc>,
    ) -> RunOutcome {
        let target_table = self.appender.target().to_string();
        let key = resolve_partition(
            event.target_date.as_deref(),
            self.settings.default_target_date.as_deref(),
            now,
        );

        let span = info_span!(
            "pipeline_run",
            iceload.partition_date = %key,
            iceload.table = %target_table,
        );

        match self.execute(&key, &cancel).instrument(span).await {
            Ok(rows) => {
                info!(rows, partition_date = %key, table = %target_table, "Run succeeded");
                RunOutcome::success(rows, key.as_str(), &target_table)
            }
            Err(e) => {
                error!(error = %e, partition_date = %key, table = %target_table, "Run failed");
                RunOutcome::failure(e.to_string(), Some(key.as_str()), &target_table)
            }
        }
    }

    async fn execute(&self, key: &PartitionKey, cancel: &CancellationToken) -> Result<usize, PipelineError> {
        let deadline = self.settings.timeout.map(|t| Instant::now() + t);

        if self.settings.validate_partition_date {
            key.validate()?;
        }

        guarded(Stage::Credentials, cancel, deadline, async {
            self.credentials.refresh().await.map_err(PipelineError::from)
        })
        .await?;

        let location = self.settings.location(key);
        info!(source_path = %location, "Extracting partition");

        let extraction = guarded(Stage::Ingest, cancel, deadline, async {
            self.sessions
                .extract(&location, cancel)
                .await
                .map_err(|e| match e {
                    IngestError::Cancelled => PipelineError::Cancelled(Stage::Ingest),
                    e => PipelineError::from(e),
                })
        })
        .await?;

        let table = match extraction {
            Extraction::NoData => {
                info!(source_path = %location, "No data for partition; catalog untouched");
                return Ok(0);
            }
            Extraction::Rows(table) => table,
        };

        let rows = table.num_rows();
        let summary = self.append(&table, cancel, deadline).await?;
        drop(table);

        info!(
            rows,
            data_files = summary.data_files,
            snapshot_id = ?summary.snapshot_id,
            "Partition appended"
        );

        Ok(rows)
    }

    /// The append is not raced: cancellation and the deadline only abort it
    /// before its commit starts.
    async fn append(
        &self,
        table: &AccumulatedTable,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<AppendSummary, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(Stage::Append));
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(PipelineError::TimedOut(Stage::Append));
        }

        let abort = cancel.child_token();
        let timer = deadline.map(|deadline| {
            let abort = abort.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                abort.cancel();
            })
        });

        let result = self.appender.append(table, &abort).await;
        if let Some(timer) = timer {
            timer.abort();
        }

        result.map_err(|e| match e {
            AppendError::Aborted if cancel.is_cancelled() => PipelineError::Cancelled(Stage::Append),
            AppendError::Aborted => PipelineError::TimedOut(Stage::Append),
            e => PipelineError::from(e),
        })
    }
}

/// Race a stage against cancellation and the invocation deadline.
///
/// Losing the race drops the stage future, which releases everything it holds.
async fn guarded<T>(
    stage: Stage,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    fut: impl Future<Output = Result<T, PipelineError>>,
) -> Result<T, PipelineError> {
    let expired = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled(stage)),
        _ = expired => Err(PipelineError::TimedOut(stage)),
        result = fut => result,
    }
}
