//! Orchestrator tests with in-memory credential, ingest and catalog components

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use datafusion::arrow::array::{ArrayRef, Int64Array};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::arrow::record_batch::RecordBatch;
use iceload::catalog::{AppendError, AppendSummary, CatalogAppender, TableName};
use iceload::credentials::{CredentialError, CredentialProvider};
use iceload::ingest::{AccumulatedTable, BatchAccumulator, Extraction, IngestError, SessionFactory};
use iceload::partition::SourceLocation;
use iceload::pipeline::{
    InvocationEvent, PipelineOrchestrator, PipelineSettings, RunStatus, NO_DATA_MESSAGE,
    SUCCESS_MESSAGE,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct CountingCredentials {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl CredentialProvider for CountingCredentials {
    async fn refresh(&self) -> Result<(), CredentialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CredentialError::Refresh("no credentials in chain".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Source {
    /// Handed over on the first extract; later extracts see no data.
    Batches(Mutex<Option<Vec<RecordBatch>>>),
    Empty,
    Fail(String),
    Hang,
}

#[derive(Debug)]
struct MockSessions {
    source: Source,
    calls: AtomicUsize,
    locations: Mutex<Vec<String>>,
}

impl MockSessions {
    fn new(source: Source) -> Self {
        Self {
            source,
            calls: AtomicUsize::new(0),
            locations: Mutex::new(Vec::new()),
        }
    }

    fn with_batches(batches: Vec<RecordBatch>) -> Self {
        Self::new(Source::Batches(Mutex::new(Some(batches))))
    }

    fn last_location(&self) -> Option<String> {
        self.locations.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl SessionFactory for MockSessions {
    async fn extract(
        &self,
        location: &SourceLocation,
        _cancel: &CancellationToken,
    ) -> Result<Extraction, IngestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.locations
            .lock()
            .unwrap()
            .push(location.as_str().to_string());

        match &self.source {
            Source::Batches(batches) => {
                let mut acc = BatchAccumulator::new();
                for batch in batches.lock().unwrap().take().unwrap_or_default() {
                    acc.push(batch);
                }
                Ok(acc.finish())
            }
            Source::Empty => Ok(Extraction::NoData),
            Source::Fail(message) => Err(IngestError::Query(message.clone())),
            Source::Hang => {
                std::future::pending::<()>().await;
                Ok(Extraction::NoData)
            }
        }
    }
}

/// Models an append as a write phase (abortable) followed by a commit that
/// always runs to completion.
#[derive(Debug)]
struct RecordingAppender {
    table: TableName,
    fail: Option<String>,
    writing: Duration,
    committing: Duration,
    appended_rows: Mutex<Vec<usize>>,
    commits: AtomicUsize,
}

impl RecordingAppender {
    fn new() -> Self {
        Self {
            table: TableName::new("sales_dev", "processed_data_iceberg"),
            fail: None,
            writing: Duration::ZERO,
            committing: Duration::ZERO,
            appended_rows: Mutex::new(Vec::new()),
            commits: AtomicUsize::new(0),
        }
    }

    fn slow(writing: Duration, committing: Duration) -> Self {
        Self {
            writing,
            committing,
            ..Self::new()
        }
    }

    fn failing(message: &str) -> Self {
        Self {
            fail: Some(message.to_string()),
            ..Self::new()
        }
    }

    fn calls(&self) -> usize {
        self.appended_rows.lock().unwrap().len()
    }
}

#[async_trait]
impl CatalogAppender for RecordingAppender {
    fn target(&self) -> &TableName {
        &self.table
    }

    async fn append(
        &self,
        data: &AccumulatedTable,
        abort: &CancellationToken,
    ) -> Result<AppendSummary, AppendError> {
        self.appended_rows.lock().unwrap().push(data.num_rows());
        if let Some(message) = &self.fail {
            return Err(AppendError::TableLoad(message.clone()));
        }

        tokio::time::sleep(self.writing).await;
        if abort.is_cancelled() {
            return Err(AppendError::Aborted);
        }
        tokio::time::sleep(self.committing).await;
        self.commits.fetch_add(1, Ordering::SeqCst);

        Ok(AppendSummary {
            rows: data.num_rows(),
            data_files: 1,
            snapshot_id: Some(1),
        })
    }
}

fn batch(rows: usize) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new("order_id", DataType::Int64, false)]));
    let values: Vec<i64> = (0..rows as i64).collect();
    RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values)) as ArrayRef]).unwrap()
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        source_bucket: "raw-bucket".to_string(),
        source_prefix: "sales".to_string(),
        path_template: "s3://{bucket}/{prefix}/id=*/date={date}/*.csv".to_string(),
        default_target_date: None,
        validate_partition_date: false,
        timeout: None,
    }
}

struct Harness {
    credentials: Arc<CountingCredentials>,
    sessions: Arc<MockSessions>,
    appender: Arc<RecordingAppender>,
    orchestrator: PipelineOrchestrator,
}

fn harness(
    credentials: CountingCredentials,
    sessions: MockSessions,
    appender: RecordingAppender,
    settings: PipelineSettings,
) -> Harness {
    let credentials = Arc::new(credentials);
    let sessions = Arc::new(sessions);
    let appender = Arc::new(appender);
    let orchestrator = PipelineOrchestrator::new(
        credentials.clone(),
        sessions.clone(),
        appender.clone(),
        settings,
    );
    Harness {
        credentials,
        sessions,
        appender,
        orchestrator,
    }
}

#[tokio::test]
async fn test_three_batches_are_appended_once() {
    let batches = vec![batch(100), batch(100), batch(100)];
    let column = batches[0].column(0).clone();

    let h = harness(
        CountingCredentials::default(),
        MockSessions::with_batches(batches),
        RecordingAppender::new(),
        settings(),
    );

    let outcome = h
        .orchestrator
        .run(InvocationEvent::for_date("2024-03-01"), CancellationToken::new())
        .await;

    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.status_code, 200);
    assert_eq!(outcome.message, SUCCESS_MESSAGE);
    assert_eq!(outcome.rows_processed, 300);
    assert_eq!(outcome.target_date.as_deref(), Some("2024-03-01"));
    assert_eq!(outcome.target_table, "sales_dev.processed_data_iceberg");

    assert_eq!(*h.appender.appended_rows.lock().unwrap(), vec![300]);
    assert_eq!(
        h.sessions.last_location().unwrap(),
        "s3://raw-bucket/sales/id=*/date=2024-03-01/*.csv"
    );

    // The accumulated table was dropped after the append
    assert_eq!(Arc::strong_count(&column), 1);
}

#[tokio::test]
async fn test_no_data_never_touches_catalog() {
    let h = harness(
        CountingCredentials::default(),
        MockSessions::new(Source::Empty),
        RecordingAppender::new(),
        settings(),
    );

    let outcome = h
        .orchestrator
        .run(InvocationEvent::for_date("2024-03-01"), CancellationToken::new())
        .await;

    assert!(outcome.is_success());
    assert_eq!(outcome.rows_processed, 0);
    assert_eq!(outcome.message, NO_DATA_MESSAGE);
    assert_eq!(h.appender.calls(), 0);
}

#[tokio::test]
async fn test_missing_table_is_a_failure_outcome() {
    let batches = vec![batch(10)];
    let column = batches[0].column(0).clone();

    let h = harness(
        CountingCredentials::default(),
        MockSessions::with_batches(batches),
        RecordingAppender::failing("sales_dev.processed_data_iceberg: Table does not exist"),
        settings(),
    );

    let outcome = h
        .orchestrator
        .run(InvocationEvent::for_date("2024-03-01"), CancellationToken::new())
        .await;

    assert_eq!(outcome.status, RunStatus::Failure);
    assert_eq!(outcome.status_code, 500);
    assert_eq!(outcome.rows_processed, 0);
    assert!(
        outcome.message.contains("Table does not exist"),
        "message: {}",
        outcome.message
    );
    assert_eq!(h.appender.calls(), 1);
    assert_eq!(Arc::strong_count(&column), 1);
}

#[tokio::test]
async fn test_ingest_failure_skips_append() {
    let h = harness(
        CountingCredentials::default(),
        MockSessions::new(Source::Fail("HTTP 403 Forbidden".to_string())),
        RecordingAppender::new(),
        settings(),
    );

    let outcome = h
        .orchestrator
        .run(InvocationEvent::for_date("2024-03-01"), CancellationToken::new())
        .await;

    assert!(!outcome.is_success());
    assert!(outcome.message.contains("HTTP 403 Forbidden"));
    assert_eq!(h.appender.calls(), 0);
}

#[tokio::test]
async fn test_credential_failure_stops_before_ingest() {
    let h = harness(
        CountingCredentials {
            fail: true,
            ..Default::default()
        },
        MockSessions::new(Source::Empty),
        RecordingAppender::new(),
        settings(),
    );

    let outcome = h
        .orchestrator
        .run(InvocationEvent::default(), CancellationToken::new())
        .await;

    assert!(!outcome.is_success());
    assert!(outcome.message.contains("no credentials in chain"));
    assert_eq!(h.sessions.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_warm_process_refreshes_every_run() {
    let h = harness(
        CountingCredentials::default(),
        MockSessions::with_batches(vec![batch(5)]),
        RecordingAppender::new(),
        settings(),
    );

    let first = h
        .orchestrator
        .run(InvocationEvent::for_date("2024-03-01"), CancellationToken::new())
        .await;
    let second = h
        .orchestrator
        .run(InvocationEvent::for_date("2024-03-02"), CancellationToken::new())
        .await;

    assert_eq!(first.rows_processed, 5);
    // The mock hands its batches over once; the second run finds nothing
    assert_eq!(second.message, NO_DATA_MESSAGE);
    assert_eq!(h.credentials.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.sessions.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_partition_defaults() {
    let mut with_default = settings();
    with_default.default_target_date = Some("2023-12-31".to_string());

    let h = harness(
        CountingCredentials::default(),
        MockSessions::new(Source::Empty),
        RecordingAppender::new(),
        with_default,
    );
    let now = Utc.with_ymd_and_hms(2024, 3, 2, 9, 0, 0).unwrap();

    let outcome = h
        .orchestrator
        .run_at(InvocationEvent::default(), CancellationToken::new(), now)
        .await;
    assert_eq!(outcome.target_date.as_deref(), Some("2023-12-31"));

    let h = harness(
        CountingCredentials::default(),
        MockSessions::new(Source::Empty),
        RecordingAppender::new(),
        settings(),
    );
    let outcome = h
        .orchestrator
        .run_at(InvocationEvent::default(), CancellationToken::new(), now)
        .await;
    assert_eq!(outcome.target_date.as_deref(), Some("2024-03-01"));
    assert!(h
        .sessions
        .last_location()
        .unwrap()
        .contains("date=2024-03-01/"));
}

#[tokio::test]
async fn test_strict_dates_reject_malformed_input() {
    let mut strict = settings();
    strict.validate_partition_date = true;

    let h = harness(
        CountingCredentials::default(),
        MockSessions::new(Source::Empty),
        RecordingAppender::new(),
        strict,
    );

    let outcome = h
        .orchestrator
        .run(InvocationEvent::for_date("2024-02-30"), CancellationToken::new())
        .await;

    assert!(!outcome.is_success());
    assert!(outcome.message.contains("invalid partition date '2024-02-30'"));
    assert_eq!(h.sessions.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_date_passes_through_by_default() {
    let h = harness(
        CountingCredentials::default(),
        MockSessions::new(Source::Empty),
        RecordingAppender::new(),
        settings(),
    );

    let outcome = h
        .orchestrator
        .run(InvocationEvent::for_date("yesterday"), CancellationToken::new())
        .await;

    assert!(outcome.is_success());
    assert!(h
        .sessions
        .last_location()
        .unwrap()
        .contains("date=yesterday/"));
}

#[tokio::test(start_paused = true)]
async fn test_hung_ingest_times_out() {
    let mut bounded = settings();
    bounded.timeout = Some(Duration::from_secs(30));

    let h = harness(
        CountingCredentials::default(),
        MockSessions::new(Source::Hang),
        RecordingAppender::new(),
        bounded,
    );

    let outcome = h
        .orchestrator
        .run(InvocationEvent::for_date("2024-03-01"), CancellationToken::new())
        .await;

    assert!(!outcome.is_success());
    assert_eq!(outcome.message, "ingest timed out");
    assert_eq!(h.appender.calls(), 0);
}

#[tokio::test]
async fn test_cancelled_run_is_a_failure() {
    let h = harness(
        CountingCredentials::default(),
        MockSessions::new(Source::Hang),
        RecordingAppender::new(),
        settings(),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = h
        .orchestrator
        .run(InvocationEvent::for_date("2024-03-01"), cancel)
        .await;

    assert!(!outcome.is_success());
    assert_eq!(outcome.message, "ingest cancelled");
    assert_eq!(h.appender.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_commit_reports_the_commit() {
    let h = harness(
        CountingCredentials::default(),
        MockSessions::with_batches(vec![batch(10)]),
        RecordingAppender::slow(Duration::ZERO, Duration::from_secs(5)),
        settings(),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let outcome = h
        .orchestrator
        .run(InvocationEvent::for_date("2024-03-01"), cancel.clone())
        .await;

    assert!(cancel.is_cancelled());
    assert!(outcome.is_success(), "message: {}", outcome.message);
    assert_eq!(outcome.rows_processed, 10);
    assert_eq!(h.appender.commits.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_during_writes_aborts_before_commit() {
    let mut bounded = settings();
    bounded.timeout = Some(Duration::from_secs(30));

    let h = harness(
        CountingCredentials::default(),
        MockSessions::with_batches(vec![batch(10)]),
        RecordingAppender::slow(Duration::from_secs(60), Duration::ZERO),
        bounded,
    );

    let outcome = h
        .orchestrator
        .run(InvocationEvent::for_date("2024-03-01"), CancellationToken::new())
        .await;

    assert!(!outcome.is_success());
    assert_eq!(outcome.message, "append timed out");
    assert_eq!(h.appender.calls(), 1);
    assert_eq!(h.appender.commits.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_during_commit_reports_the_commit() {
    let mut bounded = settings();
    bounded.timeout = Some(Duration::from_secs(30));

    let h = harness(
        CountingCredentials::default(),
        MockSessions::with_batches(vec![batch(10)]),
        RecordingAppender::slow(Duration::from_secs(10), Duration::from_secs(60)),
        bounded,
    );

    let outcome = h
        .orchestrator
        .run(InvocationEvent::for_date("2024-03-01"), CancellationToken::new())
        .await;

    assert!(outcome.is_success(), "message: {}", outcome.message);
    assert_eq!(h.appender.commits.load(Ordering::SeqCst), 1);
}
