pub mod catalog;
pub mod config;
pub mod credentials;
pub mod ingest;
pub mod partition;
pub mod pipeline;
pub mod telemetry;

pub use catalog::{AppendSummary, CatalogAppender, IcebergAppender, TableName};
pub use config::AppConfig;
pub use pipeline::{InvocationEvent, PipelineOrchestrator, RunOutcome};
