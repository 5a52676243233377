//! Extraction of one partition from object storage through DuckDB.

mod accumulator;
mod engine;
mod error;
mod session;
mod template;

pub use accumulator::{AccumulatedTable, BatchAccumulator, Extraction};
pub use engine::{EngineSettings, WarmEngine};
pub use error::IngestError;
pub use session::{DuckDbSession, DuckDbSessionFactory, SessionFactory};
pub use template::{QueryTemplate, DEFAULT_EXTRACT_QUERY, SOURCE_PATH_MARKER};
