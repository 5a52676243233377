use std::path::Path;

use super::IngestError;

/// Placeholder replaced by the resolved source glob.
pub const SOURCE_PATH_MARKER: &str = "{{SOURCE_PATH}}";

/// Extraction query shipped with the binary.
pub const DEFAULT_EXTRACT_QUERY: &str = include_str!("../../queries/extract.sql");

/// A parameterized extraction query with exactly one source path marker.
#[derive(Debug, Clone)]
pub struct QueryTemplate {
    text: String,
}

impl QueryTemplate {
    pub fn new(text: impl Into<String>) -> Result<Self, IngestError> {
        let text = text.into();
        match text.matches(SOURCE_PATH_MARKER).count() {
            1 => Ok(Self { text }),
            n => Err(IngestError::Template(format!(
                "expected exactly one {} marker, found {}",
                SOURCE_PATH_MARKER, n
            ))),
        }
    }

    /// The embedded default query.
    pub fn embedded() -> Result<Self, IngestError> {
        Self::new(DEFAULT_EXTRACT_QUERY)
    }

    /// Load a query from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, IngestError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Template(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::new(text)
    }

    /// Substitute the source path. The path is inserted verbatim.
    pub fn render(&self, source_path: &str) -> String {
        self.text.replace(SOURCE_PATH_MARKER, source_path)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}
