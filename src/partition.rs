//! Partition key and source glob resolution for a single run.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::fmt;
use thiserror::Error;

/// Date format of partition keys and of the `date=` path segment.
pub const PARTITION_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("invalid partition date '{0}': expected YYYY-MM-DD")]
    InvalidDate(String),
}

/// Logical partition key of a run: a calendar date string.
///
/// Keys resolved from explicit input are carried verbatim; see
/// [`PartitionKey::validate`] for the strict form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check that the key is a real `YYYY-MM-DD` calendar date.
    pub fn validate(&self) -> Result<NaiveDate, PartitionError> {
        NaiveDate::parse_from_str(&self.0, PARTITION_DATE_FORMAT)
            .map_err(|_| PartitionError::InvalidDate(self.0.clone()))
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve the partition key: explicit input, then the configured default,
/// then the day before `now`. Blank strings count as absent.
pub fn resolve_partition(
    explicit: Option<&str>,
    default: Option<&str>,
    now: DateTime<Utc>,
) -> PartitionKey {
    let pick = |value: Option<&str>| value.filter(|v| !v.trim().is_empty()).map(str::to_string);

    let key = pick(explicit)
        .or_else(|| pick(default))
        .unwrap_or_else(|| {
            (now - Duration::days(1))
                .format(PARTITION_DATE_FORMAT)
                .to_string()
        });

    PartitionKey(key)
}

/// The single object-store glob a run reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    glob: String,
}

impl SourceLocation {
    /// Render a path template with `{bucket}`, `{prefix}` and `{date}` placeholders.
    ///
    /// Leading and trailing slashes on the prefix are dropped so the
    /// template controls the separators.
    pub fn render(template: &str, bucket: &str, prefix: &str, key: &PartitionKey) -> Self {
        let glob = template
            .replace("{bucket}", bucket)
            .replace("{prefix}", prefix.trim_matches('/'))
            .replace("{date}", key.as_str());
        Self { glob }
    }

    /// Wrap an already resolved glob.
    pub fn from_glob(glob: impl Into<String>) -> Self {
        Self { glob: glob.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.glob)
    }
}
