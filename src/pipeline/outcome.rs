use serde::{Deserialize, Serialize};

pub const SUCCESS_MESSAGE: &str = "Success";
pub const NO_DATA_MESSAGE: &str = "No data";

/// Input of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct InvocationEvent {
    #[serde(default)]
    pub target_date: Option<String>,
}

impl InvocationEvent {
    pub fn for_date(date: impl Into<String>) -> Self {
        Self {
            target_date: Some(date.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
}

/// Result of one invocation, produced exactly once whether it succeeded or not.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub message: String,
    pub rows_processed: usize,
    /// Resolved partition date; absent when the run failed before resolving it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_date: Option<String>,
    pub target_table: String,
}

impl RunOutcome {
    pub fn success(rows: usize, target_date: &str, target_table: &str) -> Self {
        let message = if rows == 0 {
            NO_DATA_MESSAGE
        } else {
            SUCCESS_MESSAGE
        };

        Self {
            status: RunStatus::Success,
            status_code: 200,
            message: message.to_string(),
            rows_processed: rows,
            target_date: Some(target_date.to_string()),
            target_table: target_table.to_string(),
        }
    }

    pub fn failure(
        message: impl Into<String>,
        target_date: Option<&str>,
        target_table: &str,
    ) -> Self {
        Self {
            status: RunStatus::Failure,
            status_code: 500,
            message: message.into(),
            rows_processed: 0,
            target_date: target_date.map(str::to_string),
            target_table: target_table.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}
