use serde::{Deserialize, Serialize};

/// Body returned by `DELETE /reset/{bucket}` on success.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResetResponse {
    pub response: String,
    pub debug: String,
}

impl ResetResponse {
    pub fn deleted(count: u64) -> Self {
        Self {
            response: "ok".to_string(),
            debug: format!("Deleted {} keys", count),
        }
    }
}

/// Structured error body shared by every endpoint.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub response: String,
    pub reason: String,
}

impl ErrorResponse {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            response: "error".to_string(),
            reason: reason.into(),
        }
    }
}
