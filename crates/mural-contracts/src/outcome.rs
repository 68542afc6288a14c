use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Structured error codes attached to every terminal outcome.
///
/// The wire form is the SCREAMING_SNAKE_CASE code (`API_KEY_MISSING`, ...).
/// `ContentPolicy` and `Timeout` belong to the upstream failure vocabulary
/// and are accepted on deserialization even though the classifier never
/// produces them itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Success,
    ApiKeyMissing,
    FileNotFound,
    InvalidInput,
    RateLimited,
    NetworkError,
    ApiError,
    ContentPolicy,
    Timeout,
    PartialFailure,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Success => "SUCCESS",
            ErrorKind::ApiKeyMissing => "API_KEY_MISSING",
            ErrorKind::FileNotFound => "FILE_NOT_FOUND",
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::ApiError => "API_ERROR",
            ErrorKind::ContentPolicy => "CONTENT_POLICY",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::PartialFailure => "PARTIAL_FAILURE",
        }
    }
}

/// Terminal result for one prompt in a batch. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub prompt: String,
    pub success: bool,
    pub error_code: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    pub retries_used: u32,
}

impl ItemOutcome {
    pub fn succeeded(prompt: impl Into<String>, output: PathBuf, retries_used: u32) -> Self {
        Self {
            prompt: prompt.into(),
            success: true,
            error_code: ErrorKind::Success,
            error: None,
            output: Some(output),
            retries_used,
        }
    }

    pub fn failed(
        prompt: impl Into<String>,
        error_code: ErrorKind,
        error: impl Into<String>,
        retries_used: u32,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            success: false,
            error_code,
            error: Some(error.into()),
            output: None,
            retries_used,
        }
    }
}

/// Aggregate over all items of one batch invocation.
///
/// Invariants: `succeeded + failed == total`, and `success` holds iff
/// `failed == 0`. Batch-fatal outcomes (missing credential, missing shared
/// input file) carry empty `results` with every item counted as failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub success: bool,
    pub error_code: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub results: Vec<ItemOutcome>,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retries_used: u32,
}

impl BatchOutcome {
    /// Batch-level failure recorded before any item was attempted.
    pub fn fatal(error_code: ErrorKind, error: impl Into<String>, total: u64) -> Self {
        Self {
            success: false,
            error_code,
            error: Some(error.into()),
            results: Vec::new(),
            total,
            succeeded: 0,
            failed: total,
            retries_used: 0,
        }
    }

    /// Aggregate per-item outcomes, in input order.
    pub fn from_items(results: Vec<ItemOutcome>) -> Self {
        let total = results.len() as u64;
        let succeeded = results.iter().filter(|item| item.success).count() as u64;
        let failed = total - succeeded;
        let retries_used = results.iter().map(|item| item.retries_used).sum();
        Self {
            success: failed == 0,
            error_code: if failed == 0 {
                ErrorKind::Success
            } else {
                ErrorKind::PartialFailure
            },
            error: None,
            results,
            total,
            succeeded,
            failed,
            retries_used,
        }
    }
}
