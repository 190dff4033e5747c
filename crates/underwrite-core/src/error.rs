//! Error types for the extraction pipeline.
//!
//! Two layers live here. [`Error`] is the ordinary library error returned by
//! stores, queues and configuration. [`ExtractionFailure`] is the pipeline
//! taxonomy the orchestrator classifies every failure into before it decides
//! whether a task is retried, dropped or exhausted.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::status::DocumentStatus;

/// Result type alias using the pipeline's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for pipeline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Document not found
    #[error("Document not found: {0}")]
    DocumentNotFound(Uuid),

    /// A status change that the state machine forbids
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: DocumentStatus,
        to: DocumentStatus,
    },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Blob or record storage failed (transient from the pipeline's view)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Task queue error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

/// Failure modes of the extraction oracle contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    /// The blob is corrupt or in a format the backend cannot read.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The backend did not answer within the allotted time.
    #[error("Oracle timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The backend (or its model) is unreachable or overloaded.
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),
}

impl OracleError {
    /// Whether the queue should retry after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, OracleError::UnsupportedFormat(_))
    }
}

/// Pipeline failure taxonomy.
///
/// `RetryableInfrastructure` is retried per backoff, `NonRetryableInput` is
/// terminal immediately, `AttemptsExhausted` is synthesized by the queue when
/// the retry budget runs out and is always terminal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionFailure {
    #[error("{0}")]
    RetryableInfrastructure(String),

    #[error("{0}")]
    NonRetryableInput(String),

    #[error("extraction failed after {attempts} attempt(s): {last_error}")]
    AttemptsExhausted { attempts: u32, last_error: String },
}

impl ExtractionFailure {
    pub fn retryable(msg: impl Into<String>) -> Self {
        ExtractionFailure::RetryableInfrastructure(msg.into())
    }

    pub fn input(msg: impl Into<String>) -> Self {
        ExtractionFailure::NonRetryableInput(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ExtractionFailure::RetryableInfrastructure(_))
    }
}

impl From<OracleError> for ExtractionFailure {
    fn from(e: OracleError) -> Self {
        if e.is_retryable() {
            ExtractionFailure::RetryableInfrastructure(e.to_string())
        } else {
            ExtractionFailure::NonRetryableInput(e.to_string())
        }
    }
}

impl From<Error> for ExtractionFailure {
    fn from(e: Error) -> Self {
        match e {
            Error::InvalidInput(_) | Error::DocumentNotFound(_) | Error::NotFound(_) => {
                ExtractionFailure::NonRetryableInput(e.to_string())
            }
            _ => ExtractionFailure::RetryableInfrastructure(e.to_string()),
        }
    }
}

/// Non-fatal warning recorded when some pages failed but others succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialExtractionWarning {
    pub pages_failed: Vec<u32>,
}

impl PartialExtractionWarning {
    /// Build a warning, or `None` when no page failed.
    pub fn from_pages(mut pages_failed: Vec<u32>) -> Option<Self> {
        if pages_failed.is_empty() {
            return None;
        }
        pages_failed.sort_unstable();
        pages_failed.dedup();
        Some(Self { pages_failed })
    }
}

impl std::fmt::Display for PartialExtractionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pages: Vec<String> = self.pages_failed.iter().map(|p| p.to_string()).collect();
        write!(f, "extraction failed on page(s) {}", pages.join(", "))
    }
}
