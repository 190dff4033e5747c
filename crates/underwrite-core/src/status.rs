//! Document status state machine.
//!
//! ```text
//!            dispatch              committed
//!  pending ───────────▶ processing ──────────▶ completed
//!     │                  │    ▲
//!     │ rejected         │    │ retry
//!     │                  ▼    │
//!     └──────────────▶  failed ◀── exhausted / non-retryable
//! ```
//!
//! No edge leaves a terminal state. `processing` re-enters itself on retry.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle state of a document in the extraction pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Something that happened to a document's extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// A worker took a lease on the document's task.
    Dispatched,
    /// A retryable failure occurred and attempts remain.
    RetryScheduled,
    /// Fields and borrowers were committed.
    Committed,
    /// The retry budget ran out.
    Exhausted,
    /// The input can never be extracted.
    Rejected,
}

impl DocumentStatus {
    /// Terminal states end polling and accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Failed)
    }

    /// Whether clients still need to poll this document.
    pub fn is_poll_eligible(self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self -> next` is a legal edge.
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    /// Validate and perform a transition.
    pub fn transition(self, next: DocumentStatus) -> Result<DocumentStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Apply an event, returning the resulting status.
    ///
    /// A dispatch of an already-processing document (lease expiry redelivery)
    /// is the processing→processing self edge.
    pub fn apply(self, event: StatusEvent) -> Result<DocumentStatus> {
        let next = match event {
            StatusEvent::Dispatched | StatusEvent::RetryScheduled => DocumentStatus::Processing,
            StatusEvent::Committed => DocumentStatus::Completed,
            StatusEvent::Exhausted | StatusEvent::Rejected => DocumentStatus::Failed,
        };
        self.transition(next)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    /// All states, in lifecycle order.
    pub const ALL: [DocumentStatus; 4] = [
        DocumentStatus::Pending,
        DocumentStatus::Processing,
        DocumentStatus::Completed,
        DocumentStatus::Failed,
    ];
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(Error::InvalidInput(format!(
                "Unknown document status: {}",
                other
            ))),
        }
    }
}
