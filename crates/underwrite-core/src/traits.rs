//! Collaborator traits the pipeline is written against.
//!
//! The orchestrator, queue and API never name a concrete store or backend;
//! they hold `Arc<dyn Trait>` values wired up by the service context.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{OracleError, Result};
use crate::models::*;
use crate::status::StatusEvent;

// =============================================================================
// RECORD STORE
// =============================================================================

/// Persistent record of documents, extracted fields and borrowers.
///
/// Implementations must make `commit_extraction` atomic: either the fields,
/// the run pointer, the borrower records and the `completed` transition are
/// all visible, or none of them are.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create the document row in `pending`. Idempotent: an existing row is
    /// returned untouched with `false`.
    async fn insert_document(&self, req: &SubmitRequest) -> Result<(Document, bool)>;

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>>;

    /// Apply a status event under the state machine.
    ///
    /// `error_message` replaces the stored message when given. Illegal edges
    /// fail with `Error::InvalidTransition` and change nothing.
    async fn transition_status(
        &self,
        id: Uuid,
        event: StatusEvent,
        error_message: Option<&str>,
    ) -> Result<Document>;

    /// Atomically append the run's fields, point the document at the run,
    /// replace borrower records and move the document to `completed`.
    async fn commit_extraction(&self, commit: &ExtractionCommit) -> Result<Document>;

    /// Fields from the document's latest committed run.
    async fn current_fields_for_document(&self, document_id: Uuid) -> Result<Vec<ExtractedField>>;

    /// Current fields (latest committed run per document) under any of `keys`.
    async fn current_fields_for_borrowers(&self, keys: &[String]) -> Result<Vec<ExtractedField>>;

    /// Every borrower key with a stored record, sorted.
    async fn borrower_keys(&self) -> Result<Vec<String>>;

    async fn get_borrower(&self, key: &str) -> Result<Option<Borrower>>;

    /// Documents still `pending` or `processing`, oldest first.
    async fn list_unfinished(&self) -> Result<Vec<Document>>;
}

// =============================================================================
// BLOB STORE
// =============================================================================

/// Read access to uploaded document bytes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch a blob. A missing blob is `Error::NotFound`; transport or disk
    /// failures are `Error::Storage`.
    async fn get(&self, locator: &str) -> Result<Vec<u8>>;

    async fn put(&self, locator: &str, data: &[u8]) -> Result<()>;
}

// =============================================================================
// EXTRACTION ORACLE
// =============================================================================

/// Black-box extraction backend.
///
/// Both methods share one output contract. `ocr` arrives already resolved to
/// `Force` or `Skip`.
#[async_trait]
pub trait ExtractionOracle: Send + Sync {
    async fn extract(
        &self,
        blob: &[u8],
        file_type: FileType,
        method: ExtractionMethod,
        ocr: OcrMode,
    ) -> std::result::Result<OracleOutput, OracleError>;

    /// Check that the backend is reachable.
    async fn health_check(&self) -> Result<bool>;

    fn name(&self) -> &str;
}

/// Measures the native text layer of a blob ahead of method selection.
#[async_trait]
pub trait TextLayerProbe: Send + Sync {
    async fn probe(&self, blob: &[u8], file_type: FileType) -> Result<TextLayerStats>;
}
