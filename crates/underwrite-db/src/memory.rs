//! In-memory record store.
//!
//! Same transition and commit semantics as [`crate::PgDocumentStore`], held
//! behind one lock so every operation is atomic. Used by tests and by the
//! API binary when no `DATABASE_URL` is configured.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use underwrite_core::{
    Borrower, Document, DocumentStatus, DocumentStore, Error, ExtractedField, ExtractionCommit,
    Result, StatusEvent, SubmitRequest,
};

#[derive(Default)]
struct Inner {
    documents: HashMap<Uuid, Document>,
    /// Append-only, insertion ordered.
    fields: Vec<ExtractedField>,
    /// Latest committed run per document.
    runs: HashMap<Uuid, Uuid>,
    borrowers: BTreeMap<String, Borrower>,
}

impl Inner {
    fn current_fields(&self) -> impl Iterator<Item = &ExtractedField> + '_ {
        self.fields
            .iter()
            .filter(|f| self.runs.get(&f.document_id) == Some(&f.run_id))
    }
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    inner: RwLock<Inner>,
    failing_commits: AtomicUsize,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a transient storage error.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Every field row ever written, superseded runs included.
    pub async fn all_fields(&self) -> Vec<ExtractedField> {
        self.inner.read().await.fields.clone()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert_document(&self, req: &SubmitRequest) -> Result<(Document, bool)> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.documents.get(&req.document_id) {
            return Ok((existing.clone(), false));
        }
        let now = Utc::now();
        let doc = Document {
            id: req.document_id,
            filename: req.resolved_filename(),
            file_type: req.file_type,
            size_bytes: req.size_bytes,
            content_hash: req.content_hash.clone(),
            storage_locator: req.storage_locator.clone(),
            status: DocumentStatus::Pending,
            page_count: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        inner.documents.insert(doc.id, doc.clone());
        Ok((doc, true))
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        Ok(self.inner.read().await.documents.get(&id).cloned())
    }

    async fn transition_status(
        &self,
        id: Uuid,
        event: StatusEvent,
        error_message: Option<&str>,
    ) -> Result<Document> {
        let mut inner = self.inner.write().await;
        let doc = inner
            .documents
            .get_mut(&id)
            .ok_or(Error::DocumentNotFound(id))?;
        doc.status = doc.status.apply(event)?;
        if let Some(msg) = error_message {
            doc.error_message = Some(msg.to_string());
        }
        doc.updated_at = Utc::now();
        Ok(doc.clone())
    }

    async fn commit_extraction(&self, commit: &ExtractionCommit) -> Result<Document> {
        let mut inner = self.inner.write().await;

        let status = inner
            .documents
            .get(&commit.document_id)
            .ok_or(Error::DocumentNotFound(commit.document_id))?
            .status;
        let next = status.apply(StatusEvent::Committed)?;

        if self.take_injected_failure() {
            return Err(Error::Storage("injected commit failure".to_string()));
        }

        inner.fields.extend(commit.fields.iter().cloned());
        inner.runs.insert(commit.document_id, commit.run_id);
        for borrower in &commit.borrowers {
            inner.borrowers.insert(borrower.key.clone(), borrower.clone());
        }
        for key in &commit.retired_borrowers {
            inner.borrowers.remove(key);
        }

        let doc = inner
            .documents
            .get_mut(&commit.document_id)
            .ok_or(Error::DocumentNotFound(commit.document_id))?;
        doc.status = next;
        doc.page_count = commit.page_count;
        doc.error_message = commit.warning.clone();
        doc.updated_at = Utc::now();
        Ok(doc.clone())
    }

    async fn current_fields_for_document(&self, document_id: Uuid) -> Result<Vec<ExtractedField>> {
        let inner = self.inner.read().await;
        Ok(inner
            .current_fields()
            .filter(|f| f.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn current_fields_for_borrowers(&self, keys: &[String]) -> Result<Vec<ExtractedField>> {
        let inner = self.inner.read().await;
        let mut fields: Vec<ExtractedField> = inner
            .current_fields()
            .filter(|f| keys.contains(&f.borrower_key))
            .cloned()
            .collect();
        // Stable sort keeps insertion order within a document.
        fields.sort_by_key(|f| f.document_id);
        Ok(fields)
    }

    async fn borrower_keys(&self) -> Result<Vec<String>> {
        Ok(self.inner.read().await.borrowers.keys().cloned().collect())
    }

    async fn get_borrower(&self, key: &str) -> Result<Option<Borrower>> {
        Ok(self.inner.read().await.borrowers.get(key).cloned())
    }

    async fn list_unfinished(&self) -> Result<Vec<Document>> {
        let inner = self.inner.read().await;
        let mut docs: Vec<Document> = inner
            .documents
            .values()
            .filter(|d| !d.status.is_terminal())
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use underwrite_core::{FileType, SourceReference};

    fn request(id: Uuid) -> SubmitRequest {
        SubmitRequest::new(id, format!("{}.pdf", id), FileType::Pdf)
    }

    fn field(document_id: Uuid, run_id: Uuid, key: &str, name: &str, value: &str) -> ExtractedField {
        ExtractedField {
            document_id,
            run_id,
            borrower_key: key.to_string(),
            field_name: name.to_string(),
            value: value.to_string(),
            confidence: 0.9,
            source: SourceReference {
                document_id,
                page_number: 1,
                section: None,
                snippet: value.to_string(),
            },
            extracted_at: Utc::now(),
        }
    }

    fn commit(document_id: Uuid, run_id: Uuid, fields: Vec<ExtractedField>) -> ExtractionCommit {
        ExtractionCommit {
            document_id,
            run_id,
            page_count: Some(1),
            fields,
            warning: None,
            borrowers: vec![],
            retired_borrowers: vec![],
        }
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = MemoryDocumentStore::new();
        let id = Uuid::new_v4();

        let (first, created) = store.insert_document(&request(id)).await.unwrap();
        assert!(created);
        assert_eq!(first.status, DocumentStatus::Pending);

        store
            .transition_status(id, StatusEvent::Dispatched, None)
            .await
            .unwrap();

        let (second, created) = store.insert_document(&request(id)).await.unwrap();
        assert!(!created);
        assert_eq!(second.status, DocumentStatus::Processing);
    }

    #[tokio::test]
    async fn test_illegal_transition_changes_nothing() {
        let store = MemoryDocumentStore::new();
        let id = Uuid::new_v4();
        store.insert_document(&request(id)).await.unwrap();

        let err = store
            .transition_status(id, StatusEvent::Committed, Some("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let doc = store.get_document(id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);
        assert_eq!(doc.error_message, None);
    }

    #[tokio::test]
    async fn test_commit_supersedes_previous_run() {
        let store = MemoryDocumentStore::new();
        let id = Uuid::new_v4();
        store.insert_document(&request(id)).await.unwrap();
        store
            .transition_status(id, StatusEvent::Dispatched, None)
            .await
            .unwrap();

        let run_a = Uuid::new_v4();
        store
            .commit_extraction(&commit(id, run_a, vec![field(id, run_a, "jane doe", "address", "1 Elm")]))
            .await
            .unwrap();

        let current = store.current_fields_for_document(id).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].run_id, run_a);

        // Committing again from a terminal state is rejected.
        let run_b = Uuid::new_v4();
        let err = store
            .commit_extraction(&commit(id, run_b, vec![field(id, run_b, "jane doe", "address", "2 Oak")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(store.all_fields().await.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_commit_failure_is_transient() {
        let store = MemoryDocumentStore::new();
        let id = Uuid::new_v4();
        store.insert_document(&request(id)).await.unwrap();
        store
            .transition_status(id, StatusEvent::Dispatched, None)
            .await
            .unwrap();
        store.fail_next_commits(1);

        let run = Uuid::new_v4();
        let c = commit(id, run, vec![field(id, run, "k", "address", "x")]);
        assert!(matches!(
            store.commit_extraction(&c).await,
            Err(Error::Storage(_))
        ));
        assert!(store.all_fields().await.is_empty());

        let doc = store.commit_extraction(&c).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
    }

    #[tokio::test]
    async fn test_list_unfinished_excludes_terminal() {
        let store = MemoryDocumentStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.insert_document(&request(a)).await.unwrap();
        store.insert_document(&request(b)).await.unwrap();
        store
            .transition_status(b, StatusEvent::Rejected, Some("unreadable"))
            .await
            .unwrap();

        let unfinished = store.list_unfinished().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, a);
    }
}
