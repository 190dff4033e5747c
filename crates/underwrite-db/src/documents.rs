//! PostgreSQL record store.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use underwrite_core::{
    Borrower, Document, DocumentStatus, DocumentStore, Error, ExtractedField, ExtractionCommit,
    FileType, Result, SourceReference, StatusEvent, SubmitRequest,
};

const DOCUMENT_COLUMNS: &str = "id, filename, file_type, size_bytes, content_hash, storage_locator, \
     status, page_count, error_message, created_at, updated_at";

const FIELD_COLUMNS: &str = "f.document_id, f.run_id, f.borrower_key, f.field_name, f.value, \
     f.confidence, f.page_number, f.section, f.snippet, f.extracted_at";

/// PostgreSQL implementation of [`DocumentStore`].
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: Pool<Postgres>,
}

impl PgDocumentStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_document_row(row: &PgRow) -> Result<Document> {
        let status: String = row.try_get("status").map_err(Error::Database)?;
        let file_type: String = row.try_get("file_type").map_err(Error::Database)?;
        Ok(Document {
            id: row.try_get("id").map_err(Error::Database)?,
            filename: row.try_get("filename").map_err(Error::Database)?,
            file_type: file_type.parse::<FileType>()?,
            size_bytes: row.try_get("size_bytes").map_err(Error::Database)?,
            content_hash: row.try_get("content_hash").map_err(Error::Database)?,
            storage_locator: row.try_get("storage_locator").map_err(Error::Database)?,
            status: status.parse::<DocumentStatus>()?,
            page_count: row.try_get("page_count").map_err(Error::Database)?,
            error_message: row.try_get("error_message").map_err(Error::Database)?,
            created_at: row.try_get("created_at").map_err(Error::Database)?,
            updated_at: row.try_get("updated_at").map_err(Error::Database)?,
        })
    }

    fn parse_field_row(row: &PgRow) -> Result<ExtractedField> {
        let document_id: Uuid = row.try_get("document_id").map_err(Error::Database)?;
        let page_number: i32 = row.try_get("page_number").map_err(Error::Database)?;
        Ok(ExtractedField {
            document_id,
            run_id: row.try_get("run_id").map_err(Error::Database)?,
            borrower_key: row.try_get("borrower_key").map_err(Error::Database)?,
            field_name: row.try_get("field_name").map_err(Error::Database)?,
            value: row.try_get("value").map_err(Error::Database)?,
            confidence: row.try_get("confidence").map_err(Error::Database)?,
            source: SourceReference {
                document_id,
                page_number: u32::try_from(page_number).map_err(|_| {
                    Error::Internal(format!("negative page_number {}", page_number))
                })?,
                section: row.try_get("section").map_err(Error::Database)?,
                snippet: row.try_get("snippet").map_err(Error::Database)?,
            },
            extracted_at: row.try_get("extracted_at").map_err(Error::Database)?,
        })
    }

    /// Lock the document row and return its status.
    async fn lock_status(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<DocumentStatus> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM document WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(Error::Database)?;
        status
            .ok_or(Error::DocumentNotFound(id))?
            .parse::<DocumentStatus>()
    }

    async fn fetch_document(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<Document> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM document WHERE id = $1",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_one(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Self::parse_document_row(&row)
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn insert_document(&self, req: &SubmitRequest) -> Result<(Document, bool)> {
        let now = Utc::now();
        let inserted = sqlx::query(&format!(
            "INSERT INTO document (id, filename, file_type, size_bytes, content_hash, storage_locator,
                                   status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $7)
             ON CONFLICT (id) DO NOTHING
             RETURNING {}",
            DOCUMENT_COLUMNS
        ))
        .bind(req.document_id)
        .bind(req.resolved_filename())
        .bind(req.file_type.as_str())
        .bind(req.size_bytes)
        .bind(req.content_hash.as_deref())
        .bind(&req.storage_locator)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        if let Some(row) = inserted {
            return Ok((Self::parse_document_row(&row)?, true));
        }

        let existing = self
            .get_document(req.document_id)
            .await?
            .ok_or(Error::DocumentNotFound(req.document_id))?;
        Ok((existing, false))
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM document WHERE id = $1",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_document_row).transpose()
    }

    async fn transition_status(
        &self,
        id: Uuid,
        event: StatusEvent,
        error_message: Option<&str>,
    ) -> Result<Document> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let current = Self::lock_status(&mut tx, id).await?;
        let next = current.apply(event)?;

        sqlx::query(
            "UPDATE document
             SET status = $1, error_message = COALESCE($2, error_message), updated_at = $3
             WHERE id = $4",
        )
        .bind(next.as_str())
        .bind(error_message)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let doc = Self::fetch_document(&mut tx, id).await?;
        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "documents",
            document_id = %id,
            from = %current,
            to = %next,
            "Document status changed"
        );
        Ok(doc)
    }

    async fn commit_extraction(&self, commit: &ExtractionCommit) -> Result<Document> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let current = Self::lock_status(&mut tx, commit.document_id).await?;
        let next = current.apply(StatusEvent::Committed)?;

        for field in &commit.fields {
            sqlx::query(
                "INSERT INTO extracted_field
                    (document_id, run_id, borrower_key, field_name, value, confidence,
                     page_number, section, snippet, extracted_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(field.document_id)
            .bind(field.run_id)
            .bind(&field.borrower_key)
            .bind(&field.field_name)
            .bind(&field.value)
            .bind(field.confidence)
            .bind(field.source.page_number as i32)
            .bind(field.source.section.as_deref())
            .bind(&field.source.snippet)
            .bind(field.extracted_at)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        sqlx::query(
            "INSERT INTO document_run (document_id, run_id, committed_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (document_id) DO UPDATE SET run_id = EXCLUDED.run_id,
                                                     committed_at = EXCLUDED.committed_at",
        )
        .bind(commit.document_id)
        .bind(commit.run_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        for borrower in &commit.borrowers {
            let body = serde_json::to_value(borrower)?;
            sqlx::query(
                "INSERT INTO borrower (key, body, overall_confidence, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (key) DO UPDATE SET body = EXCLUDED.body,
                                                 overall_confidence = EXCLUDED.overall_confidence,
                                                 updated_at = EXCLUDED.updated_at",
            )
            .bind(&borrower.key)
            .bind(body)
            .bind(borrower.overall_confidence)
            .bind(borrower.created_at)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        if !commit.retired_borrowers.is_empty() {
            sqlx::query("DELETE FROM borrower WHERE key = ANY($1)")
                .bind(&commit.retired_borrowers)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
        }

        sqlx::query(
            "UPDATE document
             SET status = $1, page_count = $2, error_message = $3, updated_at = $4
             WHERE id = $5",
        )
        .bind(next.as_str())
        .bind(commit.page_count)
        .bind(commit.warning.as_deref())
        .bind(now)
        .bind(commit.document_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let doc = Self::fetch_document(&mut tx, commit.document_id).await?;
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "documents",
            document_id = %commit.document_id,
            run_id = %commit.run_id,
            field_count = commit.fields.len(),
            borrower_count = commit.borrowers.len(),
            "Extraction committed"
        );
        Ok(doc)
    }

    async fn current_fields_for_document(&self, document_id: Uuid) -> Result<Vec<ExtractedField>> {
        let rows = sqlx::query(&format!(
            "SELECT {}
             FROM extracted_field f
             JOIN document_run r ON r.document_id = f.document_id AND r.run_id = f.run_id
             WHERE f.document_id = $1
             ORDER BY f.id",
            FIELD_COLUMNS
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(Self::parse_field_row).collect()
    }

    async fn current_fields_for_borrowers(&self, keys: &[String]) -> Result<Vec<ExtractedField>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {}
             FROM extracted_field f
             JOIN document_run r ON r.document_id = f.document_id AND r.run_id = f.run_id
             WHERE f.borrower_key = ANY($1)
             ORDER BY f.document_id, f.id",
            FIELD_COLUMNS
        ))
        .bind(keys)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(Self::parse_field_row).collect()
    }

    async fn borrower_keys(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT key FROM borrower ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)
    }

    async fn get_borrower(&self, key: &str) -> Result<Option<Borrower>> {
        let body: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT body FROM borrower WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;
        body.map(|b| serde_json::from_value(b).map_err(Error::from))
            .transpose()
    }

    async fn list_unfinished(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM document
             WHERE status IN ('pending', 'processing')
             ORDER BY created_at, id",
            DOCUMENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(Self::parse_document_row).collect()
    }
}
