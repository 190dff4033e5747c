//! Per-lease extraction run.
//!
//! One run walks a document through:
//!
//! 1. `pending|processing -> processing` on dispatch
//! 2. blob fetch bounded by `blob_timeout`, then verification (magic bytes,
//!    declared SHA-256)
//! 3. text-layer probe, method and OCR selection
//! 4. oracle call bounded by `oracle_timeout`
//! 5. normalization, borrower keying and re-aggregation
//! 6. atomic commit of fields, borrowers and `completed`
//! 7. `ack`, or `fail` with the classified [`ExtractionFailure`]
//!
//! Steps 2 through 6 renew the lease every third of `lease_timeout`, so a
//! slow but healthy run is never redelivered mid-flight.
//!
//! Infrastructure errors never escape a run: they surface as the document's
//! status and `error_message`. Aggregation and commit are serialized across
//! runs, and a run whose lease is no longer current at commit time writes
//! nothing.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use underwrite_core::{
    BlobStore, Document, DocumentStore, Error, ExtractedField, ExtractionCommit,
    ExtractionConfig, ExtractionFailure, ExtractionOracle, FileType, MatchConfig, OracleError,
    SourceReference, StatusEvent, TextLayerProbe,
};

use crate::aggregation::{aggregate, assign_keys, BorrowerMatcher};
use crate::normalize::{normalize, NormalizedOutput};
use crate::queue::{FailOutcome, Lease, TaskQueue};
use crate::selection::{plan, ExtractionPlan};

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        field_count: usize,
        borrower_keys: Vec<String>,
        warning: Option<String>,
    },
    Retrying {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Failed {
        error: String,
    },
    /// The lease was lost or the document already finished; nothing written.
    Superseded,
}

struct Committed {
    field_count: usize,
    borrower_keys: Vec<String>,
    warning: Option<String>,
}

pub struct Orchestrator {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    oracle: Arc<dyn ExtractionOracle>,
    probe: Arc<dyn TextLayerProbe>,
    queue: Arc<TaskQueue>,
    extraction: ExtractionConfig,
    matching: MatchConfig,
    commit_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        oracle: Arc<dyn ExtractionOracle>,
        probe: Arc<dyn TextLayerProbe>,
        queue: Arc<TaskQueue>,
        extraction: ExtractionConfig,
        matching: MatchConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            oracle,
            probe,
            queue,
            extraction,
            matching,
            commit_lock: Mutex::new(()),
        }
    }

    pub fn oracle(&self) -> &Arc<dyn ExtractionOracle> {
        &self.oracle
    }

    /// Execute one leased task to completion.
    pub async fn run(&self, lease: Lease) -> RunOutcome {
        let start = Instant::now();
        let document_id = lease.document_id;

        let document = match self
            .store
            .transition_status(document_id, StatusEvent::Dispatched, None)
            .await
        {
            Ok(doc) => doc,
            Err(Error::InvalidTransition { from, .. }) => {
                debug!(
                    subsystem = "jobs",
                    component = "orchestrator",
                    document_id = %document_id,
                    status = %from,
                    "Document already finished, dropping task"
                );
                if let Err(e) = self.queue.ack(&lease).await {
                    debug!(document_id = %document_id, error = %e, "Stale lease on finished document");
                }
                return RunOutcome::Superseded;
            }
            Err(e) => return self.settle_failure(&lease, e.into()).await,
        };

        info!(
            subsystem = "jobs",
            component = "orchestrator",
            document_id = %document_id,
            task_id = %lease.task_id,
            attempt = lease.attempt,
            "Extraction run started"
        );

        match self
            .with_heartbeat(&lease, self.extract_and_commit(&lease, &document))
            .await
        {
            Ok(Some(committed)) => {
                if let Err(e) = self.queue.ack(&lease).await {
                    warn!(
                        subsystem = "jobs",
                        component = "orchestrator",
                        document_id = %document_id,
                        error = %e,
                        "Committed but lease expired before ack"
                    );
                }
                info!(
                    subsystem = "jobs",
                    component = "orchestrator",
                    document_id = %document_id,
                    attempt = lease.attempt,
                    field_count = committed.field_count,
                    borrowers = committed.borrower_keys.len(),
                    partial = committed.warning.is_some(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Document completed"
                );
                RunOutcome::Completed {
                    field_count: committed.field_count,
                    borrower_keys: committed.borrower_keys,
                    warning: committed.warning,
                }
            }
            Ok(None) => {
                warn!(
                    subsystem = "jobs",
                    component = "orchestrator",
                    document_id = %document_id,
                    attempt = lease.attempt,
                    "Run superseded before commit"
                );
                RunOutcome::Superseded
            }
            Err(failure) => self.settle_failure(&lease, failure).await,
        }
    }

    /// Drive `work` to completion while renewing `lease`.
    ///
    /// Once a renewal fails the lease is gone for good; `work` still runs but
    /// its commit is fenced out.
    async fn with_heartbeat<T>(&self, lease: &Lease, work: impl Future<Output = T>) -> T {
        let period = (self.queue.config().lease_timeout / 3).max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);

        let mut renewing = true;
        loop {
            tokio::select! {
                out = &mut work => return out,
                _ = heartbeat.tick(), if renewing => {
                    if let Err(e) = self.queue.renew(lease).await {
                        warn!(
                            subsystem = "jobs",
                            component = "orchestrator",
                            document_id = %lease.document_id,
                            attempt = lease.attempt,
                            error = %e,
                            "Lease lost mid-run"
                        );
                        renewing = false;
                    }
                }
            }
        }
    }

    async fn extract_and_commit(
        &self,
        lease: &Lease,
        document: &Document,
    ) -> Result<Option<Committed>, ExtractionFailure> {
        let blob_timeout = self.extraction.blob_timeout;
        let blob = tokio::time::timeout(blob_timeout, self.blobs.get(&document.storage_locator))
            .await
            .map_err(|_| {
                ExtractionFailure::retryable(format!(
                    "blob fetch timed out after {}s",
                    blob_timeout.as_secs()
                ))
            })??;
        verify_blob(document, &blob)?;

        let stats = self.probe.probe(&blob, document.file_type).await?;
        let ExtractionPlan { method, ocr } =
            plan(&self.extraction, lease.method_hint, document.file_type, &stats);
        debug!(
            subsystem = "jobs",
            component = "orchestrator",
            document_id = %document.id,
            method = %method,
            ocr = %ocr,
            coverage = stats.coverage(),
            mean_chars_per_page = stats.mean_chars_per_page(),
            "Extraction plan selected"
        );

        let timeout = self.extraction.oracle_timeout;
        let output = tokio::time::timeout(
            timeout,
            self.oracle.extract(&blob, document.file_type, method, ocr),
        )
        .await
        .map_err(|_| OracleError::Timeout(timeout))??;

        let normalized = normalize(output, Some(stats.page_count));
        if normalized.fields.is_empty() {
            let reason = match &normalized.warning {
                Some(w) => format!("no fields extracted; {}", w),
                None => "no fields extracted".to_string(),
            };
            return Err(ExtractionFailure::input(reason));
        }
        if let Some(w) = &normalized.warning {
            warn!(
                subsystem = "jobs",
                component = "orchestrator",
                document_id = %document.id,
                pages_failed = ?w.pages_failed,
                "Partial extraction"
            );
        }

        let _guard = self.commit_lock.lock().await;
        if !self.queue.holds(lease).await {
            return Ok(None);
        }
        self.commit(document.id, normalized).await
    }

    /// Key, aggregate and commit. Must run under the commit lock.
    async fn commit(
        &self,
        document_id: Uuid,
        normalized: NormalizedOutput,
    ) -> Result<Option<Committed>, ExtractionFailure> {
        let mut matcher = BorrowerMatcher::new(self.matching, self.store.borrower_keys().await?);
        let keys = assign_keys(document_id, &normalized.fields, &mut matcher);

        let run_id = Uuid::now_v7();
        let extracted_at = Utc::now();
        let fields: Vec<ExtractedField> = normalized
            .fields
            .into_iter()
            .zip(keys)
            .map(|(f, borrower_key)| ExtractedField {
                document_id,
                run_id,
                borrower_key,
                source: SourceReference {
                    document_id,
                    page_number: f.page,
                    section: f.section,
                    snippet: f.snippet,
                },
                field_name: f.name,
                value: f.value,
                confidence: f.confidence,
                extracted_at,
            })
            .collect();

        // Keys this document fed before must be recomputed too, or a
        // re-extraction that renames the borrower leaves stale records behind.
        let previous = self.store.current_fields_for_document(document_id).await?;
        let affected: BTreeSet<String> = fields
            .iter()
            .map(|f| f.borrower_key.clone())
            .chain(previous.into_iter().map(|f| f.borrower_key))
            .collect();
        let affected_keys: Vec<String> = affected.iter().cloned().collect();

        let mut pool: Vec<ExtractedField> = self
            .store
            .current_fields_for_borrowers(&affected_keys)
            .await?
            .into_iter()
            .filter(|f| f.document_id != document_id)
            .collect();
        pool.extend(fields.iter().cloned());

        let mut borrowers = Vec::new();
        let mut retired = Vec::new();
        for key in &affected_keys {
            let created_at = self
                .store
                .get_borrower(key)
                .await?
                .map(|b| b.created_at)
                .unwrap_or(extracted_at);
            match aggregate(key, &pool, created_at) {
                Some(borrower) => borrowers.push(borrower),
                None => retired.push(key.clone()),
            }
        }

        let warning = normalized.warning.map(|w| w.to_string());
        let borrower_keys: Vec<String> = borrowers.iter().map(|b| b.key.clone()).collect();
        let commit = ExtractionCommit {
            document_id,
            run_id,
            page_count: normalized.page_count.and_then(|n| i32::try_from(n).ok()),
            fields,
            warning: warning.clone(),
            borrowers,
            retired_borrowers: retired,
        };

        match self.store.commit_extraction(&commit).await {
            Ok(_) => Ok(Some(Committed {
                field_count: commit.fields.len(),
                borrower_keys,
                warning,
            })),
            // Another run already finished the document.
            Err(Error::InvalidTransition { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Report a failed run to the queue and mirror the verdict in the store.
    async fn settle_failure(&self, lease: &Lease, failure: ExtractionFailure) -> RunOutcome {
        let document_id = lease.document_id;
        let outcome = match self.queue.fail(lease, &failure).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "orchestrator",
                    document_id = %document_id,
                    error = %e,
                    failure = %failure,
                    "Failure on a lease that is no longer held"
                );
                return RunOutcome::Superseded;
            }
        };

        let (event, message, result) = match outcome {
            FailOutcome::Retrying { attempt, delay } => {
                warn!(
                    subsystem = "jobs",
                    component = "orchestrator",
                    document_id = %document_id,
                    attempt = lease.attempt,
                    next_attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Extraction attempt failed, retry scheduled"
                );
                (
                    StatusEvent::RetryScheduled,
                    failure.to_string(),
                    RunOutcome::Retrying {
                        attempt,
                        delay,
                        error: failure.to_string(),
                    },
                )
            }
            FailOutcome::Exhausted(exhausted) => {
                error!(
                    subsystem = "jobs",
                    component = "orchestrator",
                    document_id = %document_id,
                    error = %exhausted,
                    "Extraction failed permanently"
                );
                let message = exhausted.to_string();
                (
                    StatusEvent::Exhausted,
                    message.clone(),
                    RunOutcome::Failed { error: message },
                )
            }
            FailOutcome::Dropped => {
                warn!(
                    subsystem = "jobs",
                    component = "orchestrator",
                    document_id = %document_id,
                    error = %failure,
                    "Extraction rejected"
                );
                let message = failure.to_string();
                (
                    StatusEvent::Rejected,
                    message.clone(),
                    RunOutcome::Failed { error: message },
                )
            }
        };

        if let Err(e) = self
            .store
            .transition_status(document_id, event, Some(&message))
            .await
        {
            error!(
                subsystem = "jobs",
                component = "orchestrator",
                document_id = %document_id,
                error = %e,
                "Failed to record extraction failure"
            );
        }
        result
    }
}

/// Reject blobs that are empty, fail the declared hash or whose magic bytes
/// contradict the declared file type.
pub fn verify_blob(document: &Document, blob: &[u8]) -> Result<(), ExtractionFailure> {
    if blob.is_empty() {
        return Err(ExtractionFailure::input("document blob is empty"));
    }

    if let Some(expected) = &document.content_hash {
        let actual = hex::encode(Sha256::digest(blob));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(ExtractionFailure::input(format!(
                "content hash mismatch: expected {}, got {}",
                expected, actual
            )));
        }
    }

    // Plain text has no signature to check.
    if document.file_type == FileType::Text {
        return Ok(());
    }
    match infer::get(blob) {
        Some(kind) if kind.mime_type() == document.file_type.mime_type() => Ok(()),
        Some(kind) => Err(ExtractionFailure::input(format!(
            "declared {} but content is {}",
            document.file_type.mime_type(),
            kind.mime_type()
        ))),
        None => Err(ExtractionFailure::input(format!(
            "content is not a recognizable {}",
            document.file_type.mime_type()
        ))),
    }
}
