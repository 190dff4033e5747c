//! Service context wiring the store, queue and orchestrator together.
//!
//! A [`Pipeline`] is cheap to clone and is what the API and the worker hold.
//! Nothing in the crate lives in a global: two pipelines built in the same
//! process are fully isolated.

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use underwrite_core::{
    BlobStore, Borrower, DocumentStatus, DocumentStatusView, DocumentStore, Error,
    ExtractionConfig, ExtractionOracle, MatchConfig, QueueConfig, Result, StatusEvent,
    SubmitRequest, Submitted, TextLayerProbe,
};

use crate::aggregation::{is_document_scoped, normalize_borrower_key};
use crate::orchestrator::{Orchestrator, RunOutcome};
use crate::queue::{DispatchOutcome, Lease, QueueStats, Reaped, TaskQueue};

struct PipelineInner {
    store: Arc<dyn DocumentStore>,
    queue: Arc<TaskQueue>,
    orchestrator: Orchestrator,
}

#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Register an uploaded document and schedule its extraction.
    ///
    /// Idempotent for unfinished documents: resubmitting returns the live
    /// task. A document that already reached a terminal state is refused.
    pub async fn submit(&self, req: SubmitRequest) -> Result<Submitted> {
        req.validate()?;
        let (document, created) = self.inner.store.insert_document(&req).await?;
        if document.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: document.status,
                to: DocumentStatus::Pending,
            });
        }

        let enqueued = self.inner.queue.enqueue(document.id, req.method_hint).await;
        info!(
            subsystem = "jobs",
            component = "pipeline",
            document_id = %document.id,
            task_id = %enqueued.task_id,
            file_type = %document.file_type,
            new_document = created,
            new_task = enqueued.created,
            "Document submitted"
        );
        Ok(Submitted {
            document_id: document.id,
            task_id: enqueued.task_id,
        })
    }

    pub async fn get_status(&self, document_id: Uuid) -> Result<DocumentStatusView> {
        self.inner
            .store
            .get_document(document_id)
            .await?
            .map(|doc| DocumentStatusView::from(&doc))
            .ok_or(Error::DocumentNotFound(document_id))
    }

    /// Look up a borrower by key or by raw name.
    pub async fn get_borrower(&self, key_or_name: &str) -> Result<Borrower> {
        let key = if is_document_scoped(key_or_name) {
            key_or_name.to_string()
        } else {
            normalize_borrower_key(key_or_name)
                .ok_or_else(|| Error::InvalidInput("borrower key is empty".to_string()))?
        };
        self.inner
            .store
            .get_borrower(&key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("borrower '{}'", key)))
    }

    /// Re-enqueue every document left unfinished by a previous process.
    pub async fn recover(&self) -> Result<usize> {
        let unfinished = self.inner.store.list_unfinished().await?;
        let mut scheduled = 0;
        for doc in &unfinished {
            if self.inner.queue.enqueue(doc.id, None).await.created {
                scheduled += 1;
            }
        }
        if scheduled > 0 {
            info!(
                subsystem = "jobs",
                component = "pipeline",
                count = scheduled,
                "Recovered unfinished documents"
            );
        }
        Ok(scheduled)
    }

    /// Run one leased task.
    pub async fn process(&self, lease: Lease) -> RunOutcome {
        self.inner.orchestrator.run(lease).await
    }

    /// Lease and run the next ready task, if admission allows one now.
    pub async fn process_next(&self) -> Option<(Uuid, RunOutcome)> {
        match self.inner.queue.try_dispatch().await {
            DispatchOutcome::Leased(lease) => {
                let document_id = lease.document_id;
                Some((document_id, self.process(lease).await))
            }
            _ => None,
        }
    }

    /// Expire overdue leases and fail documents whose retry budget is spent.
    pub async fn reap_expired(&self) -> Vec<Reaped> {
        let reaped = self.inner.queue.reap_expired().await;
        for r in &reaped {
            let Some(exhausted) = &r.exhausted else {
                continue;
            };
            let message = exhausted.to_string();
            match self
                .inner
                .store
                .transition_status(r.document_id, StatusEvent::Exhausted, Some(&message))
                .await
            {
                Ok(_) => warn!(
                    subsystem = "jobs",
                    component = "pipeline",
                    document_id = %r.document_id,
                    attempts = r.attempt,
                    "Abandoned task exhausted its attempts"
                ),
                Err(Error::InvalidTransition { .. }) => {}
                Err(e) => error!(
                    subsystem = "jobs",
                    component = "pipeline",
                    document_id = %r.document_id,
                    error = %e,
                    "Failed to record exhausted document"
                ),
            }
        }
        reaped
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.inner.queue
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats().await
    }

    pub async fn oracle_healthy(&self) -> bool {
        match self.inner.orchestrator.oracle().health_check().await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!(subsystem = "jobs", error = %e, "Oracle health check failed");
                false
            }
        }
    }
}

/// Builder for [`Pipeline`]. All four collaborators are required.
#[derive(Default)]
pub struct PipelineBuilder {
    store: Option<Arc<dyn DocumentStore>>,
    blobs: Option<Arc<dyn BlobStore>>,
    oracle: Option<Arc<dyn ExtractionOracle>>,
    probe: Option<Arc<dyn TextLayerProbe>>,
    extraction: ExtractionConfig,
    queue: QueueConfig,
    matching: MatchConfig,
}

impl PipelineBuilder {
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn oracle(mut self, oracle: Arc<dyn ExtractionOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn TextLayerProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn extraction_config(mut self, config: ExtractionConfig) -> Self {
        self.extraction = config;
        self
    }

    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue = config;
        self
    }

    pub fn match_config(mut self, config: MatchConfig) -> Self {
        self.matching = config;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        self.extraction.validate()?;
        self.queue.validate_against(&self.extraction)?;
        self.matching.validate()?;

        let missing = |what: &str| Error::Config(format!("pipeline requires a {}", what));
        let store = self.store.ok_or_else(|| missing("document store"))?;
        let blobs = self.blobs.ok_or_else(|| missing("blob store"))?;
        let oracle = self.oracle.ok_or_else(|| missing("extraction oracle"))?;
        let probe = self.probe.ok_or_else(|| missing("text layer probe"))?;

        let queue = Arc::new(TaskQueue::new(self.queue)?);
        let orchestrator = Orchestrator::new(
            store.clone(),
            blobs,
            oracle,
            probe,
            queue.clone(),
            self.extraction,
            self.matching,
        );

        Ok(Pipeline {
            inner: Arc::new(PipelineInner {
                store,
                queue,
                orchestrator,
            }),
        })
    }
}
