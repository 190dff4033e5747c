//! # underwrite-jobs
//!
//! Extraction scheduling and aggregation for the underwrite pipeline.
//!
//! This crate provides:
//! - A rate- and concurrency-limited task queue with leases and backoff
//! - Method/OCR selection and the per-lease extraction run
//! - Borrower keying and cross-document aggregation
//! - A worker that drives runs and reports them on a broadcast channel
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use underwrite_jobs::{ExtractionWorker, Pipeline, WorkerConfig};
//!
//! let pipeline = Pipeline::builder()
//!     .store(Arc::new(store))
//!     .blobs(Arc::new(blobs))
//!     .oracle(Arc::new(oracle))
//!     .probe(Arc::new(probe))
//!     .build()?;
//!
//! pipeline.recover().await?;
//! let handle = ExtractionWorker::new(pipeline.clone(), WorkerConfig::default()).start();
//!
//! let submitted = pipeline.submit(request).await?;
//! let status = pipeline.get_status(submitted.document_id).await?;
//!
//! handle.shutdown().await?;
//! ```

pub mod aggregation;
pub mod backoff;
pub mod normalize;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod selection;
pub mod worker;

// Re-export core types
pub use underwrite_core::*;

pub use aggregation::{aggregate, normalize_borrower_key, BorrowerMatcher};
pub use backoff::BackoffPolicy;
pub use orchestrator::{Orchestrator, RunOutcome};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use queue::{
    DispatchOutcome, Enqueued, ExtractionTask, FailOutcome, Lease, QueueStats, Reaped, TaskQueue,
};
pub use selection::{plan, ExtractionPlan};
pub use worker::{ExtractionWorker, WorkerConfig, WorkerEvent, WorkerHandle};
