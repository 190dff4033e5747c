//! Shared harness for pipeline integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use underwrite_db::{MemoryBlobStore, MemoryDocumentStore};
use underwrite_jobs::{
    BlobStore, CandidateField, DocumentStatusView, ExtractionConfig, FileType, MatchConfig,
    OracleOutput, Pipeline, QueueConfig, SubmitRequest, TextLayerStats,
};
use underwrite_oracle::mock::{ScriptedOracle, StaticProbe};
use uuid::Uuid;

pub const PDF_MAGIC: &[u8] = b"%PDF-1.7\n";
pub const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

pub struct Harness {
    pub pipeline: Pipeline,
    pub store: Arc<MemoryDocumentStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub oracle: ScriptedOracle,
}

/// Fast queue: effectively unlimited rate, short backoff.
pub fn queue_config() -> QueueConfig {
    QueueConfig::default()
        .with_dispatch_rate(1_000)
        .with_backoff(Duration::from_millis(100), Duration::from_secs(1))
}

pub fn harness(oracle: ScriptedOracle, probe: StaticProbe) -> Harness {
    harness_with(oracle, probe, queue_config(), MatchConfig::default())
}

pub fn harness_with(
    oracle: ScriptedOracle,
    probe: StaticProbe,
    queue: QueueConfig,
    matching: MatchConfig,
) -> Harness {
    let store = Arc::new(MemoryDocumentStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let pipeline = Pipeline::builder()
        .store(store.clone())
        .blobs(blobs.clone())
        .oracle(Arc::new(oracle.clone()))
        .probe(Arc::new(probe))
        .extraction_config(ExtractionConfig::default())
        .queue_config(queue)
        .match_config(matching)
        .build()
        .expect("pipeline config is valid");
    Harness {
        pipeline,
        store,
        blobs,
        oracle,
    }
}

/// A blob of the given type whose tail makes it unique.
pub fn blob(file_type: FileType, tag: &str) -> Vec<u8> {
    let magic = match file_type {
        FileType::Pdf => PDF_MAGIC,
        FileType::Png => PNG_MAGIC,
        _ => b"",
    };
    [magic, tag.as_bytes()].concat()
}

pub fn native_text(pages: u32) -> TextLayerStats {
    TextLayerStats {
        page_count: pages,
        pages_with_text: pages,
        total_chars: pages as u64 * 1_800,
    }
}

pub fn field(name: &str, value: &str, confidence: f64, page: u32) -> CandidateField {
    CandidateField {
        name: name.to_string(),
        value: value.to_string(),
        confidence,
        page,
        section: None,
        snippet: format!("{}: {}", name, value),
        borrower: None,
    }
}

pub fn output(fields: Vec<CandidateField>, page_count: u32) -> OracleOutput {
    OracleOutput {
        fields,
        pages_failed: vec![],
        page_count: Some(page_count),
    }
}

impl Harness {
    /// Store `data` and submit it.
    pub async fn upload(&self, data: &[u8], file_type: FileType) -> Uuid {
        let id = Uuid::new_v4();
        let locator = format!("uploads/{}.{}", id, file_type.as_str());
        self.blobs.put(&locator, data).await.unwrap();
        self.pipeline
            .submit(SubmitRequest::new(id, locator, file_type))
            .await
            .unwrap();
        id
    }

    /// Drive the queue until the document is terminal.
    pub async fn run_to_terminal(&self, document_id: Uuid) -> DocumentStatusView {
        for _ in 0..500 {
            let view = self.pipeline.get_status(document_id).await.unwrap();
            if view.status.is_terminal() {
                return view;
            }
            if self.pipeline.process_next().await.is_none() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        panic!("document {} never reached a terminal state", document_id);
    }
}
