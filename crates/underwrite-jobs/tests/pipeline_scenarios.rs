//! End-to-end pipeline behaviour over the in-memory store and scripted oracle.
//!
//! Covers:
//! - Native-text, scanned-PDF and image documents through method/OCR selection
//! - Retry, exhaustion and immediate rejection
//! - Partial extraction
//! - Cross-document aggregation and borrower matching
//! - Stale-run fencing and recovery

mod common;

use std::time::Duration;

use common::*;
use underwrite_jobs::aggregation::aggregate;
use underwrite_jobs::{
    BlobStore, DispatchOutcome, DocumentStatus, DocumentStore, Error, ExtractionMethod, FileType, MatchConfig,
    OcrMode, OracleError, OracleOutput, RunOutcome, SubmitRequest, TextLayerStats,
};
use underwrite_oracle::mock::{ScriptStep, ScriptedOracle, StaticProbe};

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_native_pdf_uses_structural_without_ocr() {
    let pdf = blob(FileType::Pdf, "w2 three pages");
    let oracle = ScriptedOracle::new().with_output(
        &pdf,
        output(
            vec![
                field("borrower_name", "Jane Doe", 0.95, 1),
                field("address", "12 Harbor Rd, Salem MA", 0.9, 1),
                field("income:wages", "84,000.00", 0.92, 2),
                field("account_number", "0042-7781", 0.88, 3),
            ],
            3,
        ),
    );
    let h = harness(oracle, StaticProbe::new(native_text(3)));

    let doc = h.upload(&pdf, FileType::Pdf).await;
    let view = h.run_to_terminal(doc).await;

    assert_eq!(view.status, DocumentStatus::Completed);
    assert_eq!(view.page_count, Some(3));
    assert_eq!(view.error_message, None);
    assert_eq!(view.poll_after_secs, None);

    let calls = h.oracle.calls_for(&pdf);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].method, ExtractionMethod::Structural);
    assert_eq!(calls[0].ocr, OcrMode::Skip);

    let borrower = h.pipeline.get_borrower("Jane Doe").await.unwrap();
    let pages: Vec<u32> = [
        &borrower.name,
        &borrower.address,
        &borrower.income.first().map(|r| r.field.clone()),
        &borrower.account_numbers.first().cloned(),
    ]
    .iter()
    .filter_map(|f| f.as_ref().map(|f| f.sources[0].page_number))
    .collect();
    assert_eq!(pages, vec![1, 1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_scan_engages_ocr_with_lower_confidence() {
    let fields = || {
        vec![
            field("borrower_name", "Jane Doe", 0.95, 1),
            field("income", "84,000.00", 0.92, 1),
        ]
    };

    let pdf = blob(FileType::Pdf, "native");
    let native = harness(
        ScriptedOracle::new().with_output(&pdf, output(fields(), 1)),
        StaticProbe::new(native_text(1)),
    );
    let native_doc = native.upload(&pdf, FileType::Pdf).await;
    native.run_to_terminal(native_doc).await;

    let png = blob(FileType::Png, "scan");
    let scanned = harness(
        ScriptedOracle::new().with_output(&png, output(fields(), 1)),
        StaticProbe::new(TextLayerStats::no_text(1)),
    );
    let scan_doc = scanned.upload(&png, FileType::Png).await;
    let view = scanned.run_to_terminal(scan_doc).await;
    assert_eq!(view.status, DocumentStatus::Completed);

    let call = &scanned.oracle.calls_for(&png)[0];
    assert_eq!(call.ocr, OcrMode::Force);
    assert_eq!(call.method, ExtractionMethod::Span);

    let a = native.pipeline.get_borrower("jane doe").await.unwrap();
    let b = scanned.pipeline.get_borrower("jane doe").await.unwrap();
    assert!(b.overall_confidence < a.overall_confidence);
}

#[tokio::test(start_paused = true)]
async fn test_scanned_pdf_falls_back_to_ocr() {
    let scanned = blob(FileType::Pdf, "scanned statement");
    let mostly_scanned = blob(FileType::Pdf, "one typed cover page");
    let native = blob(FileType::Pdf, "typed statement");
    let fields = || vec![field("income", "52,000", 0.8, 1)];
    let oracle = ScriptedOracle::new()
        .with_output(&scanned, output(fields(), 2))
        .with_output(&mostly_scanned, output(fields(), 3))
        .with_output(&native, output(fields(), 2));
    // 1 of 3 pages with text: coverage 0.33, below the 0.5 threshold.
    let cover_only = TextLayerStats {
        page_count: 3,
        pages_with_text: 1,
        total_chars: 1_800,
    };
    let probe = StaticProbe::new(native_text(2))
        .with_stats(&scanned, TextLayerStats::no_text(2))
        .with_stats(&mostly_scanned, cover_only);
    let h = harness(oracle, probe);

    for data in [&scanned, &mostly_scanned, &native] {
        let doc = h.upload(data, FileType::Pdf).await;
        let view = h.run_to_terminal(doc).await;
        assert_eq!(view.status, DocumentStatus::Completed);
    }

    let scanned_call = &h.oracle.calls_for(&scanned)[0];
    assert_eq!(scanned_call.file_type, FileType::Pdf);
    assert_eq!(scanned_call.ocr, OcrMode::Force);
    assert_eq!(scanned_call.method, ExtractionMethod::Span);

    // Enough text on the cover for structural parsing, too little coverage
    // to skip OCR.
    let cover_call = &h.oracle.calls_for(&mostly_scanned)[0];
    assert_eq!(cover_call.ocr, OcrMode::Force);
    assert_eq!(cover_call.method, ExtractionMethod::Structural);

    let native_call = &h.oracle.calls_for(&native)[0];
    assert_eq!(native_call.ocr, OcrMode::Skip);
    assert_eq!(native_call.method, ExtractionMethod::Structural);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_timeouts_exhaust_attempts() {
    let pdf = blob(FileType::Pdf, "slow");
    // Slower than the 120s oracle timeout on every attempt.
    let oracle = ScriptedOracle::new().with_script(
        &pdf,
        vec![ScriptStep::ok(output(vec![field("income", "1", 0.9, 1)], 1))
            .after(Duration::from_secs(600))],
    );
    let h = harness(oracle, StaticProbe::new(native_text(1)));

    let doc = h.upload(&pdf, FileType::Pdf).await;
    let view = h.run_to_terminal(doc).await;

    assert_eq!(view.status, DocumentStatus::Failed);
    assert_eq!(
        view.error_message.as_deref(),
        Some("extraction failed after 5 attempt(s): Oracle timed out after 120s")
    );
    assert_eq!(h.oracle.calls_for(&pdf).len(), 5);
    assert!(h.store.all_fields().await.is_empty());
    assert!(h.pipeline.queue().task(doc).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_conflicting_income_keeps_highest_confidence() {
    let w2 = blob(FileType::Pdf, "w2");
    let stmt = blob(FileType::Pdf, "bank statement");
    let oracle = ScriptedOracle::new()
        .with_output(
            &w2,
            output(
                vec![
                    field("borrower_name", "Jane Doe", 0.9, 1),
                    field("income", "84,000.00", 0.9, 1),
                ],
                1,
            ),
        )
        .with_output(
            &stmt,
            output(
                vec![
                    field("borrower_name", "JANE  DOE.", 0.8, 1),
                    field("income", "91,500.00", 0.4, 2),
                ],
                2,
            ),
        );
    let h = harness(oracle, StaticProbe::new(native_text(2)));

    let w2_doc = h.upload(&w2, FileType::Pdf).await;
    h.run_to_terminal(w2_doc).await;
    let stmt_doc = h.upload(&stmt, FileType::Pdf).await;
    h.run_to_terminal(stmt_doc).await;

    let borrower = h.pipeline.get_borrower("jane doe").await.unwrap();
    let income = &borrower.income[0].field;
    assert_eq!(income.value, "84,000.00");
    assert_eq!(income.confidence, 0.9);
    assert_eq!(income.alternatives[0].value, "91,500.00");

    let mut sourced: Vec<_> = income.sources.iter().map(|s| s.document_id).collect();
    sourced.dedup();
    let mut expected = vec![w2_doc, stmt_doc];
    expected.sort();
    assert_eq!(sourced, expected);
    assert_eq!(borrower.source_documents(), expected);
}

// ============================================================================
// FAILURE HANDLING
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_failure_then_success() {
    let pdf = blob(FileType::Pdf, "flaky");
    let oracle = ScriptedOracle::new().with_script(
        &pdf,
        vec![
            ScriptStep::fail(OracleError::ModelUnavailable("503 model loading".into())),
            ScriptStep::ok(output(vec![field("borrower_name", "Ann Lee", 0.9, 1)], 1)),
        ],
    );
    let h = harness(oracle, StaticProbe::new(native_text(1)));
    let doc = h.upload(&pdf, FileType::Pdf).await;

    let (_, first) = h.pipeline.process_next().await.unwrap();
    assert_eq!(
        first,
        RunOutcome::Retrying {
            attempt: 2,
            delay: Duration::from_millis(200),
            error: "Model unavailable: 503 model loading".into(),
        }
    );
    let mid = h.pipeline.get_status(doc).await.unwrap();
    assert_eq!(mid.status, DocumentStatus::Processing);
    assert_eq!(mid.error_message.as_deref(), Some("Model unavailable: 503 model loading"));
    assert_eq!(mid.poll_after_secs, Some(2));

    let view = h.run_to_terminal(doc).await;
    assert_eq!(view.status, DocumentStatus::Completed);
    assert_eq!(view.error_message, None);
    assert_eq!(h.oracle.calls_for(&pdf).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_format_fails_without_retry() {
    let pdf = blob(FileType::Pdf, "corrupt");
    let oracle = ScriptedOracle::new().with_script(
        &pdf,
        vec![ScriptStep::fail(OracleError::UnsupportedFormat(
            "corrupt xref table".into(),
        ))],
    );
    let h = harness(oracle, StaticProbe::new(native_text(1)));
    let doc = h.upload(&pdf, FileType::Pdf).await;

    let view = h.run_to_terminal(doc).await;
    assert_eq!(view.status, DocumentStatus::Failed);
    assert_eq!(
        view.error_message.as_deref(),
        Some("Unsupported format: corrupt xref table")
    );
    assert_eq!(h.oracle.calls_for(&pdf).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_blob_is_not_retried() {
    let h = harness(ScriptedOracle::new(), StaticProbe::new(native_text(1)));
    let doc = uuid::Uuid::new_v4();
    h.pipeline
        .submit(SubmitRequest::new(doc, "uploads/nowhere.pdf", FileType::Pdf))
        .await
        .unwrap();

    let view = h.run_to_terminal(doc).await;
    assert_eq!(view.status, DocumentStatus::Failed);
    assert!(view.error_message.unwrap().contains("nowhere.pdf"));
    assert!(h.oracle.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_blob_read_and_commit_failures_are_retried() {
    let pdf = blob(FileType::Pdf, "storage hiccups");
    let oracle = ScriptedOracle::new().with_output(
        &pdf,
        output(vec![field("borrower_name", "Ann Lee", 0.9, 1)], 1),
    );
    let h = harness(oracle, StaticProbe::new(native_text(1)));
    let doc = h.upload(&pdf, FileType::Pdf).await;

    h.blobs.fail_next_reads(1);
    h.store.fail_next_commits(1);
    let view = h.run_to_terminal(doc).await;

    assert_eq!(view.status, DocumentStatus::Completed);
    // Read failure never reached the oracle; the failed commit did.
    assert_eq!(h.oracle.calls_for(&pdf).len(), 2);
    assert_eq!(h.store.current_fields_for_document(doc).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_declared_hash_mismatch_rejects() {
    let pdf = blob(FileType::Pdf, "tampered");
    let h = harness(ScriptedOracle::new(), StaticProbe::new(native_text(1)));
    let doc = uuid::Uuid::new_v4();
    h.blobs.put("uploads/t.pdf", &pdf).await.unwrap();
    h.pipeline
        .submit(
            SubmitRequest::new(doc, "uploads/t.pdf", FileType::Pdf).with_content_hash("ab".repeat(32)),
        )
        .await
        .unwrap();

    let view = h.run_to_terminal(doc).await;
    assert_eq!(view.status, DocumentStatus::Failed);
    assert!(view.error_message.unwrap().starts_with("content hash mismatch"));
}

#[tokio::test(start_paused = true)]
async fn test_partial_extraction_completes_with_warning() {
    let pdf = blob(FileType::Pdf, "partial");
    let oracle = ScriptedOracle::new().with_output(
        &pdf,
        OracleOutput {
            fields: vec![
                field("borrower_name", "Ann Lee", 0.9, 1),
                field("income", "52,000", 0.7, 2),
                field("address", "4 Elm St", 0.8, 3),
            ],
            pages_failed: vec![2],
            page_count: Some(3),
        },
    );
    let h = harness(oracle, StaticProbe::new(native_text(3)));
    let doc = h.upload(&pdf, FileType::Pdf).await;

    let view = h.run_to_terminal(doc).await;
    assert_eq!(view.status, DocumentStatus::Completed);
    assert_eq!(
        view.error_message.as_deref(),
        Some("extraction failed on page(s) 2")
    );

    let borrower = h.pipeline.get_borrower("ann lee").await.unwrap();
    assert!(borrower.income.is_empty());
    assert_eq!(borrower.address.unwrap().value, "4 Elm St");
}

#[tokio::test(start_paused = true)]
async fn test_no_surviving_fields_fails() {
    let pdf = blob(FileType::Pdf, "all pages failed");
    let oracle = ScriptedOracle::new().with_output(
        &pdf,
        OracleOutput {
            fields: vec![field("income", "52,000", 0.7, 1)],
            pages_failed: vec![1],
            page_count: Some(1),
        },
    );
    let h = harness(oracle, StaticProbe::new(native_text(1)));
    let doc = h.upload(&pdf, FileType::Pdf).await;

    let view = h.run_to_terminal(doc).await;
    assert_eq!(view.status, DocumentStatus::Failed);
    assert_eq!(
        view.error_message.as_deref(),
        Some("no fields extracted; extraction failed on page(s) 1")
    );
}

// ============================================================================
// SUBMISSION & STATUS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_submit_is_idempotent_until_terminal() {
    let pdf = blob(FileType::Pdf, "dup");
    let oracle = ScriptedOracle::new()
        .with_output(&pdf, output(vec![field("income", "1", 0.5, 1)], 1));
    let h = harness(oracle, StaticProbe::new(native_text(1)));

    let doc = uuid::Uuid::new_v4();
    h.blobs.put("uploads/dup.pdf", &pdf).await.unwrap();
    let req = SubmitRequest::new(doc, "uploads/dup.pdf", FileType::Pdf);

    let first = h.pipeline.submit(req.clone()).await.unwrap();
    let second = h.pipeline.submit(req.clone()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.pipeline.queue_stats().await.ready, 1);

    h.run_to_terminal(doc).await;
    assert!(matches!(
        h.pipeline.submit(req).await,
        Err(Error::InvalidTransition {
            from: DocumentStatus::Completed,
            to: DocumentStatus::Pending
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_status_of_unknown_document() {
    let h = harness(ScriptedOracle::new(), StaticProbe::new(native_text(1)));
    let id = uuid::Uuid::new_v4();
    assert!(matches!(
        h.pipeline.get_status(id).await,
        Err(Error::DocumentNotFound(missing)) if missing == id
    ));
    assert!(matches!(
        h.pipeline.get_borrower("Nobody Here").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        h.pipeline.get_borrower(" ,. ").await,
        Err(Error::InvalidInput(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_document_without_name_is_document_scoped() {
    let a = blob(FileType::Pdf, "anon a");
    let b = blob(FileType::Pdf, "anon b");
    let oracle = ScriptedOracle::new()
        .with_output(&a, output(vec![field("income", "10", 0.5, 1)], 1))
        .with_output(&b, output(vec![field("income", "20", 0.5, 1)], 1));
    let h = harness(oracle, StaticProbe::new(native_text(1)));

    let doc_a = h.upload(&a, FileType::Pdf).await;
    let doc_b = h.upload(&b, FileType::Pdf).await;
    h.run_to_terminal(doc_a).await;
    h.run_to_terminal(doc_b).await;

    let keys = h.store.borrower_keys().await.unwrap();
    assert_eq!(keys.len(), 2);
    let rec = h
        .pipeline
        .get_borrower(&format!("document:{}", doc_a))
        .await
        .unwrap();
    assert_eq!(rec.income[0].field.value, "10");
}

// ============================================================================
// AGGREGATION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_stored_borrower_matches_fresh_aggregation() {
    let w2 = blob(FileType::Pdf, "w2");
    let stub = blob(FileType::Pdf, "pay stub");
    let oracle = ScriptedOracle::new()
        .with_output(
            &w2,
            output(
                vec![
                    field("borrower_name", "Jane Doe", 0.9, 1),
                    field("income:wages", "84,000", 0.9, 1),
                    field("account_number", "1234-5678", 0.7, 1),
                ],
                1,
            ),
        )
        .with_output(
            &stub,
            output(
                vec![
                    field("borrower_name", "Jane Doe", 0.85, 1),
                    field("income:wages", "84,000", 0.8, 1),
                    field("account_number", "12345678", 0.9, 1),
                    field("employer", "Acme Corp", 0.95, 1),
                ],
                1,
            ),
        );
    let h = harness(oracle, StaticProbe::new(native_text(1)));
    let d1 = h.upload(&w2, FileType::Pdf).await;
    let d2 = h.upload(&stub, FileType::Pdf).await;
    h.run_to_terminal(d1).await;
    h.run_to_terminal(d2).await;

    let stored = h.store.get_borrower("jane doe").await.unwrap().unwrap();
    let fields = h
        .store
        .current_fields_for_borrowers(&["jane doe".to_string()])
        .await
        .unwrap();
    let recomputed = aggregate("jane doe", &fields, stored.created_at).unwrap();

    assert_eq!(
        serde_json::to_string(&stored).unwrap(),
        serde_json::to_string(&recomputed).unwrap()
    );
    assert_eq!(stored.account_numbers.len(), 1);
    assert_eq!(stored.other_fields["employer"].value, "Acme Corp");
}

#[tokio::test(start_paused = true)]
async fn test_exact_matching_keeps_near_names_apart() {
    let a = blob(FileType::Pdf, "john");
    let b = blob(FileType::Pdf, "jon");
    let oracle = ScriptedOracle::new()
        .with_output(&a, output(vec![field("borrower_name", "John Smith", 0.9, 1)], 1))
        .with_output(&b, output(vec![field("borrower_name", "Jon Smith", 0.9, 1)], 1));
    let h = harness(oracle, StaticProbe::new(native_text(1)));

    let da = h.upload(&a, FileType::Pdf).await;
    let db = h.upload(&b, FileType::Pdf).await;
    h.run_to_terminal(da).await;
    h.run_to_terminal(db).await;

    assert_eq!(
        h.store.borrower_keys().await.unwrap(),
        vec!["john smith".to_string(), "jon smith".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_fuzzy_matching_merges_typo_but_not_relative() {
    let a = blob(FileType::Pdf, "john");
    let b = blob(FileType::Pdf, "jon");
    let c = blob(FileType::Pdf, "mary");
    let oracle = ScriptedOracle::new()
        .with_output(&a, output(vec![field("borrower_name", "John Smith", 0.9, 1)], 1))
        .with_output(&b, output(vec![field("borrower_name", "Jon Smith", 0.7, 1)], 1))
        .with_output(&c, output(vec![field("borrower_name", "Mary Smith", 0.9, 1)], 1));
    let h = harness_with(
        oracle,
        StaticProbe::new(native_text(1)),
        queue_config(),
        MatchConfig::default().with_threshold(0.9),
    );

    for data in [&a, &b, &c] {
        let doc = h.upload(data, FileType::Pdf).await;
        h.run_to_terminal(doc).await;
    }

    assert_eq!(
        h.store.borrower_keys().await.unwrap(),
        vec!["john smith".to_string(), "mary smith".to_string()]
    );
    let john = h.pipeline.get_borrower("john smith").await.unwrap();
    assert_eq!(john.name.unwrap().alternatives[0].value, "Jon Smith");
}

// ============================================================================
// LEASES & RECOVERY
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_expired_lease_run_is_superseded() {
    let pdf = blob(FileType::Pdf, "redelivered");
    let oracle = ScriptedOracle::new()
        .with_output(&pdf, output(vec![field("borrower_name", "Ann Lee", 0.9, 1)], 1));
    let h = harness(oracle, StaticProbe::new(native_text(1)));
    let doc = h.upload(&pdf, FileType::Pdf).await;

    let DispatchOutcome::Leased(stale) = h.pipeline.queue().try_dispatch().await else {
        panic!("expected a lease");
    };
    tokio::time::advance(h.pipeline.queue().config().lease_timeout + Duration::from_secs(1)).await;
    let DispatchOutcome::Leased(fresh) = h.pipeline.queue().try_dispatch().await else {
        panic!("expected redelivery");
    };
    assert_eq!(fresh.attempt, 2);

    assert!(matches!(
        h.pipeline.process(fresh).await,
        RunOutcome::Completed { field_count: 1, .. }
    ));
    assert_eq!(h.pipeline.process(stale).await, RunOutcome::Superseded);

    let view = h.pipeline.get_status(doc).await.unwrap();
    assert_eq!(view.status, DocumentStatus::Completed);
    assert_eq!(h.store.all_fields().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_run_renews_its_lease() {
    let pdf = blob(FileType::Pdf, "slow probe");
    // Probe plus oracle take 160s against a 130s lease.
    let oracle = ScriptedOracle::new().with_script(
        &pdf,
        vec![ScriptStep::ok(output(vec![field("borrower_name", "Ann Lee", 0.9, 1)], 1))
            .after(Duration::from_secs(100))],
    );
    let h = harness_with(
        oracle,
        StaticProbe::new(native_text(1)).after(Duration::from_secs(60)),
        queue_config().with_lease_timeout(Duration::from_secs(130)),
        MatchConfig::default(),
    );
    let doc = h.upload(&pdf, FileType::Pdf).await;

    let first = {
        let pipeline = h.pipeline.clone();
        tokio::spawn(async move { pipeline.process_next().await })
    };
    tokio::time::sleep(Duration::from_secs(135)).await;

    // Past the original expiry the task is still held by the first run.
    assert!(h.pipeline.process_next().await.is_none());
    assert_eq!(h.pipeline.queue_stats().await.leased, 1);
    assert!(h.pipeline.reap_expired().await.is_empty());

    let (document_id, outcome) = first.await.unwrap().unwrap();
    assert_eq!(document_id, doc);
    assert!(matches!(outcome, RunOutcome::Completed { field_count: 1, .. }));
    assert_eq!(h.oracle.calls_for(&pdf).len(), 1);
    assert_eq!(
        h.pipeline.get_status(doc).await.unwrap().status,
        DocumentStatus::Completed
    );
    assert!(h.pipeline.queue().task(doc).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_lease_exhausts_document() {
    let pdf = blob(FileType::Pdf, "abandoned");
    let h = harness_with(
        ScriptedOracle::new(),
        StaticProbe::new(native_text(1)),
        queue_config().with_max_attempts(1),
        MatchConfig::default(),
    );
    let doc = h.upload(&pdf, FileType::Pdf).await;

    let DispatchOutcome::Leased(_lost) = h.pipeline.queue().try_dispatch().await else {
        panic!("expected a lease");
    };
    h.store
        .transition_status(doc, underwrite_jobs::StatusEvent::Dispatched, None)
        .await
        .unwrap();
    tokio::time::advance(h.pipeline.queue().config().lease_timeout + Duration::from_secs(1)).await;

    let reaped = h.pipeline.reap_expired().await;
    assert_eq!(reaped.len(), 1);
    let view = h.pipeline.get_status(doc).await.unwrap();
    assert_eq!(view.status, DocumentStatus::Failed);
    assert!(view
        .error_message
        .unwrap()
        .starts_with("extraction failed after 1 attempt(s)"));
}

#[tokio::test(start_paused = true)]
async fn test_recover_reschedules_unfinished_documents() {
    let pdf = blob(FileType::Pdf, "left over");
    let oracle = ScriptedOracle::new()
        .with_output(&pdf, output(vec![field("borrower_name", "Ann Lee", 0.9, 1)], 1));
    let h = harness(oracle.clone(), StaticProbe::new(native_text(1)));

    // Rows written by a previous process; its in-memory queue is gone.
    let doc = uuid::Uuid::new_v4();
    h.blobs.put("uploads/left.pdf", &pdf).await.unwrap();
    h.store
        .insert_document(&SubmitRequest::new(doc, "uploads/left.pdf", FileType::Pdf))
        .await
        .unwrap();
    assert!(h.pipeline.process_next().await.is_none());

    assert_eq!(h.pipeline.recover().await.unwrap(), 1);
    assert_eq!(h.pipeline.recover().await.unwrap(), 0);
    let view = h.run_to_terminal(doc).await;
    assert_eq!(view.status, DocumentStatus::Completed);
}
