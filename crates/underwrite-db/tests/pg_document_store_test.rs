//! PostgreSQL record store tests.
//!
//! Require a running database: `DATABASE_URL=... cargo test -- --ignored`.

use chrono::Utc;
use uuid::Uuid;

use underwrite_db::test_fixtures::test_database_url;
use underwrite_db::{
    AggregatedField, Borrower, Database, DocumentStatus, DocumentStore, Error, ExtractedField,
    ExtractionCommit, FileType, SourceReference, StatusEvent, SubmitRequest,
};

async fn setup() -> Database {
    dotenvy::dotenv().ok();
    let db = Database::connect(&test_database_url())
        .await
        .expect("connect to test database");
    sqlx::migrate!("../../migrations")
        .run(&db.pool)
        .await
        .expect("run migrations");
    db
}

fn field(document_id: Uuid, run_id: Uuid, name: &str, value: &str) -> ExtractedField {
    ExtractedField {
        document_id,
        run_id,
        borrower_key: format!("test borrower {}", document_id),
        field_name: name.to_string(),
        value: value.to_string(),
        confidence: 0.8,
        source: SourceReference {
            document_id,
            page_number: 2,
            section: Some("Employee".to_string()),
            snippet: value.to_string(),
        },
        extracted_at: Utc::now(),
    }
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_document_lifecycle_and_commit() {
    let db = setup().await;
    let store = &db.documents;
    let id = Uuid::new_v4();

    let req = SubmitRequest::new(id, format!("tests/{}.pdf", id), FileType::Pdf);
    let (doc, created) = store.insert_document(&req).await.unwrap();
    assert!(created);
    assert_eq!(doc.status, DocumentStatus::Pending);
    assert_eq!(doc.filename, format!("{}.pdf", id));

    let (_, created) = store.insert_document(&req).await.unwrap();
    assert!(!created);

    let doc = store
        .transition_status(id, StatusEvent::Dispatched, None)
        .await
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Processing);

    let run_id = Uuid::new_v4();
    let f = field(id, run_id, "address", "12 Oak Street");
    let key = f.borrower_key.clone();
    let borrower = Borrower {
        key: key.clone(),
        name: None,
        address: Some(AggregatedField {
            value: f.value.clone(),
            confidence: f.confidence,
            sources: vec![f.source.clone()],
            alternatives: vec![],
        }),
        account_numbers: vec![],
        income: vec![],
        other_fields: Default::default(),
        overall_confidence: 0.8,
        created_at: Utc::now(),
    };

    let doc = store
        .commit_extraction(&ExtractionCommit {
            document_id: id,
            run_id,
            page_count: Some(3),
            fields: vec![f],
            warning: Some("extraction failed on page(s) 3".to_string()),
            borrowers: vec![borrower.clone()],
            retired_borrowers: vec![],
        })
        .await
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(doc.page_count, Some(3));
    assert_eq!(doc.error_message.as_deref(), Some("extraction failed on page(s) 3"));

    let current = store
        .current_fields_for_borrowers(&[key.clone()])
        .await
        .unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].source.section.as_deref(), Some("Employee"));

    let stored = store.get_borrower(&key).await.unwrap().unwrap();
    assert_eq!(stored, borrower);

    // No edge leaves a terminal state.
    let err = store
        .transition_status(id, StatusEvent::Dispatched, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_unknown_document_transition() {
    let db = setup().await;
    let err = db
        .documents
        .transition_status(Uuid::new_v4(), StatusEvent::Dispatched, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DocumentNotFound(_)));
}
