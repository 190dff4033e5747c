//! HTTP boundary for the underwrite pipeline.
//!
//! Routes:
//! - `POST /api/v1/documents` submit an uploaded document for extraction
//! - `GET /api/v1/documents/:id/status` poll extraction status
//! - `GET /api/v1/borrowers/:key` read an aggregated borrower record
//! - `GET /health` liveness with queue and oracle state

pub mod error;
pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use underwrite_jobs::Pipeline;

pub use error::ApiError;

/// Submit payloads are small JSON bodies; blobs are uploaded out of band.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/api/v1/documents", post(handlers::documents::submit_document))
        .route(
            "/api/v1/documents/:id/status",
            get(handlers::documents::get_document_status),
        )
        .route("/api/v1/borrowers/:key", get(handlers::borrowers::get_borrower))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}
