//! Upload trigger and status polling.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use uuid::Uuid;

use underwrite_jobs::SubmitRequest;

use crate::{ApiError, AppState};

/// Accept a document whose blob is already stored and queue it for
/// extraction. Resubmitting an unfinished document returns its live task.
pub async fn submit_document(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let submitted = state.pipeline.submit(req).await?;
    Ok((StatusCode::ACCEPTED, Json(submitted)))
}

pub async fn get_document_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.pipeline.get_status(id).await?;
    Ok(Json(view))
}
