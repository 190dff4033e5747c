use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;

use crate::{ApiError, AppState};

/// Look up a borrower by key or by a name that normalizes to one.
pub async fn get_borrower(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let borrower = state.pipeline.get_borrower(&key).await?;
    Ok(Json(borrower))
}
