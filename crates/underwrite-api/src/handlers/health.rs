use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::AppState;

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let queue = state.pipeline.queue_stats().await;
    let oracle_healthy = state.pipeline.oracle_healthy().await;
    Json(serde_json::json!({
        "status": if oracle_healthy { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "oracle": { "healthy": oracle_healthy },
        "queue": queue,
    }))
}
