use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

#[derive(Debug)]
pub enum ApiError {
    Internal(underwrite_core::Error),
    NotFound(String),
    BadRequest(String),
    Conflict(String),
}

impl From<underwrite_core::Error> for ApiError {
    fn from(err: underwrite_core::Error) -> Self {
        use underwrite_core::Error;
        match err {
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::DocumentNotFound(id) => ApiError::NotFound(format!("document {}", id)),
            Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            Error::InvalidTransition { from, .. } => {
                ApiError::Conflict(format!("document already {}", from))
            }
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Internal(err) => {
                error!(subsystem = "api", error = %err, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use underwrite_core::{DocumentStatus, Error};
    use uuid::Uuid;

    fn status_of(err: Error) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_of(Error::NotFound("borrower 'x'".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(Error::DocumentNotFound(Uuid::nil())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(Error::InvalidInput("bad".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(Error::InvalidTransition {
                from: DocumentStatus::Completed,
                to: DocumentStatus::Pending,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(Error::Storage("disk full".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
