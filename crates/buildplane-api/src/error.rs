//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    PreconditionFailed(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::PreconditionFailed(msg) => (StatusCode::PRECONDITION_FAILED, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "message": message
        }));

        (status, body).into_response()
    }
}

impl From<buildplane_core::Error> for ApiError {
    fn from(err: buildplane_core::Error) -> Self {
        use buildplane_core::Error;
        match err {
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            Error::Forbidden(msg) => ApiError::Forbidden(msg),
            Error::InvalidState(msg) => ApiError::BadRequest(msg),
            Error::PreconditionFailed(msg) => ApiError::PreconditionFailed(msg),
            Error::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<buildplane_db::DbError> for ApiError {
    fn from(err: buildplane_db::DbError) -> Self {
        buildplane_core::Error::from(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn render(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let cases = [
            (buildplane_core::Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (buildplane_core::Error::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (buildplane_core::Error::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (buildplane_core::Error::InvalidState("x".into()), StatusCode::BAD_REQUEST),
            (
                buildplane_core::Error::PreconditionFailed("x".into()),
                StatusCode::PRECONDITION_FAILED,
            ),
        ];
        for (err, expected) in cases {
            let (status, body) = render(err.into()).await;
            assert_eq!(status, expected);
            assert_eq!(body["message"], "x");
        }
    }

    #[tokio::test]
    async fn test_internal_detail_is_hidden() {
        let err: ApiError =
            buildplane_core::Error::Internal("connection reset by 10.0.0.7".into()).into();
        let (status, body) = render(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "internal error");
    }
}
