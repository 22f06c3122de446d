use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

/// Typed request failures. Every handler returns these and the single
/// `IntoResponse` impl below turns them into the failure envelope, so
/// no error can escape with a differently-shaped body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("internal server error: {0}")]
    Internal(color_eyre::Report),
}

impl From<color_eyre::Report> for ApiError {
    fn from(report: color_eyre::Report) -> Self {
        ApiError::Internal(report)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Internal failures get a generic message; the report itself only
    /// goes to the logs.
    fn client_message(&self) -> String {
        match self {
            ApiError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(report) = &self {
            tracing::error!(error = ?report, "Request Error");
        }

        let status = self.status();
        let body = json!({
            "statusCode": status.as_u16(),
            "message": self.client_message(),
            "success": false,
            "errors": [],
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::eyre;

    #[test]
    fn status_codes_match_error_kinds() {
        assert_eq!(
            ApiError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Unauthorized("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::Internal(eyre!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn failure_envelope_shape() {
        let response = ApiError::Conflict("User with the same username or email already exists".into())
            .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body["statusCode"], 409);
        assert_eq!(body["success"], false);
        assert_eq!(
            body["message"],
            "User with the same username or email already exists"
        );
        assert!(body["errors"].is_array());
    }

    #[tokio::test]
    async fn internal_errors_are_not_leaked() {
        let response = ApiError::Internal(eyre!("connection refused to 10.0.0.3")).into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body["message"], "Internal server error");
    }
}
