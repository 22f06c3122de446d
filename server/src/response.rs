use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

/// Success envelope shared by every endpoint. The HTTP status always
/// matches the embedded `statusCode`.
pub struct ApiResponse<T: Serialize> {
    status: StatusCode,
    data: T,
    message: String,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(status: StatusCode, data: T, message: impl Into<String>) -> Self {
        Self {
            status,
            data,
            message: message.into(),
        }
    }

    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self::new(StatusCode::OK, data, message)
    }

    pub fn created(data: T, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CREATED, data, message)
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let body = json!({
            "statusCode": self.status.as_u16(),
            "data": self.data,
            "message": self.message,
            "success": true,
        });

        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn success_envelope_shape() {
        let response =
            ApiResponse::created(json!({"username": "annlee"}), "User registered successfully")
                .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body["statusCode"], 201);
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "User registered successfully");
        assert_eq!(body["data"]["username"], "annlee");
    }
}
