use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};
use xpanel_core::Error;

/// Wire shape of every failure: HTTP status from the taxonomy, body carrying
/// the stable code and a safe message. Stack traces and wrapped causes stay
/// in the logs.
#[derive(Debug)]
pub struct ApiError(pub Error);

#[derive(Serialize)]
struct ErrorBody {
    code: u32,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &self.0 {
            // Internal details never leak to clients.
            Error::Internal(detail) => {
                tracing::error!(detail, "internal error surfaced to handler");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), %message, "request failed");
        }
        (status, Json(ErrorBody { code: self.0.code(), message })).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

pub type ApiResult<T = Json<Value>> = Result<T, ApiError>;

/// Success envelope shared by every handler.
pub fn ok(data: impl Serialize) -> Json<Value> {
    Json(json!({"success": true, "data": data}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape() {
        let body = ok(json!({"id": 1}));
        assert_eq!(body.0["success"], true);
        assert_eq!(body.0["data"]["id"], 1);
    }

    #[tokio::test]
    async fn internal_errors_are_masked() {
        let response = ApiError(Error::internal("sqlite said something scary")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["message"], "internal error");
        assert_eq!(body["code"], 50000);
    }

    #[tokio::test]
    async fn quota_exceeded_keeps_specific_code() {
        let response = ApiError(Error::quota_exceeded("limit reached")).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], 40301);
    }
}
