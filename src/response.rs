use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, GatewayError};

/// JSON error shape shared by error responses and the final NDJSON error line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
}

impl From<&GatewayError> for ErrorBody {
    fn from(err: &GatewayError) -> Self {
        Self {
            error: err.code(),
            message: err.user_message(),
            incident_id: err.incident_id().map(str::to_string),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        // 529 has no canonical reason phrase but is a valid status code.
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut headers = HeaderMap::new();
        if let GatewayError::RateLimited { decision, .. } = &self {
            headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
            headers.insert("x-ratelimit-reset", HeaderValue::from(decision.reset));
        }

        (status, headers, Json(ErrorBody::from(&self))).into_response()
    }
}
