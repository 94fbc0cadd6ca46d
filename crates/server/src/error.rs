//! HTTP error type. Every failure leaves the server as an OpenAI-style
//! `{"error": {...}}` body.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

use crate::services::model_manager::ManagerError;
use crate::services::registry::DiscoveryError;
use crate::services::session::SessionError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),
}

#[derive(Serialize)]
pub(crate) struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub(crate) struct ErrorDetail {
    pub message: String,
    pub r#type: &'static str,
    pub param: Option<String>,
    pub code: Option<&'static str>,
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, Option<&'static str>) {
        match self {
            Self::Manager(e) => match e {
                ManagerError::ModelNotFound(_) => (
                    StatusCode::NOT_FOUND,
                    "invalid_request_error",
                    Some("model_not_found"),
                ),
                ManagerError::LoadFailure { .. } => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "server_error",
                    Some("model_load_failed"),
                ),
                ManagerError::ModelBusy(_) => (
                    StatusCode::CONFLICT,
                    "invalid_request_error",
                    Some("model_busy"),
                ),
                ManagerError::CapacityExceeded { .. } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "server_error",
                    Some("insufficient_capacity"),
                ),
                ManagerError::UnloadFailure { .. } => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "server_error",
                    Some("model_unload_failed"),
                ),
                ManagerError::Internal(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None)
                }
            },
            Self::Session(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                Some("generation_failed"),
            ),
            Self::Discovery(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                Some("discovery_failed"),
            ),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error", None),
            Self::NotFound(_) => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                Some("model_not_found"),
            ),
        }
    }

    pub(crate) fn body(&self) -> ErrorBody {
        let (_, r#type, code) = self.parts();
        ErrorBody {
            error: ErrorDetail {
                message: self.to_string(),
                r#type,
                param: None,
                code,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, _, _) = self.parts();
        if status.is_server_error() {
            error!(%status, error = %self, "Request failed");
        }
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(err: impl Into<ApiError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn manager_errors_map_to_http_statuses() {
        assert_eq!(status(ManagerError::ModelNotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status(ManagerError::LoadFailure {
                model: "x".into(),
                reason: "oom".into()
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(status(ManagerError::ModelBusy("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status(ManagerError::CapacityExceeded { limit: 1 }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status(ApiError::BadRequest("no".into())), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn body_uses_openai_shape() {
        let body = serde_json::to_value(ApiError::from(ManagerError::ModelBusy("A".into())).body())
            .unwrap();
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["code"], "model_busy");
        assert!(body["error"]["message"].as_str().unwrap().contains("'A'"));
        assert!(body["error"]["param"].is_null());
    }
}
