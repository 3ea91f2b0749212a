use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::engine::models::Language;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no {0} sandbox available, retry later")]
    PoolExhausted(Language),
    #[error("failed to upload code: {0}")]
    UploadFailed(String),
    #[error("compilation failed: {0}")]
    CompilationFailed(String),
    #[error("runtime error: {0}")]
    RuntimeFailed(String),
    #[error("execution timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
    /// Logged only; never returned from an execution.
    #[error("cleanup failed: {0}")]
    CleanupFailed(String),
    #[error("sandbox error: {0}")]
    Sandbox(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn status(&self) -> StatusCode {
        match self {
            EngineError::UnsupportedLanguage(_)
            | EngineError::InvalidRequest(_)
            | EngineError::CompilationFailed(_)
            | EngineError::RuntimeFailed(_) => StatusCode::BAD_REQUEST,
            EngineError::TimedOut(_) => StatusCode::REQUEST_TIMEOUT,
            EngineError::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::UploadFailed(_)
            | EngineError::CleanupFailed(_)
            | EngineError::Sandbox(_)
            | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::UnsupportedLanguage(_) => "unsupported_language",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::PoolExhausted(_) => "pool_exhausted",
            EngineError::UploadFailed(_) => "upload_failed",
            EngineError::CompilationFailed(_) => "compilation_failed",
            EngineError::RuntimeFailed(_) => "runtime_failed",
            EngineError::TimedOut(_) => "timed_out",
            EngineError::CleanupFailed(_) => "cleanup_failed",
            EngineError::Sandbox(_) => "sandbox",
            EngineError::Internal(_) => "internal",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry = matches!(self, EngineError::PoolExhausted(_));
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        let mut response = (status, body).into_response();
        if retry {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(format!("{value:#}"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{http::StatusCode, response::IntoResponse};

    use super::EngineError;
    use crate::engine::models::Language;

    #[test]
    fn maps_taxonomy_onto_http_statuses() {
        let cases = [
            (EngineError::UnsupportedLanguage("ruby2".into()), StatusCode::BAD_REQUEST),
            (EngineError::CompilationFailed("x".into()), StatusCode::BAD_REQUEST),
            (EngineError::RuntimeFailed("x".into()), StatusCode::BAD_REQUEST),
            (EngineError::TimedOut(Duration::from_secs(10)), StatusCode::REQUEST_TIMEOUT),
            (EngineError::PoolExhausted(Language::Go), StatusCode::SERVICE_UNAVAILABLE),
            (EngineError::UploadFailed("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (EngineError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{err}");
        }
    }

    #[test]
    fn pool_exhausted_carries_retry_after() {
        let response = EngineError::PoolExhausted(Language::Python).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok()),
            Some("1")
        );
    }

    #[test]
    fn timeout_message_reports_millis() {
        let err = EngineError::TimedOut(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "execution timed out after 1500ms");
    }
}
