use crate::models::anthropic::{ErrorBody, ErrorDetail, StreamEvent};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Backend cannot fulfill request: {0}")]
    Capability(String),

    #[error("Backend unreachable: {0}")]
    Connection(String),

    #[error("Rate limited: {0}")]
    RateLimit(String),

    #[error("Backend overloaded: {0}")]
    Overloaded(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Upstream error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl ProxyError {
    /// Classify a reqwest failure into the wire taxonomy.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::Timeout(err.to_string())
        } else if err.is_connect() {
            ProxyError::Connection(err.to_string())
        } else {
            ProxyError::Upstream(err)
        }
    }

    /// The `error.type` string emitted to the client.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Validation(_) => "validation_error",
            ProxyError::Authentication(_) => "authentication_error",
            ProxyError::ModelNotFound(_) => "model_not_found",
            ProxyError::Capability(_) => "capability_error",
            ProxyError::Connection(_) => "connection_error",
            ProxyError::RateLimit(_) => "rate_limit_error",
            ProxyError::Overloaded(_) => "overloaded_error",
            ProxyError::Timeout(_) => "timeout_error",
            ProxyError::Api { .. } => "api_error",
            ProxyError::Serialization(_) => "api_error",
            ProxyError::Upstream(err) => {
                if err.is_timeout() {
                    "timeout_error"
                } else if err.is_connect() {
                    "connection_error"
                } else {
                    "api_error"
                }
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Validation(_) => StatusCode::BAD_REQUEST,
            ProxyError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ProxyError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Capability(_) => StatusCode::BAD_REQUEST,
            ProxyError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Api { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Render as an in-stream error event, for failures after message_start
    /// when the 200 status is already on the wire.
    pub fn to_stream_event(&self) -> StreamEvent {
        StreamEvent::Error {
            error: ErrorDetail {
                r#type: self.error_type().to_string(),
                message: self.to_string(),
            },
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody::new(self.error_type(), self.to_string()));
        (self.status_code(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_statuses() {
        assert_eq!(
            ProxyError::Validation("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::Authentication("no key".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ProxyError::ModelNotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyError::RateLimit("slow down".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ProxyError::Connection("refused".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn api_error_keeps_upstream_status() {
        let err = ProxyError::Api {
            status: 418,
            message: "teapot".into(),
        };
        assert_eq!(err.status_code().as_u16(), 418);
        assert_eq!(err.error_type(), "api_error");
    }

    #[test]
    fn stream_event_carries_type_and_message() {
        let err = ProxyError::Capability("no tool support".into());
        match err.to_stream_event() {
            StreamEvent::Error { error } => {
                assert_eq!(error.r#type, "capability_error");
                assert!(error.message.contains("no tool support"));
            }
            other => panic!("expected error event, got {:?}", other),
        }
    }
}
