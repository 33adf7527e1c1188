//! Transport-specific error types

use thiserror::Error;

use crate::types::Response;

/// Errors that can occur while executing a request through the transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("There are no living connections")]
    NoLivingConnections,

    #[error("Response error: {reason} (status {status})")]
    Response {
        status: u16,
        reason: String,
        response: Box<Response>,
    },

    #[error("Request aborted")]
    RequestAborted,
}

impl TransportError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            TransportError::Configuration(_) => "configuration",
            TransportError::Serialization(_) => "serialization",
            TransportError::Deserialization(_) => "deserialization",
            TransportError::Timeout(_) => "timeout",
            TransportError::Connection(_) => "connection",
            TransportError::NoLivingConnections => "no_living_connections",
            TransportError::Response { .. } => "response",
            TransportError::RequestAborted => "request_aborted",
        }
    }

    /// Whether another node may be able to serve the request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::Connection(_)
        )
    }

    /// Build a `Response` error, deriving the message from the body's
    /// `error.type` field when the service provides one.
    pub fn from_response(response: Response) -> Self {
        let reason = response
            .body
            .as_json()
            .and_then(|body| body.get("error"))
            .and_then(|error| error.get("type"))
            .and_then(|t| t.as_str())
            .map(|t| t.to_string())
            .unwrap_or_else(|| "Response Error".to_string());

        TransportError::Response {
            status: response.status_code,
            reason,
            response: Box::new(response),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RequestMeta, ResponseBody};

    fn response_with_body(status: u16, body: ResponseBody) -> Response {
        Response {
            body,
            status_code: status,
            headers: reqwest::header::HeaderMap::new(),
            warnings: None,
            meta: RequestMeta::new("1".to_string(), "test".to_string()),
        }
    }

    #[test]
    fn test_error_type_all_variants() {
        let cases: Vec<(TransportError, &str)> = vec![
            (TransportError::Configuration("".into()), "configuration"),
            (TransportError::Serialization("".into()), "serialization"),
            (
                TransportError::Deserialization("".into()),
                "deserialization",
            ),
            (TransportError::Timeout(30_000), "timeout"),
            (TransportError::Connection("".into()), "connection"),
            (
                TransportError::NoLivingConnections,
                "no_living_connections",
            ),
            (TransportError::RequestAborted, "request_aborted"),
        ];

        for (err, expected) in cases {
            assert_eq!(err.error_type(), expected, "Failed for variant {:?}", err);
        }
    }

    #[test]
    fn test_retryable() {
        assert!(TransportError::Timeout(1000).is_retryable());
        assert!(TransportError::Connection("reset".into()).is_retryable());

        assert!(!TransportError::Configuration("bad".into()).is_retryable());
        assert!(!TransportError::NoLivingConnections.is_retryable());
        assert!(!TransportError::RequestAborted.is_retryable());
        assert!(!TransportError::Serialization("bad".into()).is_retryable());
    }

    #[test]
    fn test_response_error_reason_from_body() {
        let body = ResponseBody::Json(serde_json::json!({
            "error": { "type": "index_not_found_exception" }
        }));
        let err = TransportError::from_response(response_with_body(404, body));
        match err {
            TransportError::Response { status, reason, .. } => {
                assert_eq!(status, 404);
                assert_eq!(reason, "index_not_found_exception");
            }
            other => panic!("Expected Response error, got {:?}", other),
        }
    }

    #[test]
    fn test_response_error_fallback_reason() {
        let err = TransportError::from_response(response_with_body(
            500,
            ResponseBody::Text("oops".into()),
        ));
        assert!(err.to_string().contains("Response Error"));
        assert!(err.to_string().contains("500"));
    }
}
