//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility. These types carry the context needed to
//! build meaningful log entries and audit payloads.

use thiserror::Error;

/// Errors that can occur while talking to a generative or embedding endpoint.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The model endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// The model proposed a tool call whose arguments are not valid JSON.
    #[error("tool call parse error: {reason}")]
    ToolCallParseError { raw_response: String, reason: String },

    /// Every model in the fallback chain was unavailable.
    #[error("all models unavailable (tried: {})", attempted.join(", "))]
    AllModelsUnavailable { attempted: Vec<String> },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The response body could not be understood.
    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String },

    /// The model returned no usable text.
    #[error("empty response from model")]
    EmptyResponse,

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl InferenceError {
    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Whether an error should move the client to the next model in the chain.
    ///
    /// HTTP 404 is included because Ollama answers 404 for a model that is
    /// not pulled; the next model in the chain may still be available.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            InferenceError::ConnectionFailed { .. }
                | InferenceError::Timeout { .. }
                | InferenceError::EmptyResponse
                | InferenceError::HttpError { status: 404, .. }
                | InferenceError::HttpError { status: 429, .. }
                | InferenceError::HttpError {
                    status: 500..=504,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_http_error() {
        let err = InferenceError::HttpError {
            status: 500,
            body: "test body".to_string(),
        };
        assert_eq!(err.error_body(), Some("test body"));
    }

    #[test]
    fn test_error_body_non_http() {
        let err = InferenceError::Timeout { duration_secs: 5 };
        assert!(err.error_body().is_none());
    }

    #[test]
    fn test_is_retriable() {
        assert!(InferenceError::ConnectionFailed {
            endpoint: "".into(),
            reason: "".into()
        }
        .is_retriable());
        assert!(InferenceError::Timeout { duration_secs: 5 }.is_retriable());
        assert!(InferenceError::HttpError {
            status: 404,
            body: "model not found".into()
        }
        .is_retriable());
        assert!(InferenceError::HttpError {
            status: 503,
            body: "".into()
        }
        .is_retriable());
        assert!(!InferenceError::HttpError {
            status: 401,
            body: "bad key".into()
        }
        .is_retriable());
        assert!(!InferenceError::MalformedResponse { reason: "".into() }.is_retriable());
    }

    #[test]
    fn test_all_models_unavailable_lists_attempts() {
        let err = InferenceError::AllModelsUnavailable {
            attempted: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "all models unavailable (tried: a, b)");
    }
}
