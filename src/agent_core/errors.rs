//! Agent Core error types.
//!
//! Every per-turn failure is recovered locally into a user-visible message
//! (see [`AgentError::user_message`]) and recorded in the audit log. Only
//! start-up configuration errors are fatal; those live in `crate::config`.

use thiserror::Error;

/// Longest identifier echoed back to the user in a denial message.
const MAX_ECHOED_IDENTIFIER: usize = 64;

/// Errors that can occur during a single agent turn.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The requested identifier failed the syntactic name policy.
    #[error("invalid identifier '{identifier}': {reason}")]
    InvalidIdentifier { identifier: String, reason: String },

    /// The identifier is well-formed but not on the allowlist for the operation.
    #[error("identifier '{identifier}' is not allowlisted for {operation}")]
    NotAllowlisted { identifier: String, operation: String },

    /// The resolved path left the sandbox root.
    #[error("sandbox escape attempt via '{identifier}'")]
    SandboxEscape { identifier: String },

    /// The allowlisted target does not exist under the sandbox root.
    #[error("resource not found: '{identifier}'")]
    NotFound { identifier: String },

    /// A routed request lacked a parameter its operation requires.
    #[error("missing parameter '{name}'")]
    MissingParameter { name: String },

    /// Report content exceeded the configured size limit.
    #[error("report '{identifier}' exceeds {limit} bytes")]
    ReportTooLarge { identifier: String, limit: usize },

    /// A routing key reached the registry without a registered handler.
    #[error("route '{route}' is not registered")]
    RouteNotRegistered { route: String },

    /// The generative responder failed or timed out.
    #[error("generative call failed: {reason}")]
    GenerativeCallFailed { reason: String },

    /// Tool negotiation with the responder exceeded the round cap.
    #[error("negotiation cap of {max_rounds} rounds exceeded")]
    NegotiationCapExceeded { max_rounds: u32 },

    /// Writing an audit record failed.
    #[error("audit log error: {reason}")]
    AuditError { reason: String },

    /// Local filesystem I/O failed after all gates passed.
    #[error("I/O error: {reason}")]
    Io { reason: String },

    /// Database operation failed (SQLite audit backend).
    #[error("database error: {reason}")]
    DatabaseError { reason: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },
}

impl AgentError {
    /// Stable snake_case name used in audit payloads.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::InvalidIdentifier { .. } => "invalid_identifier",
            AgentError::NotAllowlisted { .. } => "not_allowlisted",
            AgentError::SandboxEscape { .. } => "sandbox_escape",
            AgentError::NotFound { .. } => "not_found",
            AgentError::MissingParameter { .. } => "missing_parameter",
            AgentError::ReportTooLarge { .. } => "report_too_large",
            AgentError::RouteNotRegistered { .. } => "route_not_registered",
            AgentError::GenerativeCallFailed { .. } => "generative_call_failed",
            AgentError::NegotiationCapExceeded { .. } => "negotiation_cap_exceeded",
            AgentError::AuditError { .. } => "audit_error",
            AgentError::Io { .. } => "io_error",
            AgentError::DatabaseError { .. } => "database_error",
            AgentError::SerializationError { .. } => "serialization_error",
        }
    }

    /// Message safe to show to the (untrusted) user.
    ///
    /// Never includes internal paths, backend details, or stack traces. The
    /// only caller-controlled text echoed back is the requested identifier,
    /// truncated.
    pub fn user_message(&self) -> String {
        match self {
            AgentError::InvalidIdentifier { identifier, .. } => format!(
                "Invalid resource name: '{}'.",
                echo(identifier)
            ),
            AgentError::NotAllowlisted { identifier, .. } => format!(
                "Access denied: '{}' is not an allowlisted resource.",
                echo(identifier)
            ),
            AgentError::SandboxEscape { identifier } => format!(
                "Access denied: '{}' is outside the permitted area.",
                echo(identifier)
            ),
            AgentError::NotFound { identifier } => {
                format!("Resource not found: '{}'.", echo(identifier))
            }
            AgentError::MissingParameter { name } => {
                format!("The request is missing its {name}.")
            }
            AgentError::ReportTooLarge { limit, .. } => {
                format!("Report not written: content exceeds the {limit}-byte limit.")
            }
            AgentError::RouteNotRegistered { .. } => {
                "Requested action is not permitted.".to_string()
            }
            AgentError::GenerativeCallFailed { .. } => {
                "The assistant is unavailable right now. Please try again later.".to_string()
            }
            AgentError::NegotiationCapExceeded { .. } => {
                "I could not complete that request within the allowed number of steps."
                    .to_string()
            }
            AgentError::AuditError { .. }
            | AgentError::Io { .. }
            | AgentError::DatabaseError { .. }
            | AgentError::SerializationError { .. } => {
                "An internal error occurred; the request was not completed.".to_string()
            }
        }
    }
}

/// Truncate a caller-supplied identifier for echoing.
fn echo(identifier: &str) -> String {
    if identifier.chars().count() <= MAX_ECHOED_IDENTIFIER {
        identifier.to_string()
    } else {
        let head: String = identifier.chars().take(MAX_ECHOED_IDENTIFIER).collect();
        format!("{head}...")
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::DatabaseError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Io {
            reason: e.to_string(),
        }
    }
}
