//! Shared types for the agent core.
//!
//! Routing decisions, tool invocations, and turn responses passed between
//! the IntentRouter, ToolRegistry, and AgentOrchestrator. All of these are
//! created fresh per turn and dropped once the response is emitted.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::AgentError;

// ─── Routing ────────────────────────────────────────────────────────────────

/// Closed set of privileged operations a matched intent may select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingKey {
    /// List the allowlisted resource identifiers.
    ListResources,
    /// Read one allowlisted resource through the gate.
    ReadResource,
    /// Read one allowlisted resource and summarize an excerpt generatively.
    SummarizeResource,
    /// Write one report file through the gate.
    WriteReport,
}

impl RoutingKey {
    /// Every routing key, in declaration order.
    pub const ALL: [RoutingKey; 4] = [
        RoutingKey::ListResources,
        RoutingKey::ReadResource,
        RoutingKey::SummarizeResource,
        RoutingKey::WriteReport,
    ];

    /// Stable kebab-case name (matches the serde representation).
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingKey::ListResources => "list-resources",
            RoutingKey::ReadResource => "read-resource",
            RoutingKey::SummarizeResource => "summarize-resource",
            RoutingKey::WriteReport => "write-report",
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the router concluded about one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "key")]
pub enum RouteVerdict {
    /// A rule matched and selected a privileged operation.
    Matched(RoutingKey),
    /// A rule matched and the request must be refused outright.
    Deny,
    /// No rule fired; the caller defers to the generative fallback.
    NoMatch,
}

/// Immutable result of routing one user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingDecision {
    verdict: RouteVerdict,
    rule: Option<&'static str>,
    params: BTreeMap<String, String>,
    raw_input: String,
}

impl RoutingDecision {
    pub(crate) fn new(
        verdict: RouteVerdict,
        rule: Option<&'static str>,
        params: BTreeMap<String, String>,
        raw_input: &str,
    ) -> Self {
        Self {
            verdict,
            rule,
            params,
            raw_input: raw_input.to_string(),
        }
    }

    /// Whether a rule selected a privileged operation.
    pub fn matched(&self) -> bool {
        matches!(self.verdict, RouteVerdict::Matched(_))
    }

    pub fn verdict(&self) -> RouteVerdict {
        self.verdict
    }

    /// The selected routing key, if any.
    pub fn key(&self) -> Option<RoutingKey> {
        match self.verdict {
            RouteVerdict::Matched(key) => Some(key),
            RouteVerdict::Deny | RouteVerdict::NoMatch => None,
        }
    }

    /// Name of the rule that fired (`None` for no-match).
    pub fn rule(&self) -> Option<&'static str> {
        self.rule
    }

    /// Literal parameters captured by the rule's extractor.
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn raw_input(&self) -> &str {
        &self.raw_input
    }
}

// ─── Access Control ─────────────────────────────────────────────────────────

/// Class of privileged operation an identifier is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    Read,
    Write,
}

impl OperationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::Read => "read",
            OperationClass::Write => "write",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Tool Invocation ────────────────────────────────────────────────────────

/// Successful output of a privileged operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutput {
    /// Sorted allowlisted identifiers.
    Listing(Vec<String>),
    /// File content, bounded by `limits.max_read_bytes`.
    Content {
        text: String,
        bytes: usize,
        truncated: bool,
    },
    /// A report was written.
    Written { name: String, bytes: usize },
}

/// Why a privileged operation was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    NotAllowlisted,
    SandboxEscape,
    RouteNotRegistered,
    MissingParameter { name: &'static str },
    ContentTooLarge { limit: usize },
    Io { reason: String },
}

/// Terminal outcome of one privileged operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Ok(ToolOutput),
    Denied(DenialReason),
    Missing,
    InvalidName { reason: String },
}

/// Record of a single registry invocation, consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub key: RoutingKey,
    /// The raw identifier or argument as handed over by the router.
    pub argument: Option<String>,
    pub operation: Option<OperationClass>,
    pub outcome: ToolOutcome,
}

impl ToolInvocation {
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Ok(_))
    }

    /// Translate a gate error into the matching outcome.
    pub fn from_error(
        key: RoutingKey,
        argument: Option<String>,
        operation: Option<OperationClass>,
        err: AgentError,
    ) -> Self {
        let outcome = match err {
            AgentError::InvalidIdentifier { reason, .. } => ToolOutcome::InvalidName { reason },
            AgentError::NotAllowlisted { .. } => ToolOutcome::Denied(DenialReason::NotAllowlisted),
            AgentError::SandboxEscape { .. } => ToolOutcome::Denied(DenialReason::SandboxEscape),
            AgentError::NotFound { .. } => ToolOutcome::Missing,
            AgentError::RouteNotRegistered { .. } => {
                ToolOutcome::Denied(DenialReason::RouteNotRegistered)
            }
            AgentError::ReportTooLarge { limit, .. } => {
                ToolOutcome::Denied(DenialReason::ContentTooLarge { limit })
            }
            other => ToolOutcome::Denied(DenialReason::Io {
                reason: other.to_string(),
            }),
        };
        Self {
            key,
            argument,
            operation,
            outcome,
        }
    }

    /// The equivalent error for a non-ok outcome.
    pub fn as_error(&self) -> Option<AgentError> {
        let identifier = self.argument.clone().unwrap_or_default();
        let operation = self
            .operation
            .map(|op| op.as_str())
            .unwrap_or("unknown")
            .to_string();
        match &self.outcome {
            ToolOutcome::Ok(_) => None,
            ToolOutcome::InvalidName { reason } => Some(AgentError::InvalidIdentifier {
                identifier,
                reason: reason.clone(),
            }),
            ToolOutcome::Missing => Some(AgentError::NotFound { identifier }),
            ToolOutcome::Denied(DenialReason::NotAllowlisted) => {
                Some(AgentError::NotAllowlisted {
                    identifier,
                    operation,
                })
            }
            ToolOutcome::Denied(DenialReason::SandboxEscape) => {
                Some(AgentError::SandboxEscape { identifier })
            }
            ToolOutcome::Denied(DenialReason::RouteNotRegistered) => {
                Some(AgentError::RouteNotRegistered {
                    route: self.key.to_string(),
                })
            }
            ToolOutcome::Denied(DenialReason::MissingParameter { name }) => {
                Some(AgentError::MissingParameter {
                    name: name.to_string(),
                })
            }
            ToolOutcome::Denied(DenialReason::ContentTooLarge { limit }) => {
                Some(AgentError::ReportTooLarge {
                    identifier,
                    limit: *limit,
                })
            }
            ToolOutcome::Denied(DenialReason::Io { reason }) => Some(AgentError::Io {
                reason: reason.clone(),
            }),
        }
    }
}

// ─── Turn Response ──────────────────────────────────────────────────────────

/// Kind of response a turn ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    ToolResult,
    Denied,
    Generative,
    Error,
    CapReached,
}

impl ResponseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseKind::ToolResult => "tool_result",
            ResponseKind::Denied => "denied",
            ResponseKind::Generative => "generative",
            ResponseKind::Error => "error",
            ResponseKind::CapReached => "cap_reached",
        }
    }
}

/// What the orchestrator hands back to the CLI for one turn.
#[derive(Debug, Clone)]
pub struct TurnResponse {
    /// Correlation id shared by every audit event of this turn.
    pub correlation_id: String,
    pub kind: ResponseKind,
    pub text: String,
    /// Number of audit events written (one per state transition).
    pub events_emitted: usize,
}
