//! ToolRegistry — the closed map from routing keys to privileged operations.
//!
//! Every invocation follows the same lifecycle:
//! registry membership → parameter check → access gate → execute → audit.
//!
//! Membership is checked even though the router can only emit known keys: a
//! key that passed routing must still be registered here, and an
//! unregistered key produces the distinct `route_not_allowlisted` event.
//!
//! Each call to [`ToolRegistry::invoke`] writes exactly one audit event, the
//! orchestrator's `tool-invoked` transition.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::inference::types::{FunctionDefinition, ToolCall, ToolDefinition};

use super::audit::{content_digest, truncate_utf8, AuditEventKind, AuditLog, TurnScope};
use super::errors::AgentError;
use super::gate::GateContext;
use super::sandbox::SandboxPath;
use super::types::{
    DenialReason, OperationClass, RoutingDecision, RoutingKey, ToolInvocation, ToolOutcome,
    ToolOutput,
};

/// Longest raw argument copied into an audit payload.
const MAX_AUDITED_ARGUMENT_BYTES: usize = 256;

// ─── Operations ─────────────────────────────────────────────────────────────

/// The privileged operations the registry can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Return the allowlisted readable identifiers.
    ListAllowlisted,
    /// Read one resource through the gate.
    ReadResource,
    /// Write one report through the gate.
    WriteReport,
}

impl Operation {
    fn class(&self) -> Option<OperationClass> {
        match self {
            Operation::ListAllowlisted => None,
            Operation::ReadResource => Some(OperationClass::Read),
            Operation::WriteReport => Some(OperationClass::Write),
        }
    }
}

// ─── ToolRegistry ───────────────────────────────────────────────────────────

/// Dispatches routed requests to privileged operations under the gate.
pub struct ToolRegistry {
    gate: Arc<GateContext>,
    handlers: BTreeMap<RoutingKey, Operation>,
}

impl ToolRegistry {
    /// Registry with every routing key mapped to its operation.
    pub fn new(gate: Arc<GateContext>) -> Self {
        Self::with_keys(gate, &RoutingKey::ALL)
    }

    /// Registry exposing only `keys`.
    pub fn with_keys(gate: Arc<GateContext>, keys: &[RoutingKey]) -> Self {
        let handlers = keys
            .iter()
            .map(|key| {
                let op = match key {
                    RoutingKey::ListResources => Operation::ListAllowlisted,
                    RoutingKey::ReadResource | RoutingKey::SummarizeResource => {
                        Operation::ReadResource
                    }
                    RoutingKey::WriteReport => Operation::WriteReport,
                };
                (*key, op)
            })
            .collect();
        Self { gate, handlers }
    }

    pub fn is_registered(&self, key: RoutingKey) -> bool {
        self.handlers.contains_key(&key)
    }

    pub fn gate(&self) -> &GateContext {
        &self.gate
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    /// Invoke the operation behind `key` and record the outcome.
    ///
    /// Returns `Err` only when the audit record cannot be written; the
    /// operation's own failures are carried in the returned invocation.
    pub fn invoke(
        &self,
        key: RoutingKey,
        params: &BTreeMap<String, String>,
        audit: &AuditLog,
        scope: &TurnScope,
    ) -> Result<ToolInvocation, AgentError> {
        let invocation = match self.handlers.get(&key) {
            Some(op) => self.execute(key, *op, params),
            None => {
                tracing::warn!(route = %key, "registry: route not registered");
                ToolInvocation::from_error(
                    key,
                    None,
                    None,
                    AgentError::RouteNotRegistered {
                        route: key.to_string(),
                    },
                )
            }
        };

        audit.record(self.audit_event(&invocation, scope))?;
        Ok(invocation)
    }

    fn execute(
        &self,
        key: RoutingKey,
        op: Operation,
        params: &BTreeMap<String, String>,
    ) -> ToolInvocation {
        let class = op.class();
        let name = params.get("name").cloned();
        let denied = |argument: Option<String>, reason: DenialReason| ToolInvocation {
            key,
            argument,
            operation: class,
            outcome: ToolOutcome::Denied(reason),
        };

        let result = match (op, name.as_deref()) {
            (Operation::ListAllowlisted, _) => Ok(ToolOutcome::Ok(ToolOutput::Listing(
                self.gate.allowlist().readable(),
            ))),
            (_, None) => return denied(None, DenialReason::MissingParameter { name: "name" }),
            (Operation::ReadResource, Some(name)) => self.read_resource(name),
            (Operation::WriteReport, Some(name)) => match params.get("content") {
                Some(content) => self.write_report(name, content),
                None => {
                    return denied(
                        Some(name.to_string()),
                        DenialReason::MissingParameter { name: "content" },
                    )
                }
            },
        };

        let argument = if op == Operation::ListAllowlisted {
            None
        } else {
            name
        };
        match result {
            Ok(outcome) => ToolInvocation {
                key,
                argument,
                operation: class,
                outcome,
            },
            Err(e) => ToolInvocation::from_error(key, argument, class, e),
        }
    }

    // ─── Operations ─────────────────────────────────────────────────────

    /// Read up to `max_read_bytes` of an allowlisted resource.
    fn read_resource(&self, name: &str) -> Result<ToolOutcome, AgentError> {
        let path = self.gate.resolve_and_check(OperationClass::Read, name)?;
        let limit = self.gate.limits().max_read_bytes;

        let file = std::fs::File::open(path.as_path())?;
        let mut buf = Vec::with_capacity(limit.min(8192));
        file.take(limit as u64 + 1).read_to_end(&mut buf)?;

        let truncated = buf.len() > limit;
        buf.truncate(limit);
        let text = String::from_utf8_lossy(&buf).into_owned();
        let bytes = buf.len();

        Ok(ToolOutcome::Ok(ToolOutput::Content {
            text,
            bytes,
            truncated,
        }))
    }

    /// Write a report atomically (temp file + rename) into the report dir.
    fn write_report(&self, name: &str, content: &str) -> Result<ToolOutcome, AgentError> {
        let path = self.gate.resolve_and_check(OperationClass::Write, name)?;

        let limit = self.gate.limits().max_report_bytes;
        if content.len() > limit {
            return Ok(ToolOutcome::Denied(DenialReason::ContentTooLarge { limit }));
        }

        write_atomic(&path, content)?;
        tracing::info!(report = %name, bytes = content.len(), "registry: report written");

        Ok(ToolOutcome::Ok(ToolOutput::Written {
            name: name.to_string(),
            bytes: content.len(),
        }))
    }

    // ─── Audit ──────────────────────────────────────────────────────────

    fn audit_event(
        &self,
        invocation: &ToolInvocation,
        scope: &TurnScope,
    ) -> super::audit::AuditEvent {
        let kind = match &invocation.outcome {
            ToolOutcome::Ok(_) => AuditEventKind::ToolOk,
            ToolOutcome::Missing => AuditEventKind::ToolMissing,
            ToolOutcome::InvalidName { .. } => AuditEventKind::ToolInvalidName,
            ToolOutcome::Denied(DenialReason::SandboxEscape) => AuditEventKind::ToolSandboxEscape,
            ToolOutcome::Denied(DenialReason::RouteNotRegistered) => {
                AuditEventKind::RouteNotAllowlisted
            }
            ToolOutcome::Denied(_) => AuditEventKind::ToolDenied,
        };

        let mut event = scope
            .event(kind)
            .with("route", invocation.key.as_str())
            .with(
                "operation",
                invocation
                    .operation
                    .map(|op| op.as_str())
                    .unwrap_or("list"),
            );
        if let Some(arg) = &invocation.argument {
            event = event.with(
                "identifier",
                truncate_utf8(arg, MAX_AUDITED_ARGUMENT_BYTES),
            );
        }

        let preview_chars = self.gate.limits().preview_chars;
        match &invocation.outcome {
            ToolOutcome::Ok(ToolOutput::Listing(items)) => event
                .with("outcome", "ok")
                .with("count", items.len())
                .with("items", items.clone()),
            ToolOutcome::Ok(ToolOutput::Content {
                text, truncated, ..
            }) => event
                .with("outcome", "ok")
                .with("content", content_digest(text, preview_chars))
                .with("truncated", *truncated),
            ToolOutcome::Ok(ToolOutput::Written { bytes, .. }) => event
                .with("outcome", "ok")
                .with("bytes", *bytes),
            other => {
                let reason = invocation
                    .as_error()
                    .map(|e| e.code())
                    .unwrap_or("unknown");
                let detail = match other {
                    ToolOutcome::InvalidName { reason } => reason.clone(),
                    ToolOutcome::Denied(DenialReason::ContentTooLarge { limit }) => {
                        format!("content exceeds {limit} bytes")
                    }
                    ToolOutcome::Denied(DenialReason::MissingParameter { name }) => {
                        format!("missing parameter '{name}'")
                    }
                    _ => String::new(),
                };
                event
                    .with("outcome", "denied")
                    .with("reason", reason)
                    .with("detail", detail)
            }
        }
    }

    // ─── Negotiation Surface ────────────────────────────────────────────

    /// Tool definitions offered to the responder in negotiation mode only.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let registered: BTreeSet<RoutingKey> = self.handlers.keys().copied().collect();
        let name_param = serde_json::json!({
            "type": "object",
            "properties": {"name": {"type": "string", "description": "Resource file name"}},
            "required": ["name"]
        });

        let mut defs = Vec::new();
        if registered.contains(&RoutingKey::ListResources) {
            defs.push(definition(
                "list_resources",
                "List the resources that may be read.",
                serde_json::json!({"type": "object", "properties": {}}),
            ));
        }
        if registered.contains(&RoutingKey::ReadResource) {
            defs.push(definition(
                "read_resource",
                "Read one allowlisted resource by file name.",
                name_param,
            ));
        }
        if registered.contains(&RoutingKey::WriteReport) {
            defs.push(definition(
                "write_report",
                "Write a .txt or .md report.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "content": {"type": "string"}
                    },
                    "required": ["name", "content"]
                }),
            ));
        }
        defs
    }
}

fn definition(name: &str, description: &str, parameters: serde_json::Value) -> ToolDefinition {
    ToolDefinition {
        r#type: "function".to_string(),
        function: FunctionDefinition {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        },
    }
}

/// A proposed tool call re-expressed as plain command text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalCommand {
    /// The routing key the proposal claims.
    pub key: RoutingKey,
    /// Command text to feed back through the IntentRouter.
    pub text: String,
    /// Parameters the router must extract from `text` for the proposal to stand.
    pub params: BTreeMap<String, String>,
}

impl CanonicalCommand {
    /// Whether a routing decision for `text` reproduces exactly this proposal.
    pub fn matches(&self, decision: &RoutingDecision) -> bool {
        decision.key() == Some(self.key) && decision.params() == &self.params
    }
}

/// Re-express a responder's proposed tool call as plain command text.
///
/// The caller feeds the text back through the IntentRouter and only
/// proceeds when [`CanonicalCommand::matches`] holds, so a proposal reaches
/// the registry only if the deterministic rules would have accepted the same
/// request, with the same arguments, from the user. Unknown tools and
/// non-string arguments yield `None`.
pub fn canonical_command(call: &ToolCall) -> Option<CanonicalCommand> {
    let arg = |key: &str| call.arguments.get(key).and_then(|v| v.as_str());
    let name = call.name.rsplit('.').next().unwrap_or(&call.name);
    let (key, text, params) = match name {
        "list_resources" => (RoutingKey::ListResources, "list files".to_string(), vec![]),
        "read_resource" => {
            let target = arg("name")?;
            (
                RoutingKey::ReadResource,
                format!("read {target}"),
                vec![("name", target)],
            )
        }
        "write_report" => {
            let (target, content) = (arg("name")?, arg("content")?);
            (
                RoutingKey::WriteReport,
                format!("write report {target}: {content}"),
                vec![("name", target), ("content", content)],
            )
        }
        _ => return None,
    };
    Some(CanonicalCommand {
        key,
        text,
        params: params
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    })
}

/// Write to a temp sibling, then rename over the target.
fn write_atomic(path: &SandboxPath, content: &str) -> Result<(), AgentError> {
    let target = path.as_path();
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = target.with_file_name(format!(".{file_name}.tmp"));

    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    std::fs::rename(&tmp, target)?;

    tracing::debug!(
        sha256 = %format!("{:x}", Sha256::digest(content.as_bytes())),
        "registry: atomic write complete"
    );
    Ok(())
}

// ─── Tests ──────────────────────────────────────────────────────────────────
