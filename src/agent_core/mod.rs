//! Agent Core — the trust boundary between free text and file tools.
//!
//! Submodules:
//! - `intent_router`: Deterministic rule table mapping input to a routing key
//! - `allowlist`: Name policy and the readable / writable allowlist
//! - `sandbox`: Canonicalization and containment under one root
//! - `gate`: The single allowlist + sandbox check every file operation passes
//! - `tool_registry`: Routing key → privileged operation, one audit event per call
//! - `orchestrator`: Per-turn control flow, fallback, and bounded negotiation
//! - `conversation`: Windowed in-memory history
//! - `audit`: Append-only audit trail with JSONL, SQLite, and in-memory sinks
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod allowlist;
pub mod audit;
pub mod conversation;
pub mod errors;
pub mod gate;
pub mod intent_router;
pub mod orchestrator;
pub mod sandbox;
pub mod tool_registry;
pub mod types;

// Re-exports for convenience
pub use audit::{AuditEvent, AuditEventKind, AuditLog, AuditSink};
pub use conversation::Conversation;
pub use errors::AgentError;
pub use gate::{GateContext, Limits};
pub use intent_router::IntentRouter;
pub use orchestrator::AgentOrchestrator;
pub use tool_registry::ToolRegistry;
pub use types::{ResponseKind, RouteVerdict, RoutingKey, TurnResponse};
