//! The generative responder seam.
//!
//! The orchestrator only ever talks to a `dyn Responder`. Output from a
//! responder is untrusted text: it may be appended to history, and in
//! negotiation mode a proposal may be re-routed, but it never decides access
//! on its own.

use async_trait::async_trait;

use super::client::InferenceClient;
use super::errors::InferenceError;
use super::types::{ChatMessage, ToolCall, ToolDefinition};

/// What the responder answered in one negotiation round.
#[derive(Debug, Clone, PartialEq)]
pub enum Proposal {
    /// Plain text; negotiation ends.
    Reply(String),
    /// The responder asks for a privileged operation.
    ToolCall(ToolCall),
}

/// A text-generation capability.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Produce a reply from the ordered history. Never offered tools.
    async fn generate(&self, history: &[ChatMessage]) -> Result<String, InferenceError>;

    /// Produce a reply or a tool proposal. Only called in negotiation mode.
    async fn propose(
        &self,
        history: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<Proposal, InferenceError>;

    /// Short label for logs.
    fn name(&self) -> &str;
}

#[async_trait]
impl Responder for InferenceClient {
    async fn generate(&self, history: &[ChatMessage]) -> Result<String, InferenceError> {
        let completion = self.chat_completion(history, None).await?;
        if completion.is_static {
            return Err(self.exhausted());
        }
        completion.content.ok_or(InferenceError::EmptyResponse)
    }

    async fn propose(
        &self,
        history: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<Proposal, InferenceError> {
        let completion = self.chat_completion(history, Some(tools)).await?;
        if completion.is_static {
            return Err(self.exhausted());
        }
        // One proposal per round; extra calls are dropped.
        if let Some(call) = completion.tool_calls.into_iter().next() {
            return Ok(Proposal::ToolCall(call));
        }
        completion
            .content
            .map(Proposal::Reply)
            .ok_or(InferenceError::EmptyResponse)
    }

    fn name(&self) -> &str {
        self.primary_model_name()
    }
}

impl InferenceClient {
    /// The static fallback text is an outage notice, not an answer: callers
    /// of the responder see the exhausted chain as an error.
    fn exhausted(&self) -> InferenceError {
        InferenceError::AllModelsUnavailable {
            attempted: self.candidate_keys(),
        }
    }
}

// ─── OfflineResponder ────────────────────────────────────────────────────────

/// Responder used when no models config is present.
///
/// Always answers with a fixed notice, so privileged routing keeps working
/// without any network dependency.
#[derive(Debug, Clone, Default)]
pub struct OfflineResponder;

/// Text returned by [`OfflineResponder`].
pub const OFFLINE_REPLY: &str = "No language model is configured, so I can only handle \
     file requests. Try \"what files can you read\" or \"read <file>\".";

#[async_trait]
impl Responder for OfflineResponder {
    async fn generate(&self, _history: &[ChatMessage]) -> Result<String, InferenceError> {
        Ok(OFFLINE_REPLY.to_string())
    }

    async fn propose(
        &self,
        _history: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<Proposal, InferenceError> {
        Ok(Proposal::Reply(OFFLINE_REPLY.to_string()))
    }

    fn name(&self) -> &str {
        "offline"
    }
}
