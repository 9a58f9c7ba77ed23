//! Per-session message history with a context budget.
//!
//! Responsibilities:
//! - Hold the trusted system prompt and the ordered user/assistant turns
//! - Estimate token usage per message
//! - Build a windowed `Vec<ChatMessage>` for the responder that fits the budget
//!
//! A conversation is owned by one caller and mutated one turn at a time
//! (`&mut Conversation`). Nothing here is shared across conversations.

use crate::inference::types::{ChatMessage, Role};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Default context budget (tokens) for the windowed history.
const DEFAULT_CONTEXT_BUDGET: u32 = 8_192;

/// Average characters per token for English prose. Conservative.
const CHARS_PER_TOKEN: f64 = 3.2;

/// Per-message overhead (role label, formatting tokens).
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Stored user/assistant messages kept per conversation. Older ones are dropped.
pub const MAX_STORED_MESSAGES: usize = 200;

/// Estimate the token count for a string of natural language text.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() as f64 / CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for one message, including overhead.
pub fn estimate_message_tokens(message: &ChatMessage) -> u32 {
    MESSAGE_OVERHEAD_TOKENS + estimate_tokens(message.text())
}

// ─── Conversation ───────────────────────────────────────────────────────────

/// One conversation's history.
#[derive(Debug, Clone)]
pub struct Conversation {
    id: String,
    system_prompt: ChatMessage,
    messages: Vec<ChatMessage>,
    context_budget: u32,
}

impl Conversation {
    /// Start a conversation with a fresh v4 id.
    pub fn new(system_prompt: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            system_prompt: ChatMessage::system(system_prompt),
            messages: Vec::new(),
            context_budget: DEFAULT_CONTEXT_BUDGET,
        }
    }

    /// Override the token budget used by [`Conversation::history`].
    pub fn with_context_budget(mut self, tokens: u32) -> Self {
        self.context_budget = tokens;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of user/assistant messages (excludes the system prompt).
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push_user(&mut self, text: &str) {
        self.push(ChatMessage::user(text));
    }

    pub fn push_assistant(&mut self, text: &str) {
        self.push(ChatMessage::assistant(text));
    }

    /// Append, then drop the oldest messages beyond [`MAX_STORED_MESSAGES`].
    /// Stored history never opens on an assistant message.
    fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
        if self.messages.len() <= MAX_STORED_MESSAGES {
            return;
        }
        let mut drop = self.messages.len() - MAX_STORED_MESSAGES;
        while drop < self.messages.len() - 1 && self.messages[drop].role == Role::Assistant {
            drop += 1;
        }
        self.messages.drain(..drop);
        tracing::debug!(conversation = %self.id, dropped = drop, "stored history capped");
    }

    /// All stored messages, oldest first, without the system prompt.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// System prompt plus the most recent messages that fit the budget.
    ///
    /// The newest message is always included even if it alone exceeds the
    /// budget. The window never starts on an assistant message, so the
    /// responder always sees a user turn first.
    pub fn history(&self) -> Vec<ChatMessage> {
        let mut remaining = self
            .context_budget
            .saturating_sub(estimate_message_tokens(&self.system_prompt));

        let mut start = self.messages.len();
        for (idx, msg) in self.messages.iter().enumerate().rev() {
            let cost = estimate_message_tokens(msg);
            if cost > remaining && start < self.messages.len() {
                break;
            }
            remaining = remaining.saturating_sub(cost);
            start = idx;
        }
        while start < self.messages.len() && self.messages[start].role == Role::Assistant {
            start += 1;
        }

        if start > 0 {
            tracing::debug!(
                conversation = %self.id,
                dropped = start,
                "history window trimmed to context budget"
            );
        }

        std::iter::once(self.system_prompt.clone())
            .chain(self.messages[start..].iter().cloned())
            .collect()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
