//! Inference — OpenAI-compatible client for generative and embedding calls.
//!
//! This module handles all communication with model endpoints:
//! - Non-streaming chat completions (tools only in negotiation mode)
//! - Embeddings for retrieval
//! - Fallback chain management with an optional static response
//! - Model configuration loading from the models YAML
//!
//! Everything that comes back from here is untrusted text.

pub mod client;
pub mod config;
pub mod errors;
pub mod responder;
pub mod types;

pub use client::InferenceClient;
pub use config::{ModelConfig, ModelsConfig};
pub use errors::InferenceError;
pub use responder::{OfflineResponder, Proposal, Responder};
pub use types::{ChatMessage, Completion, Role, ToolCall, ToolDefinition};
