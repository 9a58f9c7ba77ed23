//! OpenAI-compatible inference client.
//!
//! Sends non-streaming chat completion and embedding requests to the
//! configured endpoint. Walks the fallback chain when a model is
//! unavailable. The client keeps no per-call state, so a single instance is
//! shared across conversations behind an `Arc`.

use std::time::Duration;

use reqwest::Client as HttpClient;
use serde::Deserialize;
use uuid::Uuid;

use super::config::{ModelConfig, ModelsConfig};
use super::errors::InferenceError;
use super::types::{
    ChatCompletionRequest, ChatMessage, Completion, EmbeddingRequest, EmbeddingResponse,
    ToolCall, ToolDefinition,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default total request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Message used when the chain ends in `static_response`.
pub const STATIC_FALLBACK_MESSAGE: &str = "The language model is not reachable right now. \
     Check that the model server is running or that the API key is set, then try again.";

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for the configured LLM endpoint(s).
pub struct InferenceClient {
    http: HttpClient,
    config: ModelsConfig,
    request_timeout: Duration,
}

impl InferenceClient {
    /// Create a new inference client from the models configuration.
    ///
    /// Does NOT check connectivity; that happens on the first request.
    pub fn from_config(config: ModelsConfig) -> Result<Self, InferenceError> {
        Self::with_timeout(config, REQUEST_TIMEOUT)
    }

    /// Create a client with an explicit per-request timeout.
    pub fn with_timeout(
        config: ModelsConfig,
        request_timeout: Duration,
    ) -> Result<Self, InferenceError> {
        if config.candidate_keys().is_empty() {
            return Err(InferenceError::ConfigError {
                reason: format!("active model '{}' not found in config", config.active_model),
            });
        }

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| InferenceError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            config,
            request_timeout,
        })
    }

    /// Keys of every model the client tries, in order.
    pub fn candidate_keys(&self) -> Vec<String> {
        self.config.candidate_keys()
    }

    /// Display name of the first model the client will try.
    pub fn primary_model_name(&self) -> &str {
        self.config
            .candidate_keys()
            .first()
            .and_then(|k| self.config.models.get(k))
            .map(|m| m.display_name.as_str())
            .unwrap_or("unknown")
    }

    // ─── Chat Completion ─────────────────────────────────────────────────

    /// Send a chat completion request, walking the fallback chain.
    ///
    /// `tools` is `None` for every non-negotiation call, in which case the
    /// request carries no tool surface at all.
    pub async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<Completion, InferenceError> {
        let mut attempted = Vec::new();

        for key in self.config.candidate_keys() {
            let Some(model) = self.config.models.get(&key) else {
                continue;
            };
            match self.try_chat_request(&key, model, messages, tools).await {
                Ok(completion) => return Ok(completion),
                Err(e) if e.is_retriable() => {
                    tracing::warn!(model = %key, error = %e, "model unavailable, trying next in chain");
                    attempted.push(key);
                }
                Err(e) => return Err(e),
            }
        }

        if self.config.has_static_fallback() {
            tracing::warn!(attempted = ?attempted, "all models unavailable, using static response");
            return Ok(Completion {
                content: Some(STATIC_FALLBACK_MESSAGE.to_string()),
                tool_calls: Vec::new(),
                finish_reason: Some("stop".to_string()),
                is_static: true,
            });
        }

        Err(InferenceError::AllModelsUnavailable { attempted })
    }

    /// Attempt a single request to one model.
    async fn try_chat_request(
        &self,
        key: &str,
        model: &ModelConfig,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<Completion, InferenceError> {
        let url = format!("{}/chat/completions", model.base_url.trim_end_matches('/'));
        let body = ChatCompletionRequest {
            model: model.model_name.clone().unwrap_or_else(|| key.to_string()),
            messages: messages.to_vec(),
            tools: tools.map(<[ToolDefinition]>::to_vec),
            tool_choice: tools.map(|_| "auto".to_string()),
            temperature: model.temperature,
            max_tokens: model.max_tokens,
            stream: false,
        };

        // Metadata only; message bodies can be large and untrusted.
        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            has_tools = body.tools.is_some(),
            max_tokens = body.max_tokens,
            "llm request"
        );

        let mut request = self.http.post(&url).json(&body);
        if let Some(api_key) = model.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| self.map_send_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| InferenceError::MalformedResponse {
                reason: format!("failed to read response body: {e}"),
            })?;

        let completion = parse_completion_response(&body_text)?;
        if completion.content.is_none() && completion.tool_calls.is_empty() {
            return Err(InferenceError::EmptyResponse);
        }
        Ok(completion)
    }

    // ─── Embeddings ──────────────────────────────────────────────────────

    /// Embed `inputs` with `embedding_model` against the first candidate
    /// endpoint that answers.
    pub async fn embed(
        &self,
        embedding_model: &str,
        inputs: &[String],
    ) -> Result<Vec<Vec<f32>>, InferenceError> {
        let mut attempted = Vec::new();

        for key in self.config.candidate_keys() {
            let Some(model) = self.config.models.get(&key) else {
                continue;
            };
            let url = format!("{}/embeddings", model.base_url.trim_end_matches('/'));
            let mut request = self.http.post(&url).json(&EmbeddingRequest {
                model: embedding_model,
                input: inputs,
            });
            if let Some(api_key) = model.api_key.as_deref().filter(|k| !k.is_empty()) {
                request = request.bearer_auth(api_key);
            }

            let result = async {
                let response = request.send().await.map_err(|e| self.map_send_error(&url, e))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(InferenceError::HttpError {
                        status: status.as_u16(),
                        body: response.text().await.unwrap_or_default(),
                    });
                }
                response
                    .json::<EmbeddingResponse>()
                    .await
                    .map_err(|e| InferenceError::MalformedResponse {
                        reason: format!("failed to parse embeddings: {e}"),
                    })
            }
            .await;

            match result {
                Ok(mut parsed) => {
                    if parsed.data.len() != inputs.len() {
                        return Err(InferenceError::MalformedResponse {
                            reason: format!(
                                "expected {} embeddings, got {}",
                                inputs.len(),
                                parsed.data.len()
                            ),
                        });
                    }
                    parsed.data.sort_by_key(|d| d.index);
                    return parsed
                        .data
                        .iter()
                        .map(|d| mean_pool_embedding(&d.embedding))
                        .collect();
                }
                Err(e) if e.is_retriable() => {
                    tracing::warn!(model = %key, error = %e, "embedding endpoint unavailable");
                    attempted.push(key);
                }
                Err(e) => return Err(e),
            }
        }

        Err(InferenceError::AllModelsUnavailable { attempted })
    }

    fn map_send_error(&self, url: &str, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout {
                duration_secs: self.request_timeout.as_secs(),
            }
        } else {
            InferenceError::ConnectionFailed {
                endpoint: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

/// Mean-pool per-token embeddings into a single vector.
///
/// A 1D array is returned as-is; a 2D (per-token) array is averaged across
/// the token dimension.
pub fn mean_pool_embedding(embedding: &serde_json::Value) -> Result<Vec<f32>, InferenceError> {
    let as_f32 = |row: &[serde_json::Value]| -> Vec<f32> {
        row.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect()
    };

    match embedding {
        serde_json::Value::Array(arr) if arr.is_empty() => Ok(Vec::new()),
        serde_json::Value::Array(arr) if arr[0].is_number() => Ok(as_f32(arr.as_slice())),
        serde_json::Value::Array(arr) if arr[0].is_array() => {
            let tokens: Vec<Vec<f32>> = arr
                .iter()
                .filter_map(|row| row.as_array().map(|r| as_f32(r.as_slice())))
                .collect();
            let n_tokens = tokens.len();
            let n_dim = tokens.first().map(Vec::len).unwrap_or(0);
            let mut pooled = vec![0.0_f32; n_dim];
            for token in &tokens {
                for (d, val) in token.iter().enumerate().take(n_dim) {
                    pooled[d] += val;
                }
            }
            for val in &mut pooled {
                *val /= n_tokens as f32;
            }
            Ok(pooled)
        }
        _ => Err(InferenceError::MalformedResponse {
            reason: "unexpected embedding format (expected number[] or number[][])".into(),
        }),
    }
}

// ─── Response Parsing ────────────────────────────────────────────────────────

/// Parse a non-streaming chat completion body.
pub fn parse_completion_response(body: &str) -> Result<Completion, InferenceError> {
    #[derive(Deserialize)]
    struct Response {
        choices: Vec<Choice>,
    }

    #[derive(Deserialize)]
    struct Choice {
        message: Message,
        finish_reason: Option<String>,
    }

    #[derive(Deserialize)]
    struct Message {
        content: Option<String>,
        tool_calls: Option<Vec<RawToolCall>>,
    }

    #[derive(Deserialize)]
    struct RawToolCall {
        id: Option<String>,
        function: RawFunction,
    }

    #[derive(Deserialize)]
    struct RawFunction {
        name: String,
        arguments: String,
    }

    let resp: Response =
        serde_json::from_str(body).map_err(|e| InferenceError::MalformedResponse {
            reason: format!("failed to parse completion: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::MalformedResponse {
            reason: "empty choices array".into(),
        })?;

    let mut tool_calls = Vec::new();
    for tc in choice.message.tool_calls.unwrap_or_default() {
        let arguments: serde_json::Value = if tc.function.arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&tc.function.arguments).map_err(|e| {
                InferenceError::ToolCallParseError {
                    raw_response: tc.function.arguments.clone(),
                    reason: format!("invalid JSON: {e}"),
                }
            })?
        };
        tool_calls.push(ToolCall {
            id: tc.id.unwrap_or_else(|| format!("call_{}", Uuid::new_v4())),
            name: tc.function.name,
            arguments,
        });
    }

    Ok(Completion {
        content: choice.message.content.filter(|c| !c.trim().is_empty()),
        tool_calls,
        finish_reason: choice.finish_reason,
        is_static: false,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
