//! Model configuration loading and validation.
//!
//! Reads the models YAML referenced by `models_config` in `toolgate.yaml` and
//! resolves environment variables. This file is the single source of truth
//! for model endpoints, credentials, and the fallback chain.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use super::errors::InferenceError;

/// Fallback-chain sentinel handled by the client rather than an endpoint.
pub const STATIC_RESPONSE_KEY: &str = "static_response";

// ─── Public Types ────────────────────────────────────────────────────────────

/// A single model's runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub display_name: String,
    /// Name sent in the request body; defaults to the model key.
    #[serde(default)]
    pub model_name: Option<String>,
    /// OpenAI-compatible base URL, e.g. `http://localhost:11434/v1`.
    pub base_url: String,
    /// Bearer token. Usually `${OPENAI_API_KEY}` in the file.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1024
}

/// Top-level model registry.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    pub active_model: String,
    pub models: HashMap<String, ModelConfig>,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
}

impl ModelsConfig {
    /// Model keys in the order the client should try them: the active model,
    /// then the fallback chain, skipping duplicates, unknown keys, and the
    /// static sentinel.
    pub fn candidate_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for key in std::iter::once(&self.active_model).chain(self.fallback_chain.iter()) {
            if key == STATIC_RESPONSE_KEY || keys.contains(key) {
                continue;
            }
            if self.models.contains_key(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    /// Whether the chain ends in a static canned response.
    pub fn has_static_fallback(&self) -> bool {
        self.fallback_chain.iter().any(|k| k == STATIC_RESPONSE_KEY)
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load and parse the models configuration file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_models_config(path: &Path) -> Result<ModelsConfig, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let interpolated = interpolate_env_vars(&raw);

    let config: ModelsConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to parse models config: {e}"),
        })?;

    if config.candidate_keys().is_empty() {
        return Err(InferenceError::ConfigError {
            reason: format!(
                "active model '{}' not found in config and no fallback available",
                config.active_model
            ),
        });
    }

    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some((var_name, default)) = expr.split_once(":-") {
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
