//! Application configuration: `toolgate.yaml`.
//!
//! Resolution order for the config file:
//! 1. `--config <path>` on the command line.
//! 2. The `TOOLGATE_CONFIG` environment variable.
//! 3. `toolgate.yaml` in the current directory or any ancestor.
//!
//! Without a file the built-in defaults apply, rooted at the current
//! directory. Relative paths in the file resolve against the directory that
//! contains it. Every error here is a start-up error and is fatal.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::agent_core::audit::{AuditLog, AuditSink, JsonlAuditSink, SqliteAuditSink};
use crate::agent_core::allowlist::Allowlist;
use crate::agent_core::errors::AgentError;
use crate::agent_core::gate::{GateContext, Limits};
use crate::agent_core::orchestrator::{GenerationConfig, NegotiationConfig};
use crate::inference::client::InferenceClient;
use crate::inference::config::{expand_tilde, interpolate_env_vars, load_models_config};
use crate::inference::errors::InferenceError;
use crate::inference::responder::{OfflineResponder, Responder};
use crate::retrieval::RagConfig;

/// File name searched for in the working directory and its ancestors.
pub const CONFIG_FILE_NAME: &str = "toolgate.yaml";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "TOOLGATE_CONFIG";

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid allowlist: {0}")]
    Allowlist(AgentError),

    #[error("cannot prepare sandbox: {0}")]
    Sandbox(AgentError),

    #[error("cannot open audit log at {path}: {source}")]
    Audit { path: String, source: AgentError },

    #[error("models config: {0}")]
    Models(#[from] InferenceError),
}

// ─── Schema ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AllowlistConfig {
    #[serde(default = "default_readable")]
    pub read: Vec<String>,
    #[serde(default = "default_write_extensions")]
    pub write_extensions: Vec<String>,
}

fn default_readable() -> Vec<String> {
    vec!["public_info.txt".to_string()]
}
fn default_write_extensions() -> Vec<String> {
    vec!["txt".to_string(), "md".to_string()]
}

impl Default for AllowlistConfig {
    fn default() -> Self {
        Self {
            read: default_readable(),
            write_extensions: default_write_extensions(),
        }
    }
}

/// Storage backend for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditBackend {
    #[default]
    Jsonl,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub backend: AuditBackend,
    #[serde(default = "default_audit_path")]
    pub path: String,
}

fn default_audit_path() -> String {
    "logs/audit.jsonl".to_string()
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            backend: AuditBackend::default(),
            path: default_audit_path(),
        }
    }
}

/// Top-level shape of `toolgate.yaml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_sandbox_root")]
    pub sandbox_root: String,
    /// Report directory, relative to the sandbox root.
    #[serde(default = "default_report_dir")]
    pub report_dir: String,
    #[serde(default)]
    pub allowlist: AllowlistConfig,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    /// Optional models config; the offline responder is used without one.
    #[serde(default)]
    pub models_config: Option<String>,
    #[serde(default)]
    pub rag: RagConfig,
}

fn default_sandbox_root() -> String {
    "data/agent_files".to_string()
}
fn default_report_dir() -> String {
    "reports".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sandbox_root: default_sandbox_root(),
            report_dir: default_report_dir(),
            allowlist: AllowlistConfig::default(),
            limits: Limits::default(),
            audit: AuditConfig::default(),
            generation: GenerationConfig::default(),
            negotiation: NegotiationConfig::default(),
            models_config: None,
            rag: RagConfig::default(),
        }
    }
}

// ─── Loading ────────────────────────────────────────────────────────────────

/// Parsed config plus the directory its relative paths resolve against.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: AppConfig,
    pub base_dir: PathBuf,
    /// `None` when running on defaults.
    pub source: Option<PathBuf>,
}

/// Locate the config file. `explicit` wins over the env var and the search.
pub fn find_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(expand_tilde(&path)));
        }
    }

    let cwd = std::env::current_dir().ok()?;
    cwd.ancestors()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|candidate| candidate.is_file())
}

/// Parse a config document after `${VAR}` interpolation.
pub fn parse_config(raw: &str, origin: &str) -> Result<AppConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    // An empty document means "all defaults".
    if interpolated.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
        path: origin.to_string(),
        reason: e.to_string(),
    })
}

/// Locate and load the configuration.
pub fn load(explicit: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    let Some(path) = find_config_path(explicit) else {
        let base_dir = std::env::current_dir().map_err(|e| ConfigError::Read {
            path: ".".into(),
            reason: e.to_string(),
        })?;
        tracing::warn!(base_dir = %base_dir.display(), "no config file found, using defaults");
        return Ok(LoadedConfig {
            config: AppConfig::default(),
            base_dir,
            source: None,
        });
    };

    let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let config = parse_config(&raw, &path.display().to_string())?;

    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    tracing::info!(path = %path.display(), "config loaded");
    Ok(LoadedConfig {
        config,
        base_dir,
        source: Some(path),
    })
}

impl LoadedConfig {
    /// Resolve a configured path: `~` expanded, relative to `base_dir`.
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        let expanded = PathBuf::from(expand_tilde(raw));
        if expanded.is_absolute() {
            expanded
        } else {
            self.base_dir.join(expanded)
        }
    }

    /// Build the shared access gate. Creates the sandbox root.
    pub fn build_gate(&self) -> Result<GateContext, ConfigError> {
        let allowlist = Allowlist::new(
            self.config.allowlist.read.iter().cloned(),
            self.config.allowlist.write_extensions.iter().cloned(),
        )
        .map_err(ConfigError::Allowlist)?;

        let root = self.resolve_path(&self.config.sandbox_root);
        GateContext::new(&root, allowlist, &self.config.report_dir, self.config.limits)
            .map_err(ConfigError::Sandbox)
    }

    /// Open the configured audit backend.
    pub fn open_audit(&self) -> Result<AuditLog, ConfigError> {
        let path = self.resolve_path(&self.config.audit.path);
        let wrap = |source: AgentError| ConfigError::Audit {
            path: path.display().to_string(),
            source,
        };

        let sink: Arc<dyn AuditSink> = match self.config.audit.backend {
            AuditBackend::Jsonl => Arc::new(JsonlAuditSink::open(&path).map_err(wrap)?),
            AuditBackend::Sqlite => {
                Arc::new(SqliteAuditSink::open(&path.to_string_lossy()).map_err(wrap)?)
            }
        };

        tracing::info!(
            backend = ?self.config.audit.backend,
            path = %path.display(),
            "audit log opened"
        );
        Ok(AuditLog::new(sink))
    }

    /// The inference client, when a models config is set.
    pub fn inference_client(&self) -> Result<Option<InferenceClient>, ConfigError> {
        let Some(raw) = self.config.models_config.as_deref() else {
            return Ok(None);
        };
        let models = load_models_config(&self.resolve_path(raw))?;
        let timeout = Duration::from_secs(self.config.generation.timeout_secs.max(1));
        Ok(Some(InferenceClient::with_timeout(models, timeout)?))
    }

    /// The generative responder: the configured model, or offline.
    pub fn build_responder(&self) -> Result<Arc<dyn Responder>, ConfigError> {
        match self.inference_client()? {
            Some(client) => {
                tracing::info!(model = client.primary_model_name(), "using inference client");
                Ok(Arc::new(client))
            }
            None => {
                tracing::info!("no models config, using offline responder");
                Ok(Arc::new(OfflineResponder))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::audit::{AuditEvent, AuditEventKind};
    use crate::agent_core::types::OperationClass;

    fn loaded(dir: &Path, yaml: &str) -> LoadedConfig {
        LoadedConfig {
            config: parse_config(yaml, "test").unwrap(),
            base_dir: dir.to_path_buf(),
            source: None,
        }
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = parse_config("", "test").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.allowlist.read, vec!["public_info.txt"]);
        assert_eq!(config.audit.backend, AuditBackend::Jsonl);
        assert!(!config.negotiation.enabled);
        assert!(config.models_config.is_none());
    }

    #[test]
    fn test_full_document() {
        let yaml = r#"
sandbox_root: /tmp/box
report_dir: out
allowlist:
  read: [a.txt, b.md]
  write_extensions: [md]
limits: { max_read_bytes: 10 }
audit: { backend: sqlite, path: audit.db }
generation: { timeout_secs: 5 }
negotiation: { enabled: true, max_rounds: 2 }
models_config: models.yaml
rag: { docs_dir: docs, top_k: 5, chunk_chars: 400, chunk_overlap: 50 }
"#;
        let config = parse_config(yaml, "test").unwrap();
        assert_eq!(config.report_dir, "out");
        assert_eq!(config.allowlist.read, vec!["a.txt", "b.md"]);
        assert_eq!(config.limits.max_read_bytes, 10);
        assert_eq!(config.limits.preview_chars, 120);
        assert_eq!(config.audit.backend, AuditBackend::Sqlite);
        assert_eq!(config.generation.timeout_secs, 5);
        assert_eq!(config.negotiation.max_rounds, 2);
        assert_eq!(config.models_config.as_deref(), Some("models.yaml"));
        assert_eq!(config.rag.top_k, 5);
        assert_eq!(config.rag.chunking.chunk_chars, 400);
    }

    #[test]
    fn test_env_interpolation_in_config() {
        std::env::set_var("TOOLGATE_TEST_REPORT_DIR", "from_env");
        let config = parse_config(
            "report_dir: ${TOOLGATE_TEST_REPORT_DIR}\nsandbox_root: ${TOOLGATE_TEST_UNSET_ROOT:-box}\n",
            "test",
        )
        .unwrap();
        assert_eq!(config.report_dir, "from_env");
        assert_eq!(config.sandbox_root, "box");
    }

    #[test]
    fn test_malformed_document_is_fatal() {
        let err = parse_config("allowlist: [unclosed", "bad.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_explicit_path_wins() {
        let explicit = PathBuf::from("/nowhere/custom.yaml");
        assert_eq!(find_config_path(Some(&explicit)), Some(explicit));
    }

    #[test]
    fn test_build_gate_resolves_relative_root() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = loaded(dir.path(), "sandbox_root: box\n");
        let gate = cfg.build_gate().unwrap();

        assert!(dir.path().join("box").is_dir());
        assert!(dir.path().join("box").join("reports").is_dir());
        assert!(gate.allowlist().permits(OperationClass::Read, "public_info.txt"));
    }

    #[test]
    fn test_corrupt_allowlist_entry_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = loaded(dir.path(), "allowlist: { read: [\"../secret.txt\"] }\n");
        assert!(matches!(cfg.build_gate(), Err(ConfigError::Allowlist(_))));
    }

    #[test]
    fn test_report_dir_outside_sandbox_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = loaded(dir.path(), "sandbox_root: box\nreport_dir: ../escape\n");
        assert!(matches!(cfg.build_gate(), Err(ConfigError::Sandbox(_))));
    }

    #[test]
    fn test_open_both_audit_backends() {
        let dir = tempfile::tempdir().unwrap();
        for yaml in [
            "audit: { backend: jsonl, path: logs/audit.jsonl }\n",
            "audit: { backend: sqlite, path: logs/audit.db }\n",
        ] {
            let audit = loaded(dir.path(), yaml).open_audit().unwrap();
            audit
                .record(AuditEvent::new(AuditEventKind::InputReceived, "c1", "conv"))
                .unwrap();
            assert_eq!(audit.recent(10).unwrap().len(), 1);
        }
        assert!(dir.path().join("logs/audit.jsonl").is_file());
        assert!(dir.path().join("logs/audit.db").is_file());
    }

    #[test]
    fn test_offline_responder_without_models_config() {
        let dir = tempfile::tempdir().unwrap();
        let responder = loaded(dir.path(), "").build_responder().unwrap();
        assert_eq!(responder.name(), "offline");
    }

    #[test]
    fn test_missing_models_config_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = loaded(dir.path(), "models_config: missing.yaml\n");
        assert!(matches!(cfg.build_responder(), Err(ConfigError::Models(_))));
    }
}
