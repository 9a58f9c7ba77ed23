//! AuditLog — append-only, structured record of every security-relevant decision.
//!
//! One [`AuditEvent`] is written per orchestrator state transition. Events are
//! write-once: no sink exposes update or delete, and the SQLite backend
//! enforces it with triggers. Each record is written under a single lock as
//! one unit, so concurrent conversations never interleave within a record.
//!
//! Payloads that carry untrusted file content go through [`content_digest`],
//! which keeps only a bounded preview, the byte length, and a SHA-256 digest.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::errors::AgentError;

// ─── Types ──────────────────────────────────────────────────────────────────

/// Enumerated audit event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    InputReceived,
    RouteMatched,
    RouteDenied,
    RouteNoMatch,
    ToolOk,
    ToolDenied,
    ToolSandboxEscape,
    ToolMissing,
    ToolInvalidName,
    RouteNotAllowlisted,
    ContentBoundary,
    FallbackInvoked,
    FallbackFailed,
    NegotiationRound,
    ProposalRejected,
    NegotiationCapReached,
    ResponseEmitted,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::InputReceived => "input_received",
            AuditEventKind::RouteMatched => "route_matched",
            AuditEventKind::RouteDenied => "route_denied",
            AuditEventKind::RouteNoMatch => "route_no_match",
            AuditEventKind::ToolOk => "tool_ok",
            AuditEventKind::ToolDenied => "tool_denied",
            AuditEventKind::ToolSandboxEscape => "tool_sandbox_escape",
            AuditEventKind::ToolMissing => "tool_missing",
            AuditEventKind::ToolInvalidName => "tool_invalid_name",
            AuditEventKind::RouteNotAllowlisted => "route_not_allowlisted",
            AuditEventKind::ContentBoundary => "content_boundary",
            AuditEventKind::FallbackInvoked => "fallback_invoked",
            AuditEventKind::FallbackFailed => "fallback_failed",
            AuditEventKind::NegotiationRound => "negotiation_round",
            AuditEventKind::ProposalRejected => "proposal_rejected",
            AuditEventKind::NegotiationCapReached => "negotiation_cap_reached",
            AuditEventKind::ResponseEmitted => "response_emitted",
        }
    }

    /// Default severity for this kind.
    pub fn severity(&self) -> Severity {
        match self {
            AuditEventKind::ToolSandboxEscape => Severity::Critical,
            AuditEventKind::RouteDenied
            | AuditEventKind::ToolDenied
            | AuditEventKind::ToolInvalidName
            | AuditEventKind::RouteNotAllowlisted
            | AuditEventKind::FallbackFailed
            | AuditEventKind::ProposalRejected
            | AuditEventKind::NegotiationCapReached => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

/// How urgently a reviewer should look at an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// A single immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditEventKind,
    pub severity: Severity,
    /// Shared by every event of one user turn.
    pub correlation_id: String,
    /// Conversation the turn belongs to.
    pub conversation_id: String,
    /// Structured key/value detail.
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl AuditEvent {
    /// Start a new event with the kind's default severity and an empty payload.
    pub fn new(kind: AuditEventKind, correlation_id: &str, conversation_id: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            severity: kind.severity(),
            correlation_id: correlation_id.to_string(),
            conversation_id: conversation_id.to_string(),
            payload: serde_json::Map::new(),
        }
    }

    /// Add one payload field.
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.get(key)
    }
}

/// Identifies the turn an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnScope {
    pub correlation_id: String,
    pub conversation_id: String,
}

impl TurnScope {
    /// Fresh scope with a new v4 correlation id.
    pub fn new(conversation_id: &str) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
        }
    }

    pub fn event(&self, kind: AuditEventKind) -> AuditEvent {
        AuditEvent::new(kind, &self.correlation_id, &self.conversation_id)
    }
}

// ─── Sinks ──────────────────────────────────────────────────────────────────

/// Durable, append-only storage for audit events.
pub trait AuditSink: Send + Sync {
    /// Append one event atomically.
    fn append(&self, event: &AuditEvent) -> Result<(), AgentError>;

    /// Return up to `limit` most recent events, oldest first.
    fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>, AgentError>;
}

fn lock_error<T>(e: std::sync::PoisonError<T>) -> AgentError {
    AgentError::AuditError {
        reason: format!("lock poisoned: {e}"),
    }
}

/// JSON Lines file sink: one serialized event per line.
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditSink {
    /// Open (or create) the log file in append mode.
    pub fn open(path: &Path) -> Result<Self, AgentError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for JsonlAuditSink {
    fn append(&self, event: &AuditEvent) -> Result<(), AgentError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = self.file.lock().map_err(lock_error)?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| AgentError::AuditError {
                reason: format!("failed to append audit record: {e}"),
            })
    }

    fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>, AgentError> {
        // Hold the write lock so no half-written record is read.
        let _guard = self.file.lock().map_err(lock_error)?;
        let reader = BufReader::new(File::open(&self.path)?);

        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str::<AuditEvent>(&line)?);
        }
        let skip = events.len().saturating_sub(limit);
        Ok(events.split_off(skip))
    }
}

/// SQLite sink. WAL mode, append-only enforced by triggers.
pub struct SqliteAuditSink {
    conn: Mutex<Connection>,
}

impl SqliteAuditSink {
    /// Open (or create) the audit database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, AgentError> {
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                severity TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_correlation
                ON audit_events(correlation_id);

            CREATE TRIGGER IF NOT EXISTS audit_events_no_update
                BEFORE UPDATE ON audit_events
                BEGIN SELECT RAISE(ABORT, 'audit log is append-only'); END;

            CREATE TRIGGER IF NOT EXISTS audit_events_no_delete
                BEFORE DELETE ON audit_events
                BEGIN SELECT RAISE(ABORT, 'audit log is append-only'); END;
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl AuditSink for SqliteAuditSink {
    fn append(&self, event: &AuditEvent) -> Result<(), AgentError> {
        let payload = serde_json::to_string(&event.payload)?;
        let conn = self.conn.lock().map_err(lock_error)?;
        conn.execute(
            "INSERT INTO audit_events
                (timestamp, kind, severity, correlation_id, conversation_id, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.timestamp.to_rfc3339(),
                event.kind.as_str(),
                event.severity.as_str(),
                event.correlation_id,
                event.conversation_id,
                payload,
            ],
        )?;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>, AgentError> {
        let conn = self.conn.lock().map_err(lock_error)?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, kind, severity, correlation_id, conversation_id, payload
             FROM (SELECT * FROM audit_events ORDER BY id DESC LIMIT ?1)
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (timestamp, kind, severity, correlation_id, conversation_id, payload) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| AgentError::SerializationError {
                    reason: format!("bad audit timestamp: {e}"),
                })?
                .with_timezone(&Utc);
            events.push(AuditEvent {
                timestamp,
                kind: serde_json::from_value(serde_json::Value::String(kind))?,
                severity: serde_json::from_value(serde_json::Value::String(severity))?,
                correlation_id,
                conversation_id,
                payload: serde_json::from_str(&payload)?,
            });
        }
        Ok(events)
    }
}

/// In-memory sink for tests and embedding.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event recorded so far.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Events belonging to one turn.
    pub fn events_for(&self, correlation_id: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.correlation_id == correlation_id)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, event: &AuditEvent) -> Result<(), AgentError> {
        self.events.lock().map_err(lock_error)?.push(event.clone());
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>, AgentError> {
        let mut events = self.events.lock().map_err(lock_error)?.clone();
        let skip = events.len().saturating_sub(limit);
        Ok(events.split_off(skip))
    }
}

// ─── AuditLog ───────────────────────────────────────────────────────────────

/// Cloneable handle over a shared sink.
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Append one event and mirror it to the operational log.
    pub fn record(&self, event: AuditEvent) -> Result<(), AgentError> {
        match event.severity {
            Severity::Critical => tracing::error!(
                kind = event.kind.as_str(),
                correlation_id = %event.correlation_id,
                payload = %serde_json::Value::Object(event.payload.clone()),
                "audit"
            ),
            Severity::Warning => tracing::warn!(
                kind = event.kind.as_str(),
                correlation_id = %event.correlation_id,
                "audit"
            ),
            Severity::Info => tracing::debug!(
                kind = event.kind.as_str(),
                correlation_id = %event.correlation_id,
                "audit"
            ),
        }
        self.sink.append(&event)
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>, AgentError> {
        self.sink.recent(limit)
    }
}

// ─── Bounded Payloads ───────────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Bounded description of untrusted content for an audit payload.
///
/// The full body never reaches the log: only `preview_chars` characters
/// (control characters flattened to spaces), the byte length, and a digest.
pub fn content_digest(text: &str, preview_chars: usize) -> serde_json::Value {
    let preview: String = text
        .chars()
        .take(preview_chars)
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    serde_json::json!({
        "bytes": text.len(),
        "sha256": format!("{:x}", Sha256::digest(text.as_bytes())),
        "preview": preview,
        "preview_truncated": text.chars().count() > preview_chars,
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────
