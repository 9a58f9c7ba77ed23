//! Access gate: the single Allowlist + Sandbox check every privileged
//! file operation passes through.
//!
//! [`GateContext::resolve_and_check`] runs four mandatory stages in order:
//!
//! 1. syntactic validation (`InvalidIdentifier`), no filesystem access;
//! 2. allowlist membership (`NotAllowlisted`), before any existence check so
//!    a denial never reveals whether a non-allowlisted file exists;
//! 3. canonicalization + containment (`SandboxEscape`);
//! 4. existence, reads only (`NotFound`).
//!
//! The context is immutable after start-up and shared via `Arc` across
//! conversations.

use std::path::Path;

use serde::Deserialize;

use super::allowlist::{validate_identifier, Allowlist};
use super::errors::AgentError;
use super::sandbox::{Sandbox, SandboxPath};
use super::types::OperationClass;

// ─── Limits ─────────────────────────────────────────────────────────────────

/// Size bounds applied to privileged I/O and audit payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Limits {
    /// Maximum bytes returned from a single read.
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: usize,
    /// Maximum bytes accepted for a single report write.
    #[serde(default = "default_max_report_bytes")]
    pub max_report_bytes: usize,
    /// Characters of untrusted content kept in audit previews.
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

fn default_max_read_bytes() -> usize {
    64 * 1024
}
fn default_max_report_bytes() -> usize {
    64 * 1024
}
fn default_preview_chars() -> usize {
    120
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_read_bytes: default_max_read_bytes(),
            max_report_bytes: default_max_report_bytes(),
            preview_chars: default_preview_chars(),
        }
    }
}

// ─── GateContext ────────────────────────────────────────────────────────────

/// Read-only access-control configuration for the whole process.
#[derive(Debug, Clone)]
pub struct GateContext {
    sandbox: Sandbox,
    allowlist: Allowlist,
    /// Directory (relative to the sandbox root) that receives reports.
    report_dir: String,
    limits: Limits,
}

impl GateContext {
    /// Build the gate, creating the sandbox root and report directory.
    pub fn new(
        sandbox_root: &Path,
        allowlist: Allowlist,
        report_dir: &str,
        limits: Limits,
    ) -> Result<Self, AgentError> {
        let sandbox = Sandbox::new(sandbox_root)?;

        // The report directory itself must stay inside the sandbox.
        let reports = sandbox.resolve(report_dir)?;
        std::fs::create_dir_all(reports.as_path())?;

        tracing::info!(
            root = %sandbox.root().display(),
            report_dir = %report_dir,
            readable = allowlist.readable().len(),
            "access gate initialized"
        );

        Ok(Self {
            sandbox,
            allowlist,
            report_dir: report_dir.to_string(),
            limits,
        })
    }

    pub fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Run all four gates for `raw_identifier` under `class`.
    pub fn resolve_and_check(
        &self,
        class: OperationClass,
        raw_identifier: &str,
    ) -> Result<SandboxPath, AgentError> {
        let result = self.run_gates(class, raw_identifier);
        match &result {
            Ok(path) => tracing::info!(
                operation = class.as_str(),
                identifier = %raw_identifier,
                resolved = %path.as_path().display(),
                "gate: access granted"
            ),
            Err(AgentError::SandboxEscape { .. }) => tracing::error!(
                operation = class.as_str(),
                identifier = %raw_identifier,
                "gate: sandbox escape attempt"
            ),
            Err(e) => tracing::warn!(
                operation = class.as_str(),
                identifier = %raw_identifier,
                reason = e.code(),
                "gate: access denied"
            ),
        }
        result
    }

    fn run_gates(
        &self,
        class: OperationClass,
        raw_identifier: &str,
    ) -> Result<SandboxPath, AgentError> {
        // 1. Syntax
        validate_identifier(raw_identifier)?;

        // 2. Allowlist
        if !self.allowlist.permits(class, raw_identifier) {
            return Err(AgentError::NotAllowlisted {
                identifier: raw_identifier.to_string(),
                operation: class.as_str().to_string(),
            });
        }

        // 3. Containment
        let fragment = match class {
            OperationClass::Read => raw_identifier.to_string(),
            OperationClass::Write => format!("{}/{}", self.report_dir, raw_identifier),
        };
        let path = self
            .sandbox
            .resolve(&fragment)
            .map_err(|e| match e {
                AgentError::SandboxEscape { .. } => AgentError::SandboxEscape {
                    identifier: raw_identifier.to_string(),
                },
                other => other,
            })?;

        // 4. Existence
        match class {
            OperationClass::Read if !path.as_path().is_file() => Err(AgentError::NotFound {
                identifier: raw_identifier.to_string(),
            }),
            OperationClass::Write if path.as_path().is_dir() => Err(AgentError::Io {
                reason: format!("report target '{raw_identifier}' is a directory"),
            }),
            _ => Ok(path),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> (tempfile::TempDir, GateContext) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("agent_files");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("public_info.txt"), "Company policies and FAQs.").unwrap();
        std::fs::write(root.join("confidential.txt"), "Internal projections.").unwrap();

        let allowlist =
            Allowlist::new(["public_info.txt", "faq.md"], ["txt", "md"]).unwrap();
        let gate = GateContext::new(&root, allowlist, "reports", Limits::default()).unwrap();
        (dir, gate)
    }

    #[test]
    fn test_allowlisted_existing_file_is_granted() {
        let (_dir, gate) = gate();
        let path = gate
            .resolve_and_check(OperationClass::Read, "public_info.txt")
            .unwrap();
        assert!(path.as_path().starts_with(gate.sandbox().root()));
    }

    #[test]
    fn test_traversal_is_rejected_before_filesystem() {
        let (_dir, gate) = gate();
        let err = gate
            .resolve_and_check(OperationClass::Read, "../../etc/passwd")
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::InvalidIdentifier { .. } | AgentError::SandboxEscape { .. }
        ));
    }

    #[test]
    fn test_not_allowlisted_regardless_of_existence() {
        let (_dir, gate) = gate();
        // Exists on disk.
        let existing = gate
            .resolve_and_check(OperationClass::Read, "confidential.txt")
            .unwrap_err();
        // Does not exist on disk.
        let absent = gate
            .resolve_and_check(OperationClass::Read, "does_not_exist.txt")
            .unwrap_err();

        assert!(matches!(existing, AgentError::NotAllowlisted { .. }));
        assert!(matches!(absent, AgentError::NotAllowlisted { .. }));
        assert_eq!(
            existing.user_message().replace("confidential", "X"),
            absent.user_message().replace("does_not_exist", "X")
        );
    }

    #[test]
    fn test_allowlisted_but_missing_is_not_found() {
        let (_dir, gate) = gate();
        let err = gate
            .resolve_and_check(OperationClass::Read, "faq.md")
            .unwrap_err();
        assert!(matches!(err, AgentError::NotFound { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_allowlisted_symlink_escape_is_caught_by_containment() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("agent_files");
        std::fs::create_dir_all(&root).unwrap();
        let outside = dir.path().join("secret.txt");
        std::fs::write(&outside, "secret").unwrap();
        std::os::unix::fs::symlink(&outside, root.join("public_info.txt")).unwrap();

        let allowlist = Allowlist::new(["public_info.txt"], ["md"]).unwrap();
        let gate = GateContext::new(&root, allowlist, "reports", Limits::default()).unwrap();

        let err = gate
            .resolve_and_check(OperationClass::Read, "public_info.txt")
            .unwrap_err();
        assert!(matches!(err, AgentError::SandboxEscape { .. }));
    }

    #[test]
    fn test_write_lands_in_report_dir() {
        let (_dir, gate) = gate();
        let path = gate
            .resolve_and_check(OperationClass::Write, "incident.md")
            .unwrap();
        assert_eq!(
            path.as_path(),
            gate.sandbox().root().join("reports").join("incident.md")
        );
    }

    #[test]
    fn test_write_cannot_target_readable_entry_or_other_extension() {
        let (_dir, gate) = gate();
        assert!(matches!(
            gate.resolve_and_check(OperationClass::Write, "public_info.txt"),
            Err(AgentError::NotAllowlisted { .. })
        ));
        assert!(matches!(
            gate.resolve_and_check(OperationClass::Write, "run.sh"),
            Err(AgentError::NotAllowlisted { .. })
        ));
    }

    #[test]
    fn test_report_dir_outside_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let allowlist = Allowlist::new(["a.txt"], ["md"]).unwrap();
        let err = GateContext::new(
            &dir.path().join("root"),
            allowlist,
            "../reports",
            Limits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, AgentError::SandboxEscape { .. }));
    }
}
