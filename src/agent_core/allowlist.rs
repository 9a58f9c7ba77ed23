//! The finite set of identifiers privileged operations may touch.
//!
//! Two pieces live here:
//! - [`validate_identifier`]: the syntactic name policy applied before any
//!   filesystem interaction.
//! - [`Allowlist`]: exact-match membership per [`OperationClass`]. Reads are
//!   a pre-declared set of filenames; writes are any policy-valid name whose
//!   extension is declared writable and which does not shadow a readable
//!   entry.

use std::collections::BTreeSet;

use super::errors::AgentError;
use super::types::OperationClass;

/// Longest permitted stem (the part before the extension).
const MAX_STEM_LEN: usize = 64;

/// Longest permitted extension.
const MAX_EXTENSION_LEN: usize = 8;

/// Check an identifier against the name policy.
///
/// Accepted: `<stem>.<ext>` where the stem is 1–64 of `[A-Za-z0-9_-]` and the
/// extension is 1–8 of `[A-Za-z0-9]`. Exactly one dot, no separators, no
/// whitespace, nothing else.
pub fn validate_identifier(raw: &str) -> Result<(), AgentError> {
    let invalid = |reason: &str| AgentError::InvalidIdentifier {
        identifier: raw.to_string(),
        reason: reason.to_string(),
    };

    if raw.is_empty() {
        return Err(invalid("empty name"));
    }
    if raw.contains('/') || raw.contains('\\') {
        return Err(invalid("path separators are not allowed"));
    }

    let mut parts = raw.split('.');
    let stem = parts.next().unwrap_or_default();
    let extension = match (parts.next(), parts.next()) {
        (Some(ext), None) => ext,
        (None, _) => return Err(invalid("an extension is required")),
        (Some(_), Some(_)) => return Err(invalid("exactly one '.' is allowed")),
    };

    if stem.is_empty() || stem.len() > MAX_STEM_LEN {
        return Err(invalid("name must be 1-64 characters before the extension"));
    }
    if !stem
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(invalid("name may only contain letters, digits, '_' and '-'"));
    }
    if extension.is_empty() || extension.len() > MAX_EXTENSION_LEN {
        return Err(invalid("extension must be 1-8 characters"));
    }
    if !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(invalid("extension may only contain letters and digits"));
    }
    Ok(())
}

/// Extension of a policy-valid identifier.
fn extension_of(identifier: &str) -> Option<&str> {
    identifier.rsplit_once('.').map(|(_, ext)| ext)
}

/// Immutable, process-wide allowlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allowlist {
    readable: BTreeSet<String>,
    writable_extensions: BTreeSet<String>,
}

impl Allowlist {
    /// Build the allowlist, rejecting entries that fail the name policy.
    ///
    /// An invalid entry means the configuration is corrupt; callers treat the
    /// error as fatal at start-up.
    pub fn new<R, W>(readable: R, writable_extensions: W) -> Result<Self, AgentError>
    where
        R: IntoIterator,
        R::Item: Into<String>,
        W: IntoIterator,
        W::Item: Into<String>,
    {
        let readable: BTreeSet<String> = readable.into_iter().map(Into::into).collect();
        for entry in &readable {
            validate_identifier(entry)?;
        }

        let writable_extensions: BTreeSet<String> =
            writable_extensions.into_iter().map(Into::into).collect();
        for ext in &writable_extensions {
            if ext.is_empty()
                || ext.len() > MAX_EXTENSION_LEN
                || !ext.chars().all(|c| c.is_ascii_alphanumeric())
            {
                return Err(AgentError::InvalidIdentifier {
                    identifier: ext.clone(),
                    reason: "writable extension must be 1-8 letters or digits".into(),
                });
            }
        }

        Ok(Self {
            readable,
            writable_extensions,
        })
    }

    /// Exact-match membership for the given operation class.
    ///
    /// Callers must run [`validate_identifier`] first.
    pub fn permits(&self, class: OperationClass, identifier: &str) -> bool {
        match class {
            OperationClass::Read => self.readable.contains(identifier),
            OperationClass::Write => {
                !self.readable.contains(identifier)
                    && extension_of(identifier)
                        .map(|ext| self.writable_extensions.contains(ext))
                        .unwrap_or(false)
            }
        }
    }

    /// Readable identifiers in sorted order.
    pub fn readable(&self) -> Vec<String> {
        self.readable.iter().cloned().collect()
    }

    pub fn writable_extensions(&self) -> Vec<String> {
        self.writable_extensions.iter().cloned().collect()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
