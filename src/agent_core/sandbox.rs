//! Confinement of privileged file operations beneath one root directory.
//!
//! The root is canonicalized once at construction. [`Sandbox::resolve`]
//! joins a relative fragment to it and proves containment twice:
//!
//! 1. lexically, rejecting absolute paths, prefixes, and any `..` that climbs
//!    above the root;
//! 2. physically, canonicalizing the deepest existing ancestor (and the
//!    target itself when it exists) so symlinks cannot point outside.
//!
//! A [`SandboxPath`] can only be produced by a successful `resolve`.

use std::path::{Component, Path, PathBuf};

use super::errors::AgentError;

/// Canonical absolute path proven to be the sandbox root or beneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPath(PathBuf);

impl SandboxPath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Whether the target currently exists on disk.
    pub fn exists(&self) -> bool {
        self.0.exists()
    }
}

impl AsRef<Path> for SandboxPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Fixed root directory for all privileged file operations.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Create the root directory if needed and canonicalize it.
    pub fn new(root: &Path) -> Result<Self, AgentError> {
        std::fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    /// The canonical root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `fragment` (relative to the root) and verify containment.
    ///
    /// Does not require the target to exist; existence is a separate gate.
    pub fn resolve(&self, fragment: &str) -> Result<SandboxPath, AgentError> {
        let escape = || AgentError::SandboxEscape {
            identifier: fragment.to_string(),
        };

        // Lexical normalization.
        let mut relative = PathBuf::new();
        for component in Path::new(fragment).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !relative.pop() {
                        return Err(escape());
                    }
                }
                Component::RootDir | Component::Prefix(_) => return Err(escape()),
            }
        }
        let joined = self.root.join(&relative);

        // Physical check on the deepest existing ancestor.
        let mut existing = joined.as_path();
        while !existing.exists() {
            existing = match existing.parent() {
                Some(parent) => parent,
                None => return Err(escape()),
            };
        }
        let canonical_existing = existing.canonicalize()?;
        if !canonical_existing.starts_with(&self.root) {
            tracing::error!(
                fragment = %fragment,
                "sandbox: ancestor resolves outside root"
            );
            return Err(escape());
        }

        let resolved = if joined.exists() {
            let canonical = joined.canonicalize()?;
            if !canonical.starts_with(&self.root) {
                tracing::error!(fragment = %fragment, "sandbox: target resolves outside root");
                return Err(escape());
            }
            canonical
        } else {
            let remainder = joined
                .strip_prefix(existing)
                .map_err(|_| escape())?
                .to_path_buf();
            canonical_existing.join(remainder)
        };

        Ok(SandboxPath(resolved))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
