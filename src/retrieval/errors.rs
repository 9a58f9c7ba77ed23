//! Retrieval error types.

use thiserror::Error;

use crate::inference::errors::InferenceError;

/// Errors from document loading, embedding, and answering.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("invalid chunking: {chunk_chars} chars with {chunk_overlap} overlap")]
    InvalidChunking {
        chunk_chars: usize,
        chunk_overlap: usize,
    },

    #[error("no documents found in {dir}")]
    EmptyCorpus { dir: String },

    #[error("embedding failed: {0}")]
    Embedding(#[from] InferenceError),

    #[error("expected {expected} embeddings, got {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("answer generation failed: {reason}")]
    Generation { reason: String },
}
