//! In-memory vector store with cosine top-k.

use super::errors::RetrievalError;
use super::loader::Chunk;

/// One embedded chunk.
#[derive(Debug, Clone)]
pub struct Record {
    pub chunk: Chunk,
    /// L2-normalized embedding.
    embedding: Vec<f32>,
}

/// Flat store; every query scores every record.
#[derive(Debug, Clone, Default)]
pub struct VectorStore {
    records: Vec<Record>,
    dim: Option<usize>,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk. All embeddings must share one dimension.
    pub fn add(&mut self, chunk: Chunk, embedding: Vec<f32>) -> Result<(), RetrievalError> {
        match self.dim {
            Some(expected) if expected != embedding.len() => {
                return Err(RetrievalError::DimensionMismatch {
                    expected,
                    actual: embedding.len(),
                })
            }
            None => self.dim = Some(embedding.len()),
            _ => {}
        }
        self.records.push(Record {
            chunk,
            embedding: l2_normalize(embedding),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The `k` most similar records, best first.
    pub fn top_k(&self, query: &[f32], k: usize) -> Vec<(f32, &Record)> {
        let query = l2_normalize(query.to_vec());
        let mut scored: Vec<(f32, &Record)> = self
            .records
            .iter()
            .map(|r| (cosine_similarity(&query, &r.embedding), r))
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }
}

/// L2-normalize a vector. Returns the normalized copy.
fn l2_normalize(vec: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vec.into_iter().map(|v| v / norm).collect()
    } else {
        vec
    }
}

/// Cosine similarity between two L2-normalized vectors (= dot product).
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
