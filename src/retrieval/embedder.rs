//! Embedding seam for retrieval.

use std::sync::Arc;

use async_trait::async_trait;

use crate::inference::client::InferenceClient;

use super::errors::RetrievalError;

/// Turns texts into vectors, one per input, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError>;
}

/// Embeds through the OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbedder {
    client: Arc<InferenceClient>,
    model: String,
}

impl HttpEmbedder {
    pub fn new(client: Arc<InferenceClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        let vectors = self.client.embed(&self.model, texts).await?;
        if vectors.len() != texts.len() {
            return Err(RetrievalError::CountMismatch {
                expected: texts.len(),
                actual: vectors.len(),
            });
        }
        Ok(vectors)
    }
}
