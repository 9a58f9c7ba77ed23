//! Question answering over the local document index.
//!
//! Retrieval has no security role: the docs directory is read directly and
//! nothing here touches the sandbox or the audit trail.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::inference::responder::Responder;
use crate::inference::types::ChatMessage;

use super::embedder::Embedder;
use super::errors::RetrievalError;
use super::loader::{load_and_chunk_all, ChunkConfig};
use super::store::VectorStore;

/// Chunks embedded per request while building the index.
const EMBED_BATCH_SIZE: usize = 32;

const RAG_SYSTEM_PROMPT: &str = "You are a helpful cybersecurity and AI security assistant.";

/// `rag:` section of the config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RagConfig {
    #[serde(default = "default_docs_dir")]
    pub docs_dir: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(flatten)]
    pub chunking: ChunkConfig,
}

fn default_docs_dir() -> String {
    "data/rag_docs".to_string()
}
fn default_top_k() -> usize {
    3
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            docs_dir: default_docs_dir(),
            top_k: default_top_k(),
            embedding_model: default_embedding_model(),
            chunking: ChunkConfig::default(),
        }
    }
}

/// A cited chunk behind an answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub doc_name: String,
    pub chunk_index: usize,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RagAnswer {
    pub text: String,
    pub sources: Vec<Source>,
}

/// Index plus the collaborators needed to answer questions.
pub struct RagEngine {
    store: VectorStore,
    embedder: Arc<dyn Embedder>,
    responder: Arc<dyn Responder>,
    top_k: usize,
    timeout: Duration,
}

impl RagEngine {
    /// Load, chunk, and embed every document under `docs_dir`.
    pub async fn build(
        docs_dir: &Path,
        chunking: ChunkConfig,
        top_k: usize,
        timeout: Duration,
        embedder: Arc<dyn Embedder>,
        responder: Arc<dyn Responder>,
    ) -> Result<Self, RetrievalError> {
        let chunks = load_and_chunk_all(docs_dir, chunking)?;
        if chunks.is_empty() {
            return Err(RetrievalError::EmptyCorpus {
                dir: docs_dir.display().to_string(),
            });
        }

        tracing::info!(chunks = chunks.len(), "embedding chunks");
        let mut store = VectorStore::new();
        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = embedder.embed(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(RetrievalError::CountMismatch {
                    expected: batch.len(),
                    actual: vectors.len(),
                });
            }
            for (chunk, vector) in batch.iter().cloned().zip(vectors) {
                store.add(chunk, vector)?;
            }
        }
        tracing::info!(records = store.len(), "index built");

        Ok(Self {
            store,
            embedder,
            responder,
            top_k,
            timeout,
        })
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Retrieve the top chunks and ask the responder to answer from them.
    pub async fn answer(&self, question: &str) -> Result<RagAnswer, RetrievalError> {
        let query = self
            .embedder
            .embed(&[question.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or(RetrievalError::CountMismatch {
                expected: 1,
                actual: 0,
            })?;

        let top = self.store.top_k(&query, self.top_k);
        let context = top
            .iter()
            .map(|(_, r)| {
                format!(
                    "[{} chunk {}] {}",
                    r.chunk.doc_name, r.chunk.chunk_index, r.chunk.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let sources = top
            .iter()
            .map(|(score, r)| Source {
                doc_name: r.chunk.doc_name.clone(),
                chunk_index: r.chunk.chunk_index,
                score: *score,
            })
            .collect();

        let prompt = format!(
            "Use the context below to answer the user's question.\n\
             If the answer is not in the context, say you are not sure and do not make things up.\n\n\
             Context:\n{context}\n\nQuestion: {question}\nAnswer:"
        );
        let history = vec![
            ChatMessage::system(RAG_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ];

        let text = match tokio::time::timeout(self.timeout, self.responder.generate(&history)).await
        {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                return Err(RetrievalError::Generation {
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(RetrievalError::Generation {
                    reason: format!("timed out after {}s", self.timeout.as_secs()),
                })
            }
        };

        Ok(RagAnswer { text, sources })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::inference::errors::InferenceError;
    use crate::inference::responder::Proposal;
    use crate::inference::types::ToolDefinition;

    /// Bag-of-keywords embedder: one dimension per keyword.
    struct KeywordEmbedder;

    const KEYWORDS: [&str; 3] = ["phishing", "firewall", "password"];

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
            Ok(texts
                .iter()
                .map(|t| {
                    let lower = t.to_lowercase();
                    KEYWORDS
                        .iter()
                        .map(|k| lower.matches(k).count() as f32)
                        .collect()
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct EchoResponder {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Responder for EchoResponder {
        async fn generate(&self, history: &[ChatMessage]) -> Result<String, InferenceError> {
            let prompt = history.last().map(|m| m.text().to_string()).unwrap_or_default();
            self.prompts.lock().unwrap().push(prompt);
            Ok("answer".to_string())
        }

        async fn propose(
            &self,
            _history: &[ChatMessage],
            _tools: &[ToolDefinition],
        ) -> Result<Proposal, InferenceError> {
            Ok(Proposal::Reply("unused".into()))
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    #[tokio::test]
    async fn test_answer_uses_most_relevant_chunk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("phishing.md"), "Phishing emails impersonate banks.").unwrap();
        std::fs::write(dir.path().join("firewall.md"), "A firewall filters traffic.").unwrap();

        let responder = Arc::new(EchoResponder::default());
        let engine = RagEngine::build(
            dir.path(),
            ChunkConfig::default(),
            1,
            Duration::from_secs(5),
            Arc::new(KeywordEmbedder),
            responder.clone(),
        )
        .await
        .unwrap();
        assert_eq!(engine.len(), 2);

        let answer = engine.answer("how does phishing work?").await.unwrap();
        assert_eq!(answer.text, "answer");
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(answer.sources[0].doc_name, "phishing.md");

        let prompts = responder.prompts.lock().unwrap();
        assert!(prompts[0].contains("[phishing.md chunk 0]"));
        assert!(prompts[0].contains("say you are not sure"));
        assert!(!prompts[0].contains("firewall filters"));
    }

    #[tokio::test]
    async fn test_empty_corpus_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = RagEngine::build(
            dir.path(),
            ChunkConfig::default(),
            3,
            Duration::from_secs(5),
            Arc::new(KeywordEmbedder),
            Arc::new(EchoResponder::default()),
        )
        .await;
        assert!(matches!(result, Err(RetrievalError::EmptyCorpus { .. })));
    }

    #[test]
    fn test_rag_config_defaults() {
        let cfg: RagConfig = serde_yaml::from_str("docs_dir: docs\n").unwrap();
        assert_eq!(cfg.docs_dir, "docs");
        assert_eq!(cfg.top_k, 3);
        assert_eq!(cfg.chunking, ChunkConfig::default());
    }
}
