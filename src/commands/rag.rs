//! `toolgate rag`: question answering over local markdown docs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};

use crate::config::LoadedConfig;
use crate::retrieval::{HttpEmbedder, RagAnswer, RagEngine};

use super::{next_input, say};

const BANNER: &str = "RAG assistant ready. Ask about the indexed documents. \
     Type 'exit' or 'quit' to stop.";

fn render(answer: &RagAnswer) -> String {
    if answer.sources.is_empty() {
        return format!("Assistant: {}", answer.text);
    }
    let sources: Vec<String> = answer
        .sources
        .iter()
        .map(|s| format!("{}#{} ({:.2})", s.doc_name, s.chunk_index, s.score))
        .collect();
    format!("Assistant: {}\nSources: {}", answer.text, sources.join(", "))
}

/// Answer questions until end of input or an exit word.
pub async fn run_session<R, W>(engine: &RagEngine, input: R, out: &mut W) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut turns = 0;

    say(out, BANNER).await?;
    while let Some(question) = next_input(&mut lines, out, "You: ").await? {
        turns += 1;
        match engine.answer(&question).await {
            Ok(answer) => say(out, &render(&answer)).await?,
            Err(e) => {
                tracing::warn!(error = %e, "rag answer failed");
                say(out, "Assistant: (could not answer, try again)").await?;
            }
        }
    }
    Ok(turns)
}

pub async fn run(loaded: &LoadedConfig) -> anyhow::Result<()> {
    let client = loaded
        .inference_client()?
        .context("rag needs `models_config` set for embeddings and answers")?;
    let client = Arc::new(client);

    let rag = &loaded.config.rag;
    let docs_dir = loaded.resolve_path(&rag.docs_dir);
    let embedder = Arc::new(HttpEmbedder::new(client.clone(), rag.embedding_model.clone()));
    let timeout = Duration::from_secs(loaded.config.generation.timeout_secs.max(1));

    let engine = RagEngine::build(&docs_dir, rag.chunking, rag.top_k, timeout, embedder, client)
        .await
        .with_context(|| format!("failed to index {}", docs_dir.display()))?;

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    run_session(&engine, stdin, &mut stdout).await?;
    Ok(())
}
