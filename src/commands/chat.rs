//! `toolgate chat`: plain chatbot over the configured responder.
//!
//! No routing and no tools. The conversation keeps a windowed history under
//! a fixed system prompt.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};

use crate::agent_core::conversation::Conversation;
use crate::config::LoadedConfig;
use crate::inference::client::STATIC_FALLBACK_MESSAGE;
use crate::inference::errors::InferenceError;
use crate::inference::responder::Responder;

use super::{next_input, say};

const CHAT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

const BANNER: &str = "Chatbot ready. Type 'exit' or 'quit' to stop.";

/// Run a chat session until end of input or an exit word.
///
/// A failed generation is reported inline and the user message stays in
/// history; the session continues.
pub async fn run_session<R, W>(
    responder: &dyn Responder,
    timeout: Duration,
    input: R,
    out: &mut W,
) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut conversation = Conversation::new(CHAT_SYSTEM_PROMPT);
    let mut lines = input.lines();
    let mut turns = 0;

    say(out, BANNER).await?;
    while let Some(text) = next_input(&mut lines, out, "You: ").await? {
        turns += 1;
        conversation.push_user(&text);

        let reply = match tokio::time::timeout(timeout, responder.generate(&conversation.history()))
            .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(InferenceError::AllModelsUnavailable { attempted })) => {
                tracing::warn!(attempted = ?attempted, "chat: no model reachable");
                say(out, &format!("Assistant: {STATIC_FALLBACK_MESSAGE}")).await?;
                continue;
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "chat generation failed");
                say(out, "Assistant: (the model could not answer, try again)").await?;
                continue;
            }
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs(), "chat generation timed out");
                say(out, "Assistant: (the model timed out, try again)").await?;
                continue;
            }
        };

        conversation.push_assistant(&reply);
        say(out, &format!("Assistant: {reply}")).await?;
    }
    Ok(turns)
}

pub async fn run(loaded: &LoadedConfig) -> anyhow::Result<()> {
    let responder: Arc<dyn Responder> = loaded.build_responder()?;
    let timeout = Duration::from_secs(loaded.config.generation.timeout_secs.max(1));
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    run_session(responder.as_ref(), timeout, stdin, &mut stdout).await?;
    Ok(())
}
