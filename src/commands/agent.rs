//! `toolgate agent`: the routed assistant REPL.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};

use crate::agent_core::intent_router::IntentRouter;
use crate::agent_core::orchestrator::AgentOrchestrator;
use crate::agent_core::tool_registry::ToolRegistry;
use crate::config::LoadedConfig;

use super::{next_input, say};

const BANNER: &str = "Secure agent ready. Ask me to list, read, or summarize files, \
     or to write a report. Type 'exit' or 'quit' to stop.";

/// Shown when the audit trail cannot be written. Nothing else is revealed.
const INTERNAL_ERROR_REPLY: &str = "Internal error. The request was not processed.";

/// Wire the orchestrator from configuration. All failures are fatal.
pub fn build_orchestrator(loaded: &LoadedConfig) -> anyhow::Result<AgentOrchestrator> {
    let gate = Arc::new(loaded.build_gate()?);
    let audit = loaded.open_audit()?;
    let responder = loaded.build_responder()?;
    let router = IntentRouter::new().context("failed to compile routing rules")?;

    Ok(AgentOrchestrator::new(
        router,
        ToolRegistry::new(gate),
        audit,
        responder,
        loaded.config.generation.clone(),
        loaded.config.negotiation,
    ))
}

/// Run one conversation until end of input or an exit word.
///
/// Returns the number of turns handled. An audit write failure ends the
/// session with an error after a generic reply.
pub async fn run_session<R, W>(
    orchestrator: &AgentOrchestrator,
    input: R,
    out: &mut W,
) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut conversation = orchestrator.new_conversation();
    let mut lines = input.lines();
    let mut turns = 0;

    say(out, BANNER).await?;
    while let Some(text) = next_input(&mut lines, out, "You: ").await? {
        turns += 1;
        match orchestrator.handle_turn(&mut conversation, &text).await {
            Ok(response) => {
                tracing::debug!(
                    correlation_id = %response.correlation_id,
                    kind = response.kind.as_str(),
                    events = response.events_emitted,
                    "turn complete"
                );
                say(out, &format!("Agent: {}", response.text)).await?;
            }
            Err(e) => {
                tracing::error!(error = %e, code = e.code(), "turn failed closed");
                say(out, &format!("Agent: {INTERNAL_ERROR_REPLY}")).await?;
                return Err(e).context("audit trail unavailable, stopping");
            }
        }
    }

    tracing::info!(
        conversation_id = %conversation.id(),
        turns,
        "session ended"
    );
    Ok(turns)
}

/// Entry point for the subcommand: stdin/stdout session.
pub async fn run(loaded: &LoadedConfig) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(loaded)?;
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    run_session(&orchestrator, stdin, &mut stdout).await?;
    Ok(())
}
