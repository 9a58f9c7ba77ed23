//! CLI subcommands.
//!
//! Each command is a small REPL over an async line reader so the loops can
//! be driven from tests with in-memory input.

pub mod agent;
pub mod audit;
pub mod chat;
pub mod rag;

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, Lines};

/// Inputs that end a session, matched case-insensitively.
pub const EXIT_WORDS: [&str; 2] = ["exit", "quit"];

/// Prompt for the next non-empty line.
///
/// Returns `None` on end of input or an exit word.
pub(crate) async fn next_input<R, W>(
    lines: &mut Lines<R>,
    out: &mut W,
    prompt: &str,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        out.write_all(prompt.as_bytes()).await?;
        out.flush().await?;

        let Some(line) = lines.next_line().await? else {
            return Ok(None);
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if EXIT_WORDS.iter().any(|w| line.eq_ignore_ascii_case(w)) {
            return Ok(None);
        }
        return Ok(Some(line.to_string()));
    }
}

/// Write one block of output followed by a blank line.
pub(crate) async fn say<W>(out: &mut W, text: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(text.as_bytes()).await?;
    out.write_all(b"\n\n").await?;
    out.flush().await
}
