//! `toolgate audit`: print the most recent audit records as JSON lines.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::agent_core::audit::AuditLog;
use crate::config::LoadedConfig;

/// Write the last `limit` records, oldest first. Returns how many.
pub async fn tail<W>(audit: &AuditLog, limit: usize, out: &mut W) -> anyhow::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let events = audit.recent(limit)?;
    for event in &events {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        out.write_all(line.as_bytes()).await?;
    }
    out.flush().await?;
    Ok(events.len())
}

pub async fn run(loaded: &LoadedConfig, limit: usize) -> anyhow::Result<()> {
    let audit = loaded.open_audit()?;
    let mut stdout = tokio::io::stdout();
    tail(&audit, limit, &mut stdout).await?;
    Ok(())
}
