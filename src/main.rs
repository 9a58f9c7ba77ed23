//! toolgate CLI.
//!
//! `toolgate` (or `toolgate agent`) starts the routed assistant REPL.
//! `chat` and `rag` run the plain chatbot and the document Q&A loop, and
//! `audit tail` prints recent audit records.

#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use toolgate::commands::{agent, audit, chat, rag};
use toolgate::config;

/// Deterministic trust boundary between free-text input and file tools.
#[derive(Parser)]
#[command(name = "toolgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to toolgate.yaml
    #[arg(short, long, global = true, env = "TOOLGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Routed assistant with gated file tools (default)
    Agent,

    /// Plain chatbot, no tools
    Chat,

    /// Answer questions from the local document index
    Rag,

    /// Inspect the audit trail
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
}

#[derive(Subcommand)]
enum AuditCommands {
    /// Print the most recent records as JSON lines
    Tail {
        /// Number of records to print
        #[arg(short = 'n', long, default_value_t = 20)]
        last: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = toolgate::init_tracing() {
        eprintln!("warning: file logging disabled: {e}");
    }

    let loaded = config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Agent) {
        Commands::Agent => agent::run(&loaded).await,
        Commands::Chat => chat::run(&loaded).await,
        Commands::Rag => rag::run(&loaded).await,
        Commands::Audit {
            command: AuditCommands::Tail { last },
        } => audit::run(&loaded, last).await,
    }
}
