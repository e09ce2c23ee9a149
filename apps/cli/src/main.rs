//! IntentFlow CLI: intent resolution for chat-driven content orchestration.
//!
//! Interprets chat messages against a workspace and conversation, picking
//! the model tier each turn deserves.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
