use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod router;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the MCP stream when serving.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => commands::handle_serve(cli.config).await,
        Commands::Check { json } => commands::handle_check(cli.config, json).await,
        Commands::Tools { json } => commands::handle_tools(cli.config, json).await,
        Commands::Call { tool, args } => commands::handle_call(cli.config, tool, args).await,
    }
}
