use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "mcp-fleet",
    version,
    about = "Aggregating proxy that fronts a fleet of MCP servers"
)]
pub struct Cli {
    /// Path to the fleet registry (defaults to the user config dir).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect the fleet and expose its union as one MCP server on stdio.
    Serve,
    /// Connect every upstream once, print per-server results, and exit.
    Check {
        /// Emit machine-readable JSON instead of the table.
        #[arg(long)]
        json: bool,
    },
    /// List every tool advertised by the fleet (server:tool names).
    Tools {
        #[arg(long)]
        json: bool,
    },
    /// Call one tool by qualified name with JSON arguments.
    Call {
        /// Qualified tool name, `server:tool`.
        tool: String,
        /// Arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
    },
}
