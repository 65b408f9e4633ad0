/// Entry point for the Phantom CLI, an IR obfuscation tool.
///
/// This module parses command-line arguments and dispatches to subcommands for obfuscating,
/// printing, graphing and interpreting IR modules stored as JSON. It initializes logging and
/// handles the main execution flow.
use clap::Parser;
use phantom_cli::commands::{Cmd, Command};
use tracing_subscriber::EnvFilter;

/// Command-line interface for Phantom.
///
/// Phantom rewrites IR modules with control flow flattening, jump tables, opaque predicates,
/// instruction virtualization, encoded indirect calls and MBA substitution.
#[derive(Parser)]
#[command(name = "phantom")]
#[command(about = "Phantom: IR obfuscator")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Runs the Phantom CLI with the provided arguments.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    cli.command.execute().await
}
