//! toolweave CLI: the main entry point.
//!
//! Commands:
//! - `run`     Single request or interactive session with the agent loop
//! - `memory`  Inspect, search and seed long-term memory
//! - `config`  Show, initialize or locate the configuration file

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "toolweave",
    about = "toolweave: autonomous tool-calling orchestration engine",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Use this config file instead of ~/.toolweave/config.toml
    #[arg(short, long, global = true, env = "TOOLWEAVE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a request, or start an interactive session without one
    Run {
        /// The request to run; omit for interactive mode
        message: Option<String>,
    },

    /// Long-term memory commands
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum MemoryCommands {
    /// Show per-layer counts
    Stats,

    /// Search all memory layers by text
    Search {
        query: String,

        /// Results per layer
        #[arg(short, long, default_value_t = 5)]
        limit: usize,
    },

    /// Insert the default procedural strategies into an empty store
    Seed,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default config file if none exists
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Run { message } => commands::run::run(config_path, message).await?,
        Commands::Memory { command } => match command {
            MemoryCommands::Stats => commands::memory::stats(config_path).await?,
            MemoryCommands::Search { query, limit } => {
                commands::memory::search(config_path, &query, limit).await?
            }
            MemoryCommands::Seed => commands::memory::seed(config_path).await?,
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => commands::config_cmd::show(config_path)?,
            ConfigCommands::Init { force } => commands::config_cmd::init(config_path, force)?,
            ConfigCommands::Path => commands::config_cmd::path(config_path),
        },
    }

    Ok(())
}
