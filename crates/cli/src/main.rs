//! HelloAgents CLI — the main entry point.
//!
//! Commands:
//! - `tools`    — List the built-in tool registry
//! - `exec`     — Run one command through the sandboxed terminal tool
//! - `context`  — Build a context window and print its token report
//! - `config`   — Show, validate, locate or initialise the config file

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "helloagents",
    about = "HelloAgents — ReAct agent execution core",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ~/.helloagents/config.toml)
    #[arg(short, long, global = true, env = "HELLOAGENTS_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered tools and their parameters
    Tools,

    /// Run a single command through the terminal tool
    Exec {
        /// The command line
        command: String,

        /// Run through `sh -c` (pipes, redirection, chaining)
        #[arg(long)]
        shell: bool,

        /// Permit dangerous operations (rm, chmod, redirection, ...)
        #[arg(long)]
        allow_dangerous: bool,

        /// Override the workspace root
        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },

    /// Build a context window for a query
    Context {
        /// The user query
        #[arg(short, long)]
        query: String,

        /// System instructions for [Role & Policies]
        #[arg(short, long)]
        instructions: Option<String>,

        /// JSON file with an array of {"role", "content"} messages
        #[arg(long)]
        history: Option<PathBuf>,

        /// Build the base context (no scoring or selection)
        #[arg(long)]
        base: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Check the configuration for errors
    Validate,
    /// Print the config file path
    Path,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Tools => commands::tools::run(config_path).await?,
        Commands::Exec {
            command,
            shell,
            allow_dangerous,
            workspace,
        } => commands::exec::run(config_path, &command, shell, allow_dangerous, workspace).await?,
        Commands::Context {
            query,
            instructions,
            history,
            base,
        } => {
            commands::context::run(config_path, &query, instructions.as_deref(), history.as_deref(), base)
                .await?
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(config_path).await?,
            ConfigAction::Validate => commands::config_cmd::validate(config_path).await?,
            ConfigAction::Path => commands::config_cmd::path(config_path).await?,
            ConfigAction::Init { force } => commands::config_cmd::init(config_path, force).await?,
        },
    }

    Ok(())
}
