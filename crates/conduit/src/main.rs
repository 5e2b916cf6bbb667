//! Conduit - stream natural-language queries through an LLM and MCP tool servers.
//!
//! Main entry point for the Conduit CLI.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::Style;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

mod commands;
mod setup;

use commands::{ask, chat, serve, shell, tools};
use conduit_config::{LoggingConfig, LoadedConfig};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Conduit - ask questions answered by an LLM with MCP tools
#[derive(Parser)]
#[command(name = "conduit")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file to use instead of discovery (.toml or legacy .json)
    #[arg(short, long, global = true, env = "CONDUIT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Provider to use (a [providers.<name>] table or a provider kind)
    #[arg(long, global = true)]
    pub provider: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ask a one-shot question
    Ask(ask::AskArgs),

    /// Enter interactive chat mode
    Chat(chat::ChatArgs),

    /// List tools from the configured MCP servers
    Tools(tools::ToolsArgs),

    /// Run the HTTP API server
    Serve(serve::ServeArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = match load_config(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => return fail(&e),
    };

    let serving = matches!(cli.command, Some(Commands::Serve(_)));
    let _guard = init_logging(
        cli.verbose,
        serving,
        loaded.config.logging.clone().unwrap_or_default(),
    );

    for warning in &loaded.warnings {
        tracing::warn!("{}", warning);
    }
    for path in loaded.loaded_from() {
        tracing::debug!(path = %path.display(), "Loaded config");
    }

    let ctx = commands::Context {
        config: loaded.config,
        provider: cli.provider,
        verbose: cli.verbose,
    };

    let result = match cli.command {
        Some(Commands::Ask(args)) => ask::run(args, &ctx).await,
        Some(Commands::Chat(args)) => chat::run(args, &ctx).await.map(|_| ExitCode::SUCCESS),
        Some(Commands::Tools(args)) => tools::run(args, &ctx).await.map(|_| ExitCode::SUCCESS),
        Some(Commands::Serve(args)) => serve::run(args, &ctx).await.map(|_| ExitCode::SUCCESS),
        None => shell::run(&ctx).await.map(|_| ExitCode::SUCCESS),
    };

    result.unwrap_or_else(|e| fail(&e))
}

fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    Ok(match explicit {
        Some(path) => conduit_config::load_config_from(path)?,
        None => conduit_config::load_config(None)?,
    })
}

fn fail(e: &anyhow::Error) -> ExitCode {
    let red = Style::new().red().bold();
    eprintln!("{} {:#}", red.apply_to("error:"), e);
    ExitCode::FAILURE
}

/// Console logging on stderr, plus daily-rotated JSON files when `[logging] file` is set.
///
/// `RUST_LOG` overrides everything; otherwise `--verbose`, then `[logging] level`.
fn init_logging(verbose: bool, serving: bool, logging: LoggingConfig) -> Option<WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let default_filter = if verbose {
        "conduit=debug,conduit_engine=debug,conduit_llm=debug,conduit_mcp=debug,conduit_server=debug,conduit_config=debug,info".to_string()
    } else if let Some(level) = logging.level.clone() {
        level
    } else if serving {
        "conduit=info,conduit_engine=info,conduit_mcp=info,conduit_server=info,tower_http=info,warn"
            .to_string()
    } else {
        "warn".to_string()
    };
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&default_filter));

    let (file_layer, guard) = match &logging.file {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "conduit.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new(
                    "conduit=trace,conduit_engine=trace,conduit_llm=trace,conduit_mcp=trace,conduit_server=trace,conduit_config=trace,info",
                ));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(file_layer)
        .init();

    guard
}
