//! CLI command handlers.

pub mod ask;
pub mod chat;
pub mod repl;
pub mod serve;
pub mod shell;
pub mod tools;

use std::io::Write;

use anyhow::Result;
use console::Style;
use futures::StreamExt;

use conduit_config::ConduitConfig;
use conduit_engine::{QueryEvent, QueryStream};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Merged configuration.
    pub config: ConduitConfig,
    /// Provider requested with `--provider`.
    pub provider: Option<String>,
    /// Verbose output enabled.
    pub verbose: bool,
}

/// How a rendered query ended.
#[derive(Debug, Default)]
pub struct Outcome {
    pub rounds: Option<u32>,
    /// `(kind, message)` of a failed query.
    pub error: Option<(String, String)>,
}

/// Print a query stream: text to stdout, tool activity and errors to stderr.
pub async fn render(mut events: QueryStream, verbose: bool) -> Result<Outcome> {
    let dim = Style::new().dim();
    let mut outcome = Outcome::default();
    let mut mid_line = false;

    while let Some(event) = events.next().await {
        match event {
            QueryEvent::Text { content } => {
                print!("{}", content);
                std::io::stdout().flush()?;
                mid_line = !content.ends_with('\n');
            }
            QueryEvent::ToolStart {
                name, arguments, ..
            } => {
                if mid_line {
                    println!();
                    mid_line = false;
                }
                if verbose {
                    eprintln!("{}", dim.apply_to(format!("[Running: {} {}]", name, arguments)));
                } else {
                    eprintln!("{}", dim.apply_to(format!("[Running: {}]", name)));
                }
            }
            QueryEvent::ToolEnd { name, success, .. } => {
                let status = if success { "done" } else { "failed" };
                eprintln!("{}", dim.apply_to(format!("[{}: {}]", name, status)));
            }
            QueryEvent::Done { rounds } => {
                if mid_line {
                    println!();
                }
                outcome.rounds = Some(rounds);
            }
            QueryEvent::Error { kind, message } => {
                if mid_line {
                    println!();
                }
                print_diagnostic(&kind, &message);
                outcome.error = Some((kind, message));
            }
        }
    }

    Ok(outcome)
}

/// Red `error[<kind>]: <message>` line on stderr.
pub fn print_diagnostic(kind: &str, message: &str) {
    let red = Style::new().red();
    eprintln!("{} {}", red.apply_to(format!("error[{}]:", kind)), message);
}
