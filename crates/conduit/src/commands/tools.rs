//! Tools command - list the tools of every configured MCP server.

use anyhow::Result;
use clap::Args;
use console::{Style, style};

use super::Context;
use crate::setup::connect_tools;

/// Arguments for the tools command.
#[derive(Args, Debug)]
pub struct ToolsArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the tools command. No provider is needed.
pub async fn run(args: ToolsArgs, ctx: &Context) -> Result<()> {
    let registry = connect_tools(&ctx.config).await;
    let snapshot = registry.snapshot();

    if args.json {
        let tools: Vec<_> = snapshot
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "name": tool.qualified_name,
                    "server": tool.server,
                    "tool": tool.name,
                    "description": tool.description,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&tools)?);
    } else if snapshot.is_empty() {
        let dim = Style::new().dim();
        println!("{}", dim.apply_to("No tools available"));
    } else {
        for tool in snapshot.iter() {
            if ctx.verbose {
                println!(
                    "{}  {}",
                    style(&tool.qualified_name).cyan(),
                    tool.description.as_deref().unwrap_or("")
                );
            } else {
                println!("{}", tool.qualified_name);
            }
        }
    }

    registry.shutdown_all().await;
    Ok(())
}
