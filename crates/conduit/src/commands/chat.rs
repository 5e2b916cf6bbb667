//! Chat command - interactive conversation.

use anyhow::Result;
use clap::Args;

use super::Context;
use super::repl::Repl;
use crate::setup::Runtime;

/// Arguments for the chat command.
#[derive(Args, Debug)]
pub struct ChatArgs {}

/// Run the chat command (REPL).
pub async fn run(_args: ChatArgs, ctx: &Context) -> Result<()> {
    let runtime = Runtime::start(&ctx.config, ctx.provider.as_deref()).await?;
    let mut repl = Repl::new(runtime, ctx.verbose)?;
    let result = repl.chat().await;
    repl.runtime().shutdown().await;
    result
}
