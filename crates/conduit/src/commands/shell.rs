//! Interactive shell, entered when no subcommand is given.

use anyhow::Result;

use super::Context;
use super::repl::Repl;
use crate::setup::Runtime;

pub async fn run(ctx: &Context) -> Result<()> {
    let runtime = Runtime::start(&ctx.config, ctx.provider.as_deref()).await?;
    let mut repl = Repl::new(runtime, ctx.verbose)?;
    let result = repl.shell().await;
    repl.runtime().shutdown().await;
    result
}
