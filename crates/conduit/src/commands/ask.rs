//! Ask command - one-shot question.

use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use console::Style;
use tokio_util::sync::CancellationToken;

use super::{Context, render};
use crate::setup::Runtime;

/// Arguments for the ask command.
#[derive(Args, Debug)]
pub struct AskArgs {
    /// The question or prompt to send
    #[arg(required = true)]
    pub prompt: String,
}

/// Run the ask command.
pub async fn run(args: AskArgs, ctx: &Context) -> Result<ExitCode> {
    let runtime = Runtime::start(&ctx.config, ctx.provider.as_deref()).await?;

    if ctx.verbose {
        let dim = Style::new().dim();
        let tools = runtime.registry.snapshot();
        eprintln!(
            "{}",
            dim.apply_to(format!(
                "Model: {} | Tools: {}",
                runtime.provider.model(),
                tools.len()
            ))
        );
    }

    let cancel = CancellationToken::new();
    let watcher = cancel_on_ctrl_c(cancel.clone());

    let engine = runtime.engine(Vec::new(), None, Some(cancel))?;
    let outcome = render(engine.submit(args.prompt), ctx.verbose).await;

    watcher.abort();
    runtime.shutdown().await;

    Ok(match outcome?.error {
        Some(_) => ExitCode::FAILURE,
        None => ExitCode::SUCCESS,
    })
}

/// Cancel `token` on the first Ctrl-C.
pub fn cancel_on_ctrl_c(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    })
}
