//! Serve command - run the HTTP API.

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context as _, Result};
use clap::Args;
use console::Style;

use conduit_server::{AppState, Server, ServerConfig};

use super::Context;
use crate::setup::Runtime;

/// Arguments for the serve command.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind to (overrides [server] bind)
    #[arg(long)]
    pub bind: Option<String>,

    /// Port to listen on (overrides [server] port)
    #[arg(short, long)]
    pub port: Option<u16>,
}

/// Run the serve command until Ctrl-C.
pub async fn run(args: ServeArgs, ctx: &Context) -> Result<()> {
    let addr = bind_address(&args, ctx)?;
    let runtime = Runtime::start(&ctx.config, ctx.provider.as_deref()).await?;

    let dim = Style::new().dim();
    println!(
        "{}",
        dim.apply_to(format!(
            "Serving on http://{} with {} tools",
            addr,
            runtime.registry.snapshot().len()
        ))
    );

    let state = AppState::new(
        runtime.provider.clone(),
        runtime.registry.clone(),
        runtime.engine_config.clone(),
        ServerConfig::new(addr),
    );
    let result = Server::new(state).run().await;

    runtime.shutdown().await;
    Ok(result?)
}

fn bind_address(args: &ServeArgs, ctx: &Context) -> Result<SocketAddr> {
    let settings = ctx.config.server_settings();
    let host = args.bind.as_deref().unwrap_or(&settings.bind);
    let ip: IpAddr = host
        .parse()
        .with_context(|| format!("invalid bind address '{}'", host))?;
    Ok(SocketAddr::new(ip, args.port.unwrap_or(settings.port)))
}
