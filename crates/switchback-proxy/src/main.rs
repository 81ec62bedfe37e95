//! `switchback` binary entrypoint.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use switchback_config::resolve_config;
use switchback_proxy::{bind, telemetry, Proxy, UsageTracker};
use tracing::info;

/// Local failover proxy for Claude Code and Codex
#[derive(Parser, Debug)]
#[command(name = "switchback")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: switchback.{jsonc,json,yml,yaml} or ~/.config/switchback/)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Profile to route with (default: active_profile from the config)
    #[arg(short, long)]
    profile: Option<String>,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port, 0 for an ephemeral port
    #[arg(long)]
    port: Option<u16>,

    /// Calling CLI (claude, codex, ...); selects wire format and env overlays
    #[arg(long)]
    client: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let resolved = resolve_config(cli.config.as_deref(), cli.profile.as_deref())?;
    let mut config = resolved.config;
    if let Some(host) = cli.host {
        config.proxy.host = host;
    }
    if let Some(port) = cli.port {
        config.proxy.port = port;
    }
    if let Some(client) = cli.client {
        config.proxy.client = client;
    }

    telemetry::init_subscriber(&config.logging);
    info!(path = %resolved.path.display(), "loaded configuration");

    let usage = Arc::new(UsageTracker::new());
    let proxy = Proxy::from_config(&config, None)
        .context("failed to build proxy")?
        .with_usage_sink(usage.clone());

    let bound = bind(
        Arc::new(proxy),
        &config.proxy.host,
        config.proxy.port,
        config.proxy.max_body_bytes,
    )
    .await?;

    // Launchers read the first stdout line to export the base URL.
    println!("{}", bound.base_url());

    bound
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("server error")?;

    for (session, totals) in usage.snapshot() {
        info!(
            session = %session,
            requests = totals.requests,
            input_tokens = totals.input_tokens,
            output_tokens = totals.output_tokens,
            "session usage"
        );
    }
    Ok(())
}
