use anyhow::{Context, Result};
use clap::Parser;
use cli::{build_app, build_gateway, AppState};
use common::{init_structured_logging, FallbackMode, GatewayConfig, LoggingConfig};
use memory::spawn_janitor;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "failover-gateway")]
#[command(about = "LLM gateway that fails over from a primary endpoint to alternate providers")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind, overrides `listen_addr`
    #[arg(long)]
    listen: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    /// auto | forced | disabled, overrides `fallback_mode`
    #[arg(long)]
    fallback_mode: Option<FallbackMode>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = GatewayConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(mode) = args.fallback_mode {
        config.fallback_mode = mode;
    }

    init_structured_logging(LoggingConfig {
        json_output: args.json_logs || config.logging.json,
        ..Default::default()
    })?;

    let gateway = build_gateway(&config)?;

    let shutdown = CancellationToken::new();
    let janitor = spawn_janitor(
        gateway.sessions.clone(),
        Duration::from_secs(config.session.purge_interval_seconds.max(1)),
        shutdown.clone(),
    );

    let app = build_app(AppState::new(gateway.router.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(
        addr = %config.listen_addr,
        mode = %config.fallback_mode,
        primary = %config.primary.endpoint,
        "Failover gateway listening"
    );

    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            stop.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = janitor.await;
    Ok(())
}
