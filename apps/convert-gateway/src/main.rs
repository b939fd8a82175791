use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use convert_gateway::cli::{run_command, Cli, Commands};
use convert_gateway::config::AppConfig;
use convert_gateway::routes::{build_router, cors_layer};
use convert_gateway::state::AppState;
use tower_http::trace::TraceLayer;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is normal outside local development.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let cfg = AppConfig::from_env().context("failed to read configuration")?;
    let state = AppState::from_config(&cfg).await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(cfg, state).await,
        command => {
            println!("{}", run_command(&state.broker, command).await?);
            Ok(())
        }
    }
}

async fn serve(cfg: AppConfig, state: AppState) -> anyhow::Result<()> {
    let origin = cfg
        .app_origin
        .as_deref()
        .context("APP_ORIGIN must be set to serve the API")?;
    let cors = cors_layer(origin, !cfg.is_prod()).context("APP_ORIGIN is not a valid origin")?;

    let app = build_router(state, cfg.max_upload_bytes)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = cfg.bind_addr.parse()?;
    info!("Starting convert gateway on {addr}");
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutting down");
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
