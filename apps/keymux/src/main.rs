use anyhow::Result;
use axum::http::StatusCode;
use axum::routing::get;
use clap::Parser;
use tracing::info;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = cli::build_config(cli::Cli::parse())?;
    let bind = format!("{}:{}", config.host, config.port);
    let configured: Vec<&String> = config.credentials.keys().collect();
    info!(event = "boot", providers = ?configured);

    let state = keymux_core::ProxyState::bootstrap(config).await?;

    let app = axum::Router::new()
        .merge(keymux_core::proxy_router(state))
        .route("/health", get(|| async { StatusCode::NO_CONTENT }))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }));

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(event = "listening", bind = %bind);
    axum::serve(listener, app).await?;
    Ok(())
}
