//! WebPub Server
//!
//! Streams EPUB, CBZ and PDF publications as Readium Web Publications.

use std::time::Duration;

use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use webpub_server::config::{Config, LogFormat};
use webpub_server::routes;
use webpub_server::state::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn init_tracing(config: &Config) {
    let default_filter = if config.server.debug {
        "webpub_server=debug,tower_http=debug"
    } else {
        "webpub_server=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    match config.server.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    init_tracing(&config);
    config.validate()?;
    tracing::info!("Starting WebPub Server v{}", env!("CARGO_PKG_VERSION"));

    let bind = (config.server.address.clone(), config.server.port);
    let state = AppState::from_config(config).await?;
    let sweeper = state.publications().spawn_sweeper(SWEEP_INTERVAL);

    let app = routes::app(state.clone());

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("WebPub Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    state.shutdown();
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
