mod accrual;
mod api;
mod auth;
mod bootstrap;
mod config;
mod error;
mod ledger;
mod reconcile;
mod server;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,loyalty_backend=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenv::dotenv().ok();

    info!("starting loyalty points service");

    let config = Config::from_env()?;
    let (state, pipeline) = bootstrap::initialize_app(&config).await?;

    let app = server::create_app(state);

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_shutdown.cancel();
        }
    });

    server::run_server(app, &config.bind_address, shutdown).await?;

    // The server has drained; stop the reconciliation pipeline within its
    // shutdown budget. In-flight ledger transactions complete first.
    pipeline.shutdown().await;

    info!("server stopped");
    Ok(())
}
