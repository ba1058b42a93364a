mod cache;
mod config;
mod cpid;
mod error;
mod gzio;
mod locations;
mod lock;
mod pagedata;
mod queue;
mod routes;
mod server;
mod settings;
mod state;
mod testers;
mod testid;

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use config::{CliArgs, CoordinatorConfig};
use state::CoordinatorState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webperf_coordinator=info,tower_http=info".into()),
        )
        .init();

    let args = CliArgs::parse();
    info!("Starting webperf-coordinator v{}", env!("CARGO_PKG_VERSION"));
    info!("Data dir: {:?}", args.data_dir);

    if !args.data_dir.exists() {
        error!("Data directory does not exist: {:?}", args.data_dir);
        std::process::exit(1);
    }

    let config = CoordinatorConfig::from_args(args);
    let port = config.port;
    std::fs::create_dir_all(config.tmp_dir())?;
    std::fs::create_dir_all(config.results_dir())?;

    let state = Arc::new(CoordinatorState::new(config));

    let router = server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Coordinator listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Coordinator shutting down");
    lock::release_remaining();

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal");
}
