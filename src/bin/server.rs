//! Handoff bus server binary.
//!
//! Thin wrapper that bootstraps a [`HandoffContext`], starts its worker
//! pools, and blocks until a shutdown signal arrives.

use std::path::PathBuf;

use clap::Parser;
use tokio::signal;
use tracing::info;

use handoff_core::HandoffContext;

#[derive(Debug, Parser)]
#[command(name = "handoff-server", version, about = "Durable multi-queue handoff message bus")]
struct Args {
    /// Directory the routing config path (HANDOFF_ROUTING_CONFIG_PATH) is
    /// resolved relative to.
    #[arg(long, default_value = ".")]
    server_root: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let args = Args::parse();

    info!(version = env!("CARGO_PKG_VERSION"), "starting handoff bus server");

    let context = HandoffContext::bootstrap(&args.server_root);
    let worker_handles = context.start().await;
    info!(workers = worker_handles.len(), "worker pools started");

    shutdown_signal().await;
    info!("shutdown signal received, draining worker pools");

    context.shutdown();
    for handle in worker_handles {
        let _ = handle.await;
    }

    info!("handoff bus server shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
