use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use provider::{ProcessWorkerSpawner, WorkerSpawner};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Spawns and supervises kernel worker processes for the fabric.
#[derive(Parser, Debug)]
#[command(name = "provider", about = "Kernel fabric provider")]
struct Args {
    /// Address of the master this provider registers with, e.g. 127.0.0.1:8090.
    master_address: SocketAddr,

    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(long, default_value = "~/.kernel_provider")]
    root_path: String,
}

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").or_else(|_| env::var("RUST_LOG")).unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let args = Args::parse();
    let root_path = PathBuf::from(shellexpand::tilde(&args.root_path).into_owned());

    let spawner: Arc<dyn WorkerSpawner> = Arc::new(ProcessWorkerSpawner::new());
    let provider = provider::Provider::start(args.master_address, args.host, root_path, spawner)
        .await
        .expect("failed to start provider");

    info!(identity = %provider.node().identity(), "provider ready");
    shutdown_signal().await;

    provider.node().stop(true).await;
    info!("provider shut down gracefully");
}

async fn shutdown_signal() {
    use tokio::signal;

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
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
