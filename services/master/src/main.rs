use std::env;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Central registry and scheduler for the kernel coordination fabric.
#[derive(Parser, Debug)]
#[command(name = "master", about = "Kernel fabric master")]
struct Args {
    #[arg(long, default_value_t = 8090)]
    port: u16,

    #[arg(long, default_value = "~/.kernel_master")]
    root_path: String,

    #[arg(long, default_value_t = 5)]
    limit: u32,
}

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").or_else(|_| env::var("RUST_LOG")).unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let args = Args::parse();
    let root_path = PathBuf::from(shellexpand::tilde(&args.root_path).into_owned());

    let master = master::Master::start(args.port, root_path, args.limit)
        .await
        .expect("failed to start master");

    info!(port = master.node().port(), limit = args.limit, "master ready");
    shutdown_signal().await;

    master.node().stop(true).await;
    info!("master shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
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
