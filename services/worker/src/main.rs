use std::env;
use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use fabric_node::NodeIdentity;
use tracing_subscriber::EnvFilter;

/// One execution kernel's OS process. Spawned by a provider; not intended
/// for direct interactive use, but a normal CLI-parseable binary.
#[derive(Parser, Debug)]
#[command(name = "worker", about = "Kernel fabric worker")]
struct Args {
    worker_id: String,

    info_json: String,

    #[arg(long)]
    provider_host: IpAddr,

    #[arg(long)]
    provider_port: u16,

    #[arg(long)]
    provider_identity: String,

    #[arg(long)]
    root_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").or_else(|_| env::var("RUST_LOG")).unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let args = Args::parse();
    let info = serde_json::from_str(&args.info_json).unwrap_or(serde_json::Value::Null);

    let config = worker::WorkerConfig {
        kernel_id: args.worker_id,
        info,
        provider_host: args.provider_host,
        provider_port: args.provider_port,
        provider_identity: NodeIdentity::from(args.provider_identity),
        root_path: args.root_path,
    };

    if let Err(e) = worker::run(config).await {
        tracing::error!(error = %e, "worker exited with an error");
        std::process::exit(1);
    }
}
