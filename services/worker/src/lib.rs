//! Kernel worker (§4.4): an OS subprocess that hosts one execution kernel and
//! a node-runtime socket pairing it with exactly one client-side `Connection`.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use exec_kernel_protocol::ExecutionKernel;
use fabric_node::{Body, MessageType, Node, NodeIdentity, NodeRole};
use fabric_proto::{KernelConnectionInfo, ReadyKernelBody};
use rand::RngCore;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Node(#[from] fabric_node::NodeError),
    #[error(transparent)]
    Kernel(#[from] exec_kernel_protocol::ExecKernelError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct WorkerConfig {
    pub kernel_id: String,
    pub info: serde_json::Value,
    pub provider_host: IpAddr,
    pub provider_port: u16,
    pub provider_identity: NodeIdentity,
    pub root_path: PathBuf,
}

/// Runs until the paired `Connection` disconnects or the execution kernel's
/// channels close, whichever comes first. `info` is accepted purely to keep
/// the CLI surface identical to what the provider invokes; the fabric itself
/// never interprets it.
pub async fn run(config: WorkerConfig) -> Result<(), WorkerError> {
    let _ = &config.info;

    let node = Node::bind(NodeRole::Kernel, None, config.root_path.clone()).await?;

    let paired_connection: Arc<Mutex<Option<NodeIdentity>>> = Arc::new(Mutex::new(None));
    let connect_paired = paired_connection.clone();
    node.set_connect_observer(move |peer, role| {
        if role == NodeRole::Connection {
            tracing::info!(peer = %peer, "paired with connection");
            *connect_paired.lock().unwrap() = Some(peer);
        }
    });

    // Flips once the paired connection disconnects; a worker self-terminates
    // by returning from `run` rather than hard-exiting, so it behaves the
    // same whether it's a real OS process or an in-process test double.
    let (disconnect_tx, mut disconnect_rx) = tokio::sync::oneshot::channel::<()>();
    let disconnect_tx = Arc::new(Mutex::new(Some(disconnect_tx)));
    let disconnect_paired = paired_connection.clone();
    node.set_disconnect_observer(move |peer| {
        let was_paired = disconnect_paired.lock().unwrap().as_ref() == Some(&peer);
        if was_paired {
            tracing::info!(peer = %peer, "paired connection disconnected, exiting");
            if let Some(tx) = disconnect_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        }
    });

    node.connect(
        SocketAddr::new(config.provider_host, config.provider_port),
        config.provider_identity.clone(),
    );

    let (listeners, ports) = exec_kernel_protocol::bind_listeners(IpAddr::from([0, 0, 0, 0])).await?;

    let mut session_key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut session_key);
    let session_key_hex = hex::encode(session_key);

    let provider_identity = config.provider_identity.clone();
    let kernel_id = config.kernel_id.clone();
    let announce_node = node.clone();
    let announce_host = config.provider_host;
    let announce_session_key = session_key_hex.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let ready = ReadyKernelBody {
            kernel_id: kernel_id.clone(),
            connection: KernelConnectionInfo {
                session_key: announce_session_key,
                ip: announce_host.to_string(),
                hb: ports.hb,
                iopub: ports.iopub,
                shell: ports.shell,
                process_key: announce_node.identity().as_str().to_owned(),
                process: announce_node.port(),
            },
        };
        match Body::json(&ready) {
            Ok(body) => {
                let _ = announce_node.send(provider_identity, MessageType::ReadyKernel, Some(body), None);
                tracing::info!(kernel_id, "READY_KERNEL sent");
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode READY_KERNEL body"),
        }
    });

    let (shell, iopub, hb) = tokio::select! {
        result = listeners.accept() => result?,
        _ = &mut disconnect_rx => {
            tracing::info!("paired connection disconnected before pairing completed, exiting");
            node.stop(true).await;
            return Ok(());
        }
    };
    tracing::info!("paired connection attached to execution kernel channels");

    let kernel = ExecutionKernel::new(session_key.to_vec());
    tokio::select! {
        result = kernel.run(shell, iopub, hb) => { result?; }
        _ = shutdown_signal() => { tracing::info!("SIGTERM received, shutting down kernel"); }
        _ = &mut disconnect_rx => { tracing::info!("paired connection disconnected, exiting"); }
    }

    node.stop(true).await;
    Ok(())
}

/// Waits for SIGTERM or Ctrl-C; on either, the kernel stops serving (the
/// embedded execution kernel has no restart concept, so this is a plain exit
/// rather than a Jupyter-style `do_shutdown(restart=false)`).
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
