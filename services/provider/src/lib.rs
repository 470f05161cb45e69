//! Provider role (§4.3): spawns and supervises kernel worker processes up to
//! `limit`, forwards readiness to the master, reaps on worker disconnect,
//! bounds spawn latency with a timeout (§9 redesign).

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fabric_node::{Body, FlowId, MessageType, Node, NodeIdentity, NodeRole};
use fabric_proto::ReadyKernelBody;
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Bound on how long a spawned worker has to announce `READY_KERNEL` before
/// the provider gives up on it. A fabric-internal tuning knob, not a CLI flag.
const SPAWN_TIMEOUT: Duration = Duration::from_secs(15);

/// A running worker, however it was started. Implementors own the resources
/// backing the worker (an OS process, or an in-process task) and are
/// responsible for making `kill` actually stop it.
pub trait WorkerHandle: Send {
    fn pid(&self) -> u32;
    fn kill(&mut self);
}

/// Starts worker processes on behalf of a `Provider`. Swappable so tests can
/// run workers as in-process tasks instead of real OS processes.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(
        &self,
        worker_id: &str,
        info_json: &str,
        provider_host: IpAddr,
        provider_port: u16,
        provider_identity: &str,
        root_path: &Path,
    ) -> std::io::Result<Box<dyn WorkerHandle>>;
}

/// Spawns the sibling `worker` binary as a real OS process, placing it in its
/// own process group so the whole subtree can be reaped with one signal.
pub struct ProcessWorkerSpawner {
    pub worker_binary: PathBuf,
}

impl ProcessWorkerSpawner {
    pub fn new() -> Self {
        ProcessWorkerSpawner { worker_binary: worker_binary_path() }
    }
}

impl Default for ProcessWorkerSpawner {
    fn default() -> Self {
        Self::new()
    }
}

struct ProcessHandle {
    child: tokio::process::Child,
    pid: u32,
}

impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn kill(&mut self) {
        kill_process_group(self.pid);
        let _ = self.child.start_kill();
    }
}

impl WorkerSpawner for ProcessWorkerSpawner {
    fn spawn(
        &self,
        worker_id: &str,
        info_json: &str,
        provider_host: IpAddr,
        provider_port: u16,
        provider_identity: &str,
        root_path: &Path,
    ) -> std::io::Result<Box<dyn WorkerHandle>> {
        let mut command = Command::new(&self.worker_binary);
        command
            .arg(worker_id)
            .arg(info_json)
            .arg("--provider_host")
            .arg(provider_host.to_string())
            .arg("--provider_port")
            .arg(provider_port.to_string())
            .arg("--provider_identity")
            .arg(provider_identity)
            .arg("--root_path")
            .arg(root_path)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);

        let child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other("spawned worker has no pid (already reaped)"))?;
        Ok(Box::new(ProcessHandle { child, pid }))
    }
}

struct WorkerProcess {
    handle: Box<dyn WorkerHandle>,
    node_identity: Option<NodeIdentity>,
    ready: bool,
    spawned_at: Instant,
    flow_id: FlowId,
    timeout_handle: JoinHandle<()>,
}

pub struct Provider {
    node: Arc<Node>,
    host: IpAddr,
    spawner: Arc<dyn WorkerSpawner>,
    limit: AtomicU32,
    workers: Mutex<HashMap<String, WorkerProcess>>,
}

impl Provider {
    pub async fn start(
        master_addr: std::net::SocketAddr,
        host: IpAddr,
        root_path: PathBuf,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Result<Arc<Provider>, fabric_node::NodeError> {
        let node = Node::bind(NodeRole::Provider, None, root_path).await?;
        node.connect(master_addr, NodeIdentity::master());

        let provider = Arc::new(Provider {
            node: node.clone(),
            host,
            spawner,
            limit: AtomicU32::new(0),
            workers: Mutex::new(HashMap::new()),
        });

        let setup_provider = provider.clone();
        node.listen(MessageType::SetupProvider, move |_peer, body, _flow| {
            setup_provider.on_setup_provider(body)
        })?;

        let spawn_provider = provider.clone();
        node.listen(MessageType::SpawnKernel, move |_peer, body, flow_id| {
            Provider::on_spawn_kernel(&spawn_provider, body, flow_id)
        })?;

        let ready_provider = provider.clone();
        node.listen(MessageType::ReadyKernel, move |peer, body, flow_id| {
            ready_provider.on_ready_kernel(peer, body, flow_id)
        })?;

        let disconnect_provider = provider.clone();
        node.set_disconnect_observer(move |peer| disconnect_provider.on_disconnect(peer));

        let stop_provider = provider.clone();
        node.set_stop_hook(move || stop_provider.on_stop());

        tracing::info!(identity = %provider.node.identity(), "provider started");
        Ok(provider)
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    fn on_setup_provider(&self, body: Option<Body>) {
        let Some(body) = body else { return };
        match body.into_json::<fabric_proto::ProviderSettings>() {
            Ok(settings) => {
                self.limit.store(settings.limit, Ordering::SeqCst);
                tracing::info!(limit = settings.limit, "provider configured");
            }
            Err(e) => tracing::warn!(error = %e, "malformed SETUP_PROVIDER body"),
        }
    }

    fn on_spawn_kernel(self: &Arc<Self>, info: Option<Body>, flow_id: Option<FlowId>) {
        let Some(flow_id) = flow_id else {
            tracing::warn!("SPAWN_KERNEL without a flow id, dropping");
            return;
        };

        let limit = self.limit.load(Ordering::SeqCst);
        if self.workers.lock().unwrap().len() as u32 >= limit {
            self.reply_null(flow_id);
            return;
        }

        let worker_id = uuid::Uuid::new_v4().to_string();
        let info_json = match &info {
            Some(Body::Json(v)) => v.to_string(),
            _ => "null".to_owned(),
        };

        let handle = match self.spawner.spawn(
            &worker_id,
            &info_json,
            self.host,
            self.node.port(),
            self.node.identity().as_str(),
            self.node.root_path(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(error = %e, "failed to spawn worker process");
                self.reply_null(flow_id);
                return;
            }
        };
        let pid = handle.pid();

        self.node.flows().ensure_placeholder(flow_id.clone());

        let timeout_provider = self.clone();
        let timeout_worker_id = worker_id.clone();
        let timeout_flow = flow_id.clone();
        let timeout_handle = tokio::spawn(async move {
            tokio::time::sleep(SPAWN_TIMEOUT).await;
            timeout_provider.on_spawn_timeout(&timeout_worker_id, timeout_flow);
        });

        self.workers.lock().unwrap().insert(
            worker_id.clone(),
            WorkerProcess {
                handle,
                node_identity: None,
                ready: false,
                spawned_at: Instant::now(),
                flow_id,
                timeout_handle,
            },
        );

        tracing::info!(worker = %worker_id, pid, "worker spawned");
    }

    /// Fires `SPAWN_TIMEOUT` after a spawn with no `READY_KERNEL` yet. A
    /// worker that becomes ready in between aborts this task's `JoinHandle`
    /// before it ever runs, so reaching here means it's still not ready.
    fn on_spawn_timeout(&self, worker_id: &str, flow_id: FlowId) {
        if self.workers.lock().unwrap().get(worker_id).is_none_or(|w| w.ready) {
            return;
        }
        tracing::warn!(worker = %worker_id, "worker spawn timed out");
        self.kill_and_remove(worker_id);
        self.reply_null(flow_id);
    }

    fn reply_null(&self, flow_id: FlowId) {
        self.node.flows().mark_cleanup(&flow_id);
        let _ = self.node.send(
            NodeIdentity::master(),
            MessageType::SpawnKernelReply,
            Some(Body::Json(serde_json::Value::Null)),
            Some(flow_id),
        );
    }

    /// `READY_KERNEL` carries no flow id of its own — the worker was never
    /// told one over the wire. The flow it resolves is the one the provider
    /// remembered locally when it received the original `SPAWN_KERNEL`.
    fn on_ready_kernel(&self, peer: NodeIdentity, body: Option<Body>, _flow_id: Option<FlowId>) {
        let Some(body) = body else {
            tracing::warn!("READY_KERNEL with no body, dropping");
            return;
        };
        let ready: ReadyKernelBody = match body.into_json() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "malformed READY_KERNEL body");
                return;
            }
        };

        let mut workers = self.workers.lock().unwrap();
        let Some(worker) = workers.get_mut(&ready.kernel_id) else {
            tracing::warn!(worker = %ready.kernel_id, "READY_KERNEL for an unknown worker (already timed out?)");
            return;
        };
        worker.timeout_handle.abort();
        worker.node_identity = Some(peer);
        worker.ready = true;
        let spawn_latency = worker.spawned_at.elapsed();
        let flow_id = worker.flow_id.clone();
        drop(workers);

        self.node.flows().mark_cleanup(&flow_id);
        let connection = fabric_proto::KernelDescriptor::from_ready(&ready);
        let _ = Body::json(&connection).map(|body| {
            self.node
                .send(NodeIdentity::master(), MessageType::SpawnKernelReply, Some(body), Some(flow_id))
        });
        tracing::info!(worker = %ready.kernel_id, spawn_latency_ms = spawn_latency.as_millis(), "worker ready");
    }

    fn on_disconnect(&self, peer: NodeIdentity) {
        let victim = {
            let workers = self.workers.lock().unwrap();
            workers
                .iter()
                .find(|(_, w)| w.node_identity.as_ref() == Some(&peer))
                .map(|(id, _)| id.clone())
        };
        let Some(worker_id) = victim else { return };
        self.kill_and_remove(&worker_id);
    }

    fn kill_and_remove(&self, worker_id: &str) {
        let removed = self.workers.lock().unwrap().remove(worker_id);
        let Some(mut worker) = removed else { return };
        worker.timeout_handle.abort();
        let pid = worker.handle.pid();
        worker.handle.kill();
        tracing::info!(worker = worker_id, pid, "worker reaped");
    }

    fn on_stop(&self) {
        let worker_ids: Vec<String> = self.workers.lock().unwrap().keys().cloned().collect();
        for id in worker_ids {
            self.kill_and_remove(&id);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    // Negative pid addresses the whole process group created by
    // `process_group(0)` at spawn time.
    let _ = kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

fn worker_binary_path() -> PathBuf {
    let mut path = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("provider"));
    path.set_file_name(if cfg!(windows) { "worker.exe" } else { "worker" });
    path
}
