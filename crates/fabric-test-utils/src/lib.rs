//! In-process harness for exercising the fabric end to end without ever
//! shelling out to the `worker` binary. Mirrors the teacher's mock
//! WebSocket client/server pattern: a real client driving the real wire
//! protocol against a real master and real providers, just wired together
//! inside one test process instead of across OS processes.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use fabric_client::Client;
use master::Master;
use provider::{Provider, WorkerHandle, WorkerSpawner};

/// Spawns workers as in-process tokio tasks (`worker::run`) instead of OS
/// processes, so tests stay hermetic and fast and don't depend on a built
/// `worker` binary being on disk.
pub struct InProcessWorkerSpawner {
    next_pid: AtomicU32,
}

impl InProcessWorkerSpawner {
    pub fn new() -> Self {
        InProcessWorkerSpawner { next_pid: AtomicU32::new(1) }
    }
}

impl Default for InProcessWorkerSpawner {
    fn default() -> Self {
        Self::new()
    }
}

struct TaskHandle {
    join_handle: tokio::task::JoinHandle<()>,
    pid: u32,
}

impl WorkerHandle for TaskHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn kill(&mut self) {
        self.join_handle.abort();
    }
}

impl WorkerSpawner for InProcessWorkerSpawner {
    fn spawn(
        &self,
        worker_id: &str,
        info_json: &str,
        provider_host: IpAddr,
        provider_port: u16,
        provider_identity: &str,
        root_path: &Path,
    ) -> std::io::Result<Box<dyn WorkerHandle>> {
        let info = serde_json::from_str(info_json).unwrap_or(serde_json::Value::Null);
        let config = worker::WorkerConfig {
            kernel_id: worker_id.to_owned(),
            info,
            provider_host,
            provider_port,
            provider_identity: fabric_node::NodeIdentity::from(provider_identity.to_owned()),
            root_path: root_path.to_owned(),
        };

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let join_handle = tokio::spawn(async move {
            if let Err(e) = worker::run(config).await {
                tracing::warn!(error = %e, "in-process worker exited with an error");
            }
        });

        Ok(Box::new(TaskHandle { join_handle, pid }))
    }
}

/// A running master plus N providers, all bound to `127.0.0.1` on ephemeral
/// ports and wired together, plus scratch directories that are cleaned up
/// when the harness is dropped.
pub struct TestFabric {
    pub master: Arc<Master>,
    pub providers: Vec<Arc<Provider>>,
    _scratch: tempfile::TempDir,
}

impl TestFabric {
    /// Start a master and `provider_count` providers, each allowed `limit`
    /// concurrent kernels, all using in-process worker spawning.
    pub async fn start(provider_count: usize, limit: u32) -> Self {
        let scratch = tempfile::tempdir().expect("failed to create scratch dir");

        let master = Master::start(0, scratch.path().join("master"), limit)
            .await
            .expect("failed to start master");
        let master_addr = std::net::SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), master.node().port());

        let mut providers = Vec::with_capacity(provider_count);
        for i in 0..provider_count {
            let spawner: Arc<dyn WorkerSpawner> = Arc::new(InProcessWorkerSpawner::new());
            let provider = Provider::start(
                master_addr,
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                scratch.path().join(format!("provider-{i}")),
                spawner,
            )
            .await
            .expect("failed to start provider");
            providers.push(provider);
        }

        // Let the providers' connect/SETUP_PROVIDER handshakes land before a
        // test starts requesting kernels.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        TestFabric { master, providers, _scratch: scratch }
    }

    pub fn master_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.master.node().port())
    }

    /// Start a client connected to this fabric's master.
    pub async fn client(&self) -> Arc<Client> {
        let root = self.scratch_path().join(format!("client-{}", uuid::Uuid::new_v4()));
        Client::start(self.master_addr(), root)
            .await
            .expect("failed to start client")
    }

    fn scratch_path(&self) -> PathBuf {
        self._scratch.path().to_owned()
    }

    /// Stop the master and every provider's node runtime (providers reap
    /// their own workers from their `on_stop` hook).
    pub async fn stop(&self) {
        for provider in &self.providers {
            provider.node().stop(true).await;
        }
        self.master.node().stop(true).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fabric_starts_master_and_providers() {
        let fabric = TestFabric::start(2, 3).await;
        assert_ne!(fabric.master.node().port(), 0);
        assert_eq!(fabric.providers.len(), 2);
        fabric.stop().await;
    }

    #[tokio::test]
    async fn client_requests_and_receives_a_kernel() {
        let fabric = TestFabric::start(1, 2).await;
        let client = fabric.client().await;

        let connection = client
            .create_kernel(serde_json::json!({"purpose": "test"}))
            .await
            .expect("create_kernel should not error")
            .expect("a provider with capacity should satisfy the request");

        assert!(!connection.kernel_id().is_empty());

        client.stop().await;
        fabric.stop().await;
    }

    #[tokio::test]
    async fn requests_beyond_the_providers_limit_come_back_empty() {
        let fabric = TestFabric::start(1, 2).await;
        let client = fabric.client().await;

        let first = client.create_kernel(serde_json::json!({})).await.unwrap();
        let second = client.create_kernel(serde_json::json!({})).await.unwrap();
        let third = client.create_kernel(serde_json::json!({})).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_some());
        assert!(third.is_none(), "the single provider's limit of 2 should already be exhausted");

        client.stop().await;
        fabric.stop().await;
    }

    #[tokio::test]
    async fn a_crashed_providers_kernels_are_declared_dead() {
        let fabric = TestFabric::start(1, 1).await;
        let client = fabric.client().await;

        let connection = client
            .create_kernel(serde_json::json!({}))
            .await
            .unwrap()
            .expect("a provider with capacity should satisfy the request");
        assert!(connection.is_alive());

        // Simulate the provider (and every worker it owns) crashing out from
        // under the client: its heartbeat socket closes, and the connection
        // should notice without anyone telling it explicitly.
        fabric.providers[0].node().stop(true).await;

        let mut waited = std::time::Duration::ZERO;
        let step = std::time::Duration::from_millis(100);
        while connection.is_alive() && waited < std::time::Duration::from_secs(6) {
            tokio::time::sleep(step).await;
            waited += step;
        }
        assert!(!connection.is_alive(), "heartbeat loss should be noticed within 6s");

        client.stop().await;
    }
}
