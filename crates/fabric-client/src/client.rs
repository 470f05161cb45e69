//! The client role (§4.6): requests kernels from the master, tracks the live
//! `Connection`s it owns, stops them all on shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use fabric_node::{Body, MessageType, Node, NodeIdentity, NodeRole};
use fabric_proto::KernelDescriptor;

use crate::connection::Connection;
use crate::ClientError;

pub struct Client {
    node: Arc<Node>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl Client {
    /// Bind a client node and connect it to the master at `master_addr`.
    pub async fn start(master_addr: SocketAddr, root_path: PathBuf) -> Result<Arc<Client>, ClientError> {
        let node = Node::bind(NodeRole::Client, None, root_path).await?;
        node.connect(master_addr, NodeIdentity::master());
        Ok(Arc::new(Client {
            node,
            connections: RwLock::new(HashMap::new()),
        }))
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn connection(&self, kernel_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().unwrap().get(kernel_id).cloned()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().unwrap().values().cloned().collect()
    }

    /// `REQ_KERNEL`: ask the master for a kernel tagged with `info` (opaque
    /// caller payload, e.g. DB/log connection parameters). Resolves to
    /// `None` when no provider had capacity.
    pub async fn create_kernel(
        self: &Arc<Self>,
        info: serde_json::Value,
    ) -> Result<Option<Arc<Connection>>, ClientError> {
        let (flow_id, rx) = self.node.flows().new_oneshot();
        self.node.send(
            NodeIdentity::master(),
            MessageType::ReqKernel,
            Some(Body::json(&info)?),
            Some(flow_id.clone()),
        )?;

        let reply = rx.await.map_err(|_| ClientError::NoReply)?;
        self.node.flows().del(&flow_id);

        let descriptor: Option<KernelDescriptor> = match reply.body {
            Some(body) => body.into_json()?,
            None => None,
        };

        let Some(descriptor) = descriptor else {
            return Ok(None);
        };

        let kernel_id = descriptor.kernel_id.clone();
        let client = self.clone();
        let connection = Connection::connect(self.node.clone(), descriptor, move |kernel_id| {
            client.connections.write().unwrap().remove(&kernel_id);
        })
        .await?;

        self.connections
            .write()
            .unwrap()
            .insert(kernel_id, connection.clone());

        Ok(Some(connection))
    }

    /// Stop every live connection, then the underlying node runtime.
    pub async fn stop(self: &Arc<Self>) {
        let connections: Vec<Arc<Connection>> =
            self.connections.write().unwrap().drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.stop().await;
        }
        self.node.stop(true).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exec_kernel_protocol::{bind_listeners, ExecutionKernel};

    async fn fake_master(root_path: PathBuf) -> Arc<Node> {
        Node::bind(NodeRole::Master, None, root_path).await.unwrap()
    }

    #[tokio::test]
    async fn create_kernel_resolves_to_none_when_the_master_replies_with_nothing() {
        let master_dir = tempfile::tempdir().unwrap();
        let master = fake_master(master_dir.into_path()).await;
        master
            .listen(MessageType::ReqKernel, {
                let master = master.clone();
                move |peer, _body, flow_id| {
                    let _ = master.send(peer, MessageType::ResKernel, Some(Body::Json(serde_json::Value::Null)), flow_id);
                }
            })
            .unwrap();

        let master_addr = SocketAddr::new("127.0.0.1".parse().unwrap(), master.port());
        let client_dir = tempfile::tempdir().unwrap();
        let client = Client::start(master_addr, client_dir.into_path()).await.unwrap();

        let result = client.create_kernel(serde_json::json!({})).await.unwrap();
        assert!(result.is_none());
        assert!(client.connections().is_empty());
    }

    #[tokio::test]
    async fn create_kernel_tracks_the_new_connection_and_stop_tears_it_down() {
        let master_dir = tempfile::tempdir().unwrap();
        let master = fake_master(master_dir.into_path()).await;

        let (listeners, ports) = bind_listeners("127.0.0.1".parse().unwrap()).await.unwrap();
        let descriptor = fabric_proto::KernelDescriptor {
            kernel_id: "kernel-7".to_owned(),
            session_key: "k7-key".to_owned(),
            ip: "127.0.0.1".to_owned(),
            hb: ports.hb,
            iopub: ports.iopub,
            shell: ports.shell,
            process_key: "worker dead-beef".to_owned(),
            process: 0,
        };

        master
            .listen(MessageType::ReqKernel, {
                let master = master.clone();
                let descriptor = descriptor.clone();
                move |peer, _body, flow_id| {
                    let body = Body::json(&descriptor).unwrap();
                    let _ = master.send(peer, MessageType::ResKernel, Some(body), flow_id);
                }
            })
            .unwrap();

        let accept_task = tokio::spawn(listeners.accept());

        let master_addr = SocketAddr::new("127.0.0.1".parse().unwrap(), master.port());
        let client_dir = tempfile::tempdir().unwrap();
        let client = Client::start(master_addr, client_dir.into_path()).await.unwrap();

        let connection = client
            .create_kernel(serde_json::json!({"purpose": "test"}))
            .await
            .unwrap()
            .expect("master replied with a descriptor");
        assert_eq!(connection.kernel_id(), "kernel-7");
        assert!(client.connection("kernel-7").is_some());
        assert_eq!(client.connections().len(), 1);

        let (shell, iopub, hb) = accept_task.await.unwrap().unwrap();
        let kernel = ExecutionKernel::new(b"k7-key".to_vec());
        tokio::spawn(kernel.run(shell, iopub, hb));

        let output = connection.execute("print(1 + 1)", None).await.unwrap();
        assert_eq!(output, vec!["2"]);

        client.stop().await;
    }
}
