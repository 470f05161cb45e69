//! Master role (§4.2): provider/client registry, per-provider capacity
//! tracking, `REQ_KERNEL` dispatch, reply routing back to the client.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use fabric_node::{Body, MessageType, Node, NodeIdentity, NodeRole};

pub struct Master {
    node: Arc<Node>,
    limit: u32,
    /// Providers the master believes still have spawn capacity. An
    /// optimistic filter only — the provider is authoritative and may
    /// reject a `SPAWN_KERNEL` it no longer has room for.
    providers: Mutex<VecDeque<NodeIdentity>>,
}

impl Master {
    pub async fn start(port: u16, root_path: PathBuf, limit: u32) -> Result<Arc<Master>, fabric_node::NodeError> {
        let node = Node::bind(NodeRole::Master, Some(port), root_path).await?;
        let master = Arc::new(Master {
            node: node.clone(),
            limit,
            providers: Mutex::new(VecDeque::new()),
        });

        let connect_master = master.clone();
        node.set_connect_observer(move |peer, role| connect_master.on_connect(peer, role));

        let disconnect_master = master.clone();
        node.set_disconnect_observer(move |peer| disconnect_master.on_disconnect(peer));

        let req_master = master.clone();
        node.listen(MessageType::ReqKernel, move |peer, body, flow_id| {
            req_master.on_req_kernel(peer, body, flow_id)
        })?;

        let reply_master = master.clone();
        node.listen(MessageType::SpawnKernelReply, move |peer, body, flow_id| {
            reply_master.on_spawn_kernel_reply(peer, body, flow_id)
        })?;

        tracing::info!(port = node.port(), limit, "master started");
        Ok(master)
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    fn on_connect(&self, peer: NodeIdentity, role: NodeRole) {
        if role != NodeRole::Provider {
            return;
        }
        let settings = fabric_proto::ProviderSettings { limit: self.limit };
        match Body::json(&settings) {
            Ok(body) => {
                if self
                    .node
                    .send(peer.clone(), MessageType::SetupProvider, Some(body), None)
                    .is_ok()
                {
                    self.providers.lock().unwrap().push_back(peer.clone());
                    tracing::info!(provider = %peer, "provider registered");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode provider settings"),
        }
    }

    fn on_disconnect(&self, peer: NodeIdentity) {
        self.providers.lock().unwrap().retain(|p| p != &peer);
        tracing::info!(peer = %peer, "peer disconnected");
    }

    fn on_req_kernel(&self, peer: NodeIdentity, body: Option<Body>, flow_id: Option<fabric_node::FlowId>) {
        let Some(flow_id) = flow_id else {
            tracing::warn!("REQ_KERNEL without a flow id, dropping");
            return;
        };

        let provider = self.providers.lock().unwrap().pop_front();
        let Some(provider) = provider else {
            self.node.flows().mark_cleanup(&flow_id);
            let _ = self.node.send(
                peer,
                MessageType::ResKernel,
                Some(Body::Json(serde_json::Value::Null)),
                Some(flow_id),
            );
            return;
        };

        self.node.flows().ensure_placeholder(flow_id.clone());
        self.node
            .flows()
            .set_args(&flow_id, serde_json::json!(peer.as_str()));

        if self
            .node
            .send(provider.clone(), MessageType::SpawnKernel, body, Some(flow_id))
            .is_err()
        {
            tracing::warn!(provider = %provider, "provider vanished before SPAWN_KERNEL could be sent");
        }
    }

    fn on_spawn_kernel_reply(&self, provider: NodeIdentity, body: Option<Body>, flow_id: Option<fabric_node::FlowId>) {
        let Some(flow_id) = flow_id else {
            return;
        };
        let Some(client) = self
            .node
            .flows()
            .get_args(&flow_id)
            .and_then(|v| v.as_str().map(str::to_owned))
        else {
            tracing::warn!(flow = %flow_id, "SPAWN_KERNEL_REPLY for a flow with no remembered client");
            return;
        };

        self.node.flows().mark_cleanup(&flow_id);

        let non_null = !matches!(&body, Some(Body::Json(serde_json::Value::Null)) | None);
        let _ = self.node.send(
            NodeIdentity::from(client),
            MessageType::ResKernel,
            body,
            Some(flow_id),
        );

        if non_null {
            self.providers.lock().unwrap().push_back(provider);
        }
    }
}
