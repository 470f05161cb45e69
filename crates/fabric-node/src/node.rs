use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use fabric_proto::{Body, Envelope, FlowId, MessageType, NodeIdentity, NodeRole};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::file_stream::{self, IncomingFile};
use crate::flow::FlowRegistry;
use crate::transport::MultipartCodec;
use crate::NodeError;

pub type Handler = Arc<dyn Fn(NodeIdentity, Option<Body>, Option<FlowId>) + Send + Sync>;
pub type ConnectObserver = Arc<dyn Fn(NodeIdentity, NodeRole) + Send + Sync>;
pub type DisconnectObserver = Arc<dyn Fn(NodeIdentity) + Send + Sync>;
pub type StopHook = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct PeerEntry {
    pub role: Option<NodeRole>,
    pub last_seen: Instant,
    pub outbound: mpsc::UnboundedSender<Vec<Bytes>>,
}

/// One identity-addressed duplex endpoint: the fabric's node runtime (§4.1).
///
/// A node both listens for inbound connections and dials peers it knows the
/// identity of in advance; every peer addresses it only by its [`NodeIdentity`].
pub struct Node {
    identity: NodeIdentity,
    role: NodeRole,
    port: u16,
    root_path: PathBuf,
    pub(crate) peers: RwLock<HashMap<NodeIdentity, PeerEntry>>,
    handlers: RwLock<HashMap<MessageType, Handler>>,
    pub(crate) flows: FlowRegistry,
    active: AtomicBool,
    connect_observer: RwLock<Option<ConnectObserver>>,
    disconnect_observer: RwLock<Option<DisconnectObserver>>,
    stop_hook: RwLock<Option<StopHook>>,
    pub(crate) file_recvs: std::sync::Mutex<HashMap<FlowId, IncomingFile>>,
    accept_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Bind a fresh node of `role` on `port` (or a random free port if `None`),
    /// owning `root_path` as its scratch directory.
    pub async fn bind(
        role: NodeRole,
        port: Option<u16>,
        root_path: PathBuf,
    ) -> Result<Arc<Node>, NodeError> {
        tokio::fs::create_dir_all(&root_path).await?;

        let listener = TcpListener::bind(("0.0.0.0", port.unwrap_or(0))).await?;
        let bound_port = listener.local_addr()?.port();

        let identity = if role == NodeRole::Master {
            NodeIdentity::master()
        } else {
            NodeIdentity::generate(role)
        };

        let node = Arc::new(Node {
            identity: identity.clone(),
            role,
            port: bound_port,
            root_path,
            peers: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            flows: FlowRegistry::new(identity),
            active: AtomicBool::new(true),
            connect_observer: RwLock::new(None),
            disconnect_observer: RwLock::new(None),
            stop_hook: RwLock::new(None),
            file_recvs: std::sync::Mutex::new(HashMap::new()),
            accept_handle: std::sync::Mutex::new(None),
        });

        file_stream::register_builtins(&node);
        crate::workspace::register_builtins(&node);

        let accept_node = node.clone();
        let handle = tokio::spawn(async move { accept_node.accept_loop(listener).await });
        *node.accept_handle.lock().unwrap() = Some(handle);

        tracing::info!(identity = %node.identity, port = bound_port, "node bound");
        Ok(node)
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn root_path(&self) -> &std::path::Path {
        &self.root_path
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn flows(&self) -> &FlowRegistry {
        &self.flows
    }

    pub fn last_seen(&self, peer: &NodeIdentity) -> Option<Instant> {
        self.peers.read().unwrap().get(peer).map(|p| p.last_seen)
    }

    pub fn peer_role(&self, peer: &NodeIdentity) -> Option<NodeRole> {
        self.peers.read().unwrap().get(peer).and_then(|p| p.role)
    }

    pub fn is_connected(&self, peer: &NodeIdentity) -> bool {
        self.peers.read().unwrap().contains_key(peer)
    }

    pub fn connected_peers(&self) -> Vec<NodeIdentity> {
        self.peers.read().unwrap().keys().cloned().collect()
    }

    /// Register a dispatch handler for `msg_type`. Fails if one is already
    /// registered — either by a previous caller, or because `msg_type` is
    /// reserved for node-internal protocol (greeting/disconnect/file
    /// streaming/workspace clear).
    pub fn listen(
        &self,
        msg_type: MessageType,
        handler: impl Fn(NodeIdentity, Option<Body>, Option<FlowId>) + Send + Sync + 'static,
    ) -> Result<(), NodeError> {
        let mut handlers = self.handlers.write().unwrap();
        if handlers.contains_key(&msg_type) {
            return Err(NodeError::DuplicateHandler(msg_type));
        }
        handlers.insert(msg_type, Arc::new(handler));
        Ok(())
    }

    /// Register internal handlers at construction time, bypassing the
    /// duplicate check in [`Node::listen`] (which is reserved for callers).
    pub(crate) fn listen_builtin(
        &self,
        msg_type: MessageType,
        handler: impl Fn(NodeIdentity, Option<Body>, Option<FlowId>) + Send + Sync + 'static,
    ) {
        self.handlers
            .write()
            .unwrap()
            .insert(msg_type, Arc::new(handler));
    }

    pub fn set_connect_observer(
        &self,
        observer: impl Fn(NodeIdentity, NodeRole) + Send + Sync + 'static,
    ) {
        *self.connect_observer.write().unwrap() = Some(Arc::new(observer));
    }

    pub fn set_disconnect_observer(&self, observer: impl Fn(NodeIdentity) + Send + Sync + 'static) {
        *self.disconnect_observer.write().unwrap() = Some(Arc::new(observer));
    }

    /// Registers logic to run once, synchronously-dispatched but free to
    /// spawn async cleanup, as the first step of `stop()`.
    pub fn set_stop_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.stop_hook.write().unwrap() = Some(Arc::new(hook));
    }

    /// Open an outbound connection to `peer_identity` at `addr`, and schedule
    /// the 500 ms-delayed `GREETING` that announces this node's role.
    pub fn connect(self: &Arc<Self>, addr: SocketAddr, peer_identity: NodeIdentity) -> JoinHandle<Result<(), NodeError>> {
        let node = self.clone();
        tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await?;
            let mut framed = Framed::new(stream, MultipartCodec::default());
            framed.send(vec![node.identity.as_bytes()]).await?;
            node.register_peer_connection(peer_identity.clone(), framed);

            let greet_node = node.clone();
            let target = peer_identity;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let role_body = Body::Json(serde_json::json!(greet_node.role.as_str()));
                let _ = greet_node.send(target, MessageType::Greeting, Some(role_body), None);
            });
            Ok(())
        })
    }

    /// Non-blocking send: hands the encoded envelope to the peer's writer
    /// task. Fails loudly (but without panicking) if the peer is unknown.
    pub fn send(
        &self,
        to: NodeIdentity,
        msg_type: MessageType,
        body: Option<Body>,
        flow_id: Option<FlowId>,
    ) -> Result<(), NodeError> {
        let envelope = Envelope {
            peer: to.clone(),
            msg_type,
            flow_id: flow_id.clone(),
            body,
        };
        let frames = envelope.encode_frames();

        let delivered = {
            let peers = self.peers.read().unwrap();
            peers.get(&to).map(|p| p.outbound.send(frames).is_ok())
        };

        match delivered {
            Some(true) => {
                if let Some(fid) = &flow_id {
                    self.flows.on_sent(fid);
                }
                Ok(())
            }
            _ => {
                tracing::debug!(peer = %to, msg_type = ?msg_type, "send to unreachable peer dropped");
                Err(NodeError::UnreachablePeer(to.to_string()))
            }
        }
    }

    /// Graceful stop (§4.1): mark inactive, run the stop hook, `DISCONNECT`
    /// every known peer, prune empty directories under `root_path`. When
    /// `io_stop` is true, also abort this node's own background accept task
    /// (an embedding runtime, e.g. an HTTP server hosting a `Client`, keeps
    /// running regardless either way — only this node's tasks are affected).
    pub async fn stop(self: &Arc<Self>, io_stop: bool) {
        self.active.store(false, Ordering::SeqCst);

        if let Some(hook) = self.stop_hook.read().unwrap().clone() {
            hook();
        }

        let peer_ids = self.connected_peers();
        for peer in peer_ids {
            let _ = self.send(peer, MessageType::Disconnect, None, None);
        }

        crate::workspace::prune_empty_dirs(&self.root_path).await;

        if io_stop {
            if let Some(handle) = self.accept_handle.lock().unwrap().take() {
                handle.abort();
            }
        }

        tracing::info!(identity = %self.identity, "node stopped");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let node = self.clone();
                    tokio::spawn(async move { node.handle_inbound(stream).await });
                }
                Err(e) => {
                    if !self.is_active() {
                        break;
                    }
                    tracing::warn!(error = %e, "accept failed");
                }
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream) {
        let mut framed = Framed::new(stream, MultipartCodec::default());
        let first = match framed.next().await {
            Some(Ok(frames)) if frames.len() == 1 => frames,
            _ => {
                tracing::debug!("inbound connection closed before identity handshake");
                return;
            }
        };
        let peer_identity = NodeIdentity::from(first[0].clone());
        self.register_peer_connection(peer_identity, framed);
    }

    fn register_peer_connection(
        self: &Arc<Self>,
        identity: NodeIdentity,
        framed: Framed<TcpStream, MultipartCodec>,
    ) {
        let (mut sink, mut stream) = framed.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Bytes>>();

        self.peers.write().unwrap().insert(
            identity.clone(),
            PeerEntry {
                role: None,
                last_seen: Instant::now(),
                outbound: tx,
            },
        );

        tokio::spawn(async move {
            while let Some(frames) = rx.recv().await {
                if sink.send(frames).await.is_err() {
                    break;
                }
            }
        });

        let node = self.clone();
        let peer_id = identity;
        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(frames) => match Envelope::decode_frames(peer_id.clone(), frames) {
                        Ok(envelope) => node.dispatch(envelope),
                        Err(e) => tracing::warn!(peer = %peer_id, error = %e, "bad envelope"),
                    },
                    Err(e) => {
                        tracing::debug!(peer = %peer_id, error = %e, "peer read error");
                        break;
                    }
                }
            }
            node.handle_peer_gone(&peer_id);
        });
    }

    fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        if let Some(entry) = self.peers.write().unwrap().get_mut(&envelope.peer) {
            entry.last_seen = Instant::now();
        }

        match envelope.msg_type {
            MessageType::Greeting => self.handle_greeting(envelope.peer, envelope.body),
            MessageType::Disconnect => self.handle_disconnect(envelope.peer),
            MessageType::GreetingReply => {}
            _ => {
                if let Some(fid) = &envelope.flow_id {
                    self.flows
                        .resolve(fid, envelope.peer.clone(), envelope.body.clone());
                }
                let handler = self.handlers.read().unwrap().get(&envelope.msg_type).cloned();
                if let Some(handler) = handler {
                    handler(envelope.peer, envelope.body, envelope.flow_id);
                }
            }
        }
    }

    fn handle_greeting(self: &Arc<Self>, peer: NodeIdentity, body: Option<Body>) {
        let role = body.and_then(|b| b.into_json::<NodeRole>().ok());
        if let Some(entry) = self.peers.write().unwrap().get_mut(&peer) {
            if role.is_some() {
                entry.role = role;
            }
        }
        if let Some(role) = role {
            if let Some(observer) = self.connect_observer.read().unwrap().clone() {
                observer(peer.clone(), role);
            }
        }
        let _ = self.send(peer, MessageType::GreetingReply, None, None);
    }

    fn handle_disconnect(self: &Arc<Self>, peer: NodeIdentity) {
        self.peers.write().unwrap().remove(&peer);
        if let Some(observer) = self.disconnect_observer.read().unwrap().clone() {
            observer(peer);
        }
    }

    /// Invoked when a peer's socket closes without an explicit `DISCONNECT`
    /// (crash, kill -9). Same bookkeeping as an explicit disconnect.
    fn handle_peer_gone(self: &Arc<Self>, peer: &NodeIdentity) {
        let existed = self.peers.write().unwrap().remove(peer).is_some();
        if existed {
            if let Some(observer) = self.disconnect_observer.read().unwrap().clone() {
                observer(peer.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bound(role: NodeRole) -> Arc<Node> {
        let dir = tempfile::tempdir().unwrap();
        Node::bind(role, None, dir.into_path()).await.unwrap()
    }

    #[tokio::test]
    async fn bind_picks_a_real_ephemeral_port() {
        let node = bound(NodeRole::Client).await;
        assert_ne!(node.port(), 0);
        assert!(node.is_active());
    }

    #[tokio::test]
    async fn master_identity_is_always_the_fixed_literal() {
        let node = bound(NodeRole::Master).await;
        assert_eq!(node.identity(), &NodeIdentity::master());
    }

    #[tokio::test]
    async fn connect_completes_a_greeting_handshake_and_fires_the_connect_observer() {
        let server = bound(NodeRole::Master).await;
        let client = bound(NodeRole::Client).await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        server.set_connect_observer(move |peer, role| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send((peer, role));
            }
        });

        let addr = SocketAddr::new("127.0.0.1".parse().unwrap(), server.port());
        client.connect(addr, server.identity().clone());

        let (peer, role) = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("connect observer should fire within 2s")
            .unwrap();

        assert_eq!(peer, client.identity().clone());
        assert_eq!(role, NodeRole::Client);
        assert_eq!(server.peer_role(client.identity()), Some(NodeRole::Client));
    }

    #[tokio::test]
    async fn duplicate_handler_registration_is_rejected() {
        let node = bound(NodeRole::Client).await;
        node.listen(MessageType::ReqKernel, |_, _, _| {}).unwrap();
        let err = node.listen(MessageType::ReqKernel, |_, _, _| {}).unwrap_err();
        assert!(matches!(err, NodeError::DuplicateHandler(MessageType::ReqKernel)));
    }

    #[tokio::test]
    async fn send_to_an_unknown_peer_is_a_no_op_error() {
        let node = bound(NodeRole::Client).await;
        let err = node
            .send(NodeIdentity::master(), MessageType::Disconnect, None, None)
            .unwrap_err();
        assert!(matches!(err, NodeError::UnreachablePeer(_)));
    }

    #[tokio::test]
    async fn disconnect_fires_the_disconnect_observer_on_the_peer() {
        let server = bound(NodeRole::Master).await;
        let client = bound(NodeRole::Client).await;

        let addr = SocketAddr::new("127.0.0.1".parse().unwrap(), server.port());
        client.connect(addr, server.identity().clone());
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(server.is_connected(client.identity()));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        server.set_disconnect_observer(move |peer| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(peer);
            }
        });

        let _ = client.send(server.identity().clone(), MessageType::Disconnect, None, None);

        let peer = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert_eq!(peer, client.identity().clone());
        assert!(!server.is_connected(client.identity()));
    }
}
