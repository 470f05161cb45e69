//! The client-side handle to one worker's execution kernel (§4.5): opens the
//! three execution sockets, runs the heartbeat state machine, and aggregates
//! `iopub` output per `msg_id` for `execute()`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use exec_kernel_protocol::{Header, HeartbeatChannel, Message, MessageSink, MessageStream};
use fabric_node::{Node, NodeIdentity};
use fabric_proto::KernelDescriptor;
use serde_json::json;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeartbeatState {
    Waiting,
    Pinged,
}

/// A live worker the client can run code on. Dropped from the client's map
/// once its heartbeat goes dead.
pub struct Connection {
    kernel_id: String,
    descriptor: KernelDescriptor,
    session_key: Vec<u8>,
    client_node: Arc<Node>,
    shell_sink: AsyncMutex<MessageSink>,
    alive: AtomicBool,
    executed: AtomicU64,
    executing: AtomicU64,
    status: StdMutex<String>,
    pending: StdMutex<HashMap<String, oneshot::Sender<Vec<String>>>>,
    accum: StdMutex<HashMap<String, Vec<String>>>,
}

impl Connection {
    /// Dial a worker's advertised `shell`/`iopub`/`hb` ports plus its
    /// node-runtime file-upload channel, and start the background reader and
    /// heartbeat tasks. `on_death` fires exactly once, when the heartbeat
    /// state machine declares the worker dead.
    pub async fn connect(
        client_node: Arc<Node>,
        descriptor: KernelDescriptor,
        on_death: impl Fn(String) + Send + Sync + 'static,
    ) -> Result<Arc<Connection>, ClientError> {
        let host = descriptor
            .ip
            .parse()
            .map_err(|_| ClientError::BadAddress(descriptor.ip.clone()))?;
        let ports = exec_kernel_protocol::KernelPorts {
            shell: descriptor.shell,
            iopub: descriptor.iopub,
            hb: descriptor.hb,
        };
        let (shell, iopub, hb) = exec_kernel_protocol::connect(host, &ports).await?;
        let (shell_sink, shell_stream) = shell.split();

        let process_identity = NodeIdentity::from(descriptor.process_key.clone());
        let process_addr = SocketAddr::new(host, descriptor.process);
        client_node.connect(process_addr, process_identity);

        let session_key = descriptor.session_key.clone().into_bytes();

        let connection = Arc::new(Connection {
            kernel_id: descriptor.kernel_id.clone(),
            descriptor,
            session_key,
            client_node,
            shell_sink: AsyncMutex::new(shell_sink),
            alive: AtomicBool::new(true),
            executed: AtomicU64::new(0),
            executing: AtomicU64::new(0),
            status: StdMutex::new("idle".to_owned()),
            pending: StdMutex::new(HashMap::new()),
            accum: StdMutex::new(HashMap::new()),
        });

        let iopub_conn = connection.clone();
        tokio::spawn(async move { iopub_conn.run_iopub(iopub).await });

        let shell_conn = connection.clone();
        tokio::spawn(async move { shell_conn.run_shell_reader(shell_stream).await });

        let hb_conn = connection.clone();
        let on_death = Arc::new(on_death);
        tokio::spawn(async move { hb_conn.run_heartbeat(hb, on_death).await });

        Ok(connection)
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    pub fn descriptor(&self) -> &KernelDescriptor {
        &self.descriptor
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    pub fn executing(&self) -> u64 {
        self.executing.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> String {
        self.status.lock().unwrap().clone()
    }

    /// Run `code` and return its ordered `stream`/`error` output lines.
    /// Waits for the kernel to report `idle` before sending, polling at
    /// 100 ms granularity.
    pub async fn execute(
        &self,
        code: &str,
        msg_id: Option<String>,
    ) -> Result<Vec<String>, ClientError> {
        while self.status.lock().unwrap().as_str() != "idle" {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let mut header = Header::new("execute_request", &self.descriptor.kernel_id);
        if let Some(id) = msg_id {
            header = header.with_msg_id(id);
        }
        let msg_id = header.msg_id.clone();

        let request = Message::new(
            header,
            json!({
                "code": code,
                "silent": false,
                "allow_stdin": false,
                "store_history": false,
            }),
        );

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(msg_id.clone(), tx);
        self.accum.lock().unwrap().insert(msg_id.clone(), Vec::new());

        self.executed.fetch_add(1, Ordering::SeqCst);
        self.shell_sink
            .lock()
            .await
            .send(&request, &self.session_key)
            .await?;

        rx.await.map_err(|_| ClientError::HeartbeatTimeout)
    }

    async fn run_iopub(self: Arc<Self>, mut iopub: exec_kernel_protocol::MessageChannel) {
        loop {
            match iopub.recv(&self.session_key).await {
                Some(Ok(msg)) => self.handle_iopub(msg),
                Some(Err(e)) => tracing::warn!(error = %e, "bad iopub message"),
                None => break,
            }
        }
    }

    fn handle_iopub(&self, msg: Message) {
        let Some(parent) = &msg.parent_header else {
            return;
        };
        match msg.header.msg_type.as_str() {
            "status" => {
                if let Some(state) = msg.content.get("execution_state").and_then(|v| v.as_str()) {
                    *self.status.lock().unwrap() = state.to_owned();
                }
            }
            "stream" => {
                let text = msg.content.get("text").and_then(|v| v.as_str()).unwrap_or("");
                let mut accum = self.accum.lock().unwrap();
                if let Some(lines) = accum.get_mut(&parent.msg_id) {
                    lines.extend(text.lines().map(str::to_owned));
                }
            }
            "error" => {
                let traceback = msg
                    .content
                    .get("traceback")
                    .and_then(|v| v.as_array())
                    .map(|lines| {
                        lines
                            .iter()
                            .filter_map(|v| v.as_str())
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                let mut accum = self.accum.lock().unwrap();
                if let Some(lines) = accum.get_mut(&parent.msg_id) {
                    lines.push(traceback);
                }
            }
            _ => {}
        }
    }

    async fn run_shell_reader(self: Arc<Self>, mut shell: MessageStream) {
        loop {
            match shell.recv(&self.session_key).await {
                Some(Ok(msg)) => self.handle_shell(msg),
                Some(Err(e)) => tracing::warn!(error = %e, "bad shell reply"),
                None => break,
            }
        }
    }

    fn handle_shell(&self, msg: Message) {
        if msg.header.msg_type != "execute_reply" {
            return;
        }
        let Some(parent) = &msg.parent_header else {
            return;
        };
        if let Some(count) = msg.content.get("execution_count").and_then(|v| v.as_u64()) {
            self.executing.store(count, Ordering::SeqCst);
        }
        let sender = self.pending.lock().unwrap().remove(&parent.msg_id);
        let lines = self.accum.lock().unwrap().remove(&parent.msg_id).unwrap_or_default();
        if let Some(sender) = sender {
            let _ = sender.send(lines);
        }
    }

    /// `waiting -> pinged -> dead`, 3 s interval, first ping 1 s after connect.
    async fn run_heartbeat(
        self: Arc<Self>,
        mut hb: HeartbeatChannel,
        on_death: Arc<dyn Fn(String) + Send + Sync>,
    ) {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut state = HeartbeatState::Waiting;
        loop {
            match state {
                HeartbeatState::Waiting => {
                    if hb.send(bytes::Bytes::from_static(b"ping")).await.is_err() {
                        break;
                    }
                    state = HeartbeatState::Pinged;
                }
                HeartbeatState::Pinged => {
                    match tokio::time::timeout(Duration::from_secs(3), hb.recv()).await {
                        Ok(Some(Ok(_))) => state = HeartbeatState::Waiting,
                        _ => break,
                    }
                }
            }
            if state == HeartbeatState::Waiting {
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }

        tracing::info!(kernel_id = %self.kernel_id, "connection heartbeat declared dead");
        self.stop().await;
        on_death(self.kernel_id.clone());
    }

    /// Stop this connection: mark it dead, tell the worker to disconnect (it
    /// self-terminates on seeing its paired Connection go away) and tear down
    /// the node-runtime file-upload channel. The heartbeat/reader tasks exit
    /// on their own once the underlying sockets close. Stopping the node
    /// itself is the owning `Client`'s job.
    pub async fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let process_identity = NodeIdentity::from(self.descriptor.process_key.clone());
        let _ = self
            .client_node
            .send(process_identity, fabric_node::MessageType::Disconnect, None, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exec_kernel_protocol::{bind_listeners, ExecutionKernel};
    use fabric_proto::NodeRole;

    fn descriptor_for(ports: &exec_kernel_protocol::KernelPorts, session_key: &str) -> KernelDescriptor {
        KernelDescriptor {
            kernel_id: "kernel-1".to_owned(),
            session_key: session_key.to_owned(),
            ip: "127.0.0.1".to_owned(),
            hb: ports.hb,
            iopub: ports.iopub,
            shell: ports.shell,
            process_key: "worker dead-beef".to_owned(),
            process: 0,
        }
    }

    #[tokio::test]
    async fn execute_runs_code_on_a_real_kernel_and_returns_its_output() {
        let host = "127.0.0.1".parse().unwrap();
        let (listeners, ports) = bind_listeners(host).await.unwrap();
        let session_key = "test-session-key";
        let descriptor = descriptor_for(&ports, session_key);

        let accept_task = tokio::spawn(listeners.accept());

        let client_dir = tempfile::tempdir().unwrap();
        let client_node = Node::bind(NodeRole::Client, None, client_dir.into_path()).await.unwrap();

        let connection = Connection::connect(client_node, descriptor, |_| {}).await.unwrap();

        let (shell, iopub, hb) = accept_task.await.unwrap().unwrap();
        let kernel = ExecutionKernel::new(session_key.as_bytes().to_vec());
        tokio::spawn(kernel.run(shell, iopub, hb));

        let output = connection.execute("x = 4\nprint(x * 2)", None).await.unwrap();
        assert_eq!(output, vec!["8"]);
        assert_eq!(connection.executed(), 1);
        assert_eq!(connection.executing(), 1);
    }

    #[tokio::test]
    async fn heartbeat_death_stops_the_connection_and_tells_the_worker_to_disconnect() {
        let host = "127.0.0.1".parse().unwrap();
        let (listeners, ports) = bind_listeners(host).await.unwrap();
        let session_key = "test-session-key";

        // Stand in for the worker's own node-runtime link so we can observe
        // the DISCONNECT that `stop()` is supposed to send it.
        let worker_dir = tempfile::tempdir().unwrap();
        let worker_node = Node::bind(NodeRole::Kernel, None, worker_dir.into_path()).await.unwrap();

        let mut descriptor = descriptor_for(&ports, session_key);
        descriptor.process_key = worker_node.identity().as_str().to_owned();
        descriptor.process = worker_node.port();

        let accept_task = tokio::spawn(listeners.accept());
        let client_dir = tempfile::tempdir().unwrap();
        let client_node = Node::bind(NodeRole::Client, None, client_dir.into_path()).await.unwrap();

        let connection = Connection::connect(client_node, descriptor, |_| {}).await.unwrap();
        // Accept the kernel-side channels but never run an ExecutionKernel on
        // them, so the connection's pings are never ponged and its heartbeat
        // times out.
        let _kernel_side = accept_task.await.unwrap().unwrap();

        let (tx, rx) = oneshot::channel();
        let tx = StdMutex::new(Some(tx));
        worker_node.set_disconnect_observer(move |_peer| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        });

        tokio::time::timeout(Duration::from_secs(8), rx)
            .await
            .expect("worker should be told to disconnect once the heartbeat dies")
            .unwrap();

        assert!(!connection.is_alive());
    }

    #[tokio::test]
    async fn a_bad_statement_appends_its_traceback_as_one_output_line() {
        let host = "127.0.0.1".parse().unwrap();
        let (listeners, ports) = bind_listeners(host).await.unwrap();
        let session_key = "test-session-key";
        let descriptor = descriptor_for(&ports, session_key);

        let accept_task = tokio::spawn(listeners.accept());
        let client_dir = tempfile::tempdir().unwrap();
        let client_node = Node::bind(NodeRole::Client, None, client_dir.into_path()).await.unwrap();
        let connection = Connection::connect(client_node, descriptor, |_| {}).await.unwrap();

        let (shell, iopub, hb) = accept_task.await.unwrap().unwrap();
        let kernel = ExecutionKernel::new(session_key.as_bytes().to_vec());
        tokio::spawn(kernel.run(shell, iopub, hb));

        let output = connection.execute("print(nope)", None).await.unwrap();
        assert_eq!(output.len(), 1);
        assert!(output[0].contains("nope"), "traceback line should mention the failing name: {output:?}");
    }

    #[tokio::test]
    async fn stop_marks_the_connection_dead() {
        let host = "127.0.0.1".parse().unwrap();
        let (listeners, ports) = bind_listeners(host).await.unwrap();
        let session_key = "test-session-key";
        let descriptor = descriptor_for(&ports, session_key);

        let accept_task = tokio::spawn(listeners.accept());
        let client_dir = tempfile::tempdir().unwrap();
        let client_node = Node::bind(NodeRole::Client, None, client_dir.into_path()).await.unwrap();
        let connection = Connection::connect(client_node, descriptor, |_| {}).await.unwrap();
        let _kernel_side = accept_task.await.unwrap().unwrap();

        assert!(connection.is_alive());
        connection.stop().await;
        assert!(!connection.is_alive());
    }
}
