use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("node error: {0}")]
    Node(#[from] fabric_node::NodeError),
    #[error("execution-kernel error: {0}")]
    Kernel(#[from] exec_kernel_protocol::ExecKernelError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bad worker address: {0}")]
    BadAddress(String),
    #[error("master never replied to REQ_KERNEL")]
    NoReply,
    #[error("connection heartbeat timed out")]
    HeartbeatTimeout,
    #[error("no such kernel connection: {0}")]
    UnknownKernel(String),
}
