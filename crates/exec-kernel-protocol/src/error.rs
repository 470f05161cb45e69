use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecKernelError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("node error: {0}")]
    Node(#[from] fabric_node::NodeError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("message signature verification failed")]
    BadSignature,
    #[error("channel closed before a reply arrived")]
    ChannelClosed,
    #[error("connection heartbeat timed out")]
    HeartbeatTimeout,
}
