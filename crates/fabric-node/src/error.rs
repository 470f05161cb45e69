use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Proto(#[from] fabric_proto::ProtoError),
    #[error("handler already registered for message type {0:?}")]
    DuplicateHandler(fabric_proto::MessageType),
    #[error("peer {0} is not connected")]
    UnreachablePeer(String),
    #[error("flow {0} is unknown")]
    UnknownFlow(String),
}
