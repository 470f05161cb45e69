//! The fabric's node runtime: identity-addressed duplex transport, flow
//! correlation, chunked file streaming and workspace cleanup (§4.1).
//!
//! Every role in the fabric (master, provider, worker, client, connection)
//! is built on top of one [`Node`], which owns its own listening socket and
//! dials peers it already knows the identity of.

mod error;
mod file_stream;
mod flow;
mod node;
mod transport;
mod workspace;

pub use error::NodeError;
pub use file_stream::send_file;
pub use flow::{FlowReply, FlowRegistry};
pub use node::{ConnectObserver, DisconnectObserver, Handler, Node, StopHook};
pub use transport::MultipartCodec;
pub use workspace::clear_workspace;

pub use fabric_proto::{Body, Envelope, FlowId, MessageType, NodeIdentity, NodeRole};
