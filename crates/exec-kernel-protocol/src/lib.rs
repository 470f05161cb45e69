//! Signed shell/iopub/hb message protocol shared by the worker and its
//! paired Connection (§4.4, §6), plus the minimal in-process execution
//! kernel that makes `execute()` testable end to end over real sockets.

mod error;
mod interpreter;
mod kernel;
mod message;
mod socket;

pub use error::ExecKernelError;
pub use kernel::ExecutionKernel;
pub use message::{Header, Message};
pub use socket::{
    bind_listeners, connect, HeartbeatChannel, KernelListeners, KernelPorts, MessageChannel,
    MessageSink, MessageStream,
};
