use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The master's identity is this fixed literal, never a `role uuid` pair.
pub const MASTER_IDENTITY: &str = "master";

/// Opaque routing address for a node on the wire.
///
/// Every peer addresses a node by this value; it is assigned once, at socket
/// creation, and never changes for the node's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeIdentity(String);

impl NodeIdentity {
    pub fn master() -> Self {
        NodeIdentity(MASTER_IDENTITY.to_owned())
    }

    /// Generate a fresh `<role> <uuid4>` identity for a non-master node.
    pub fn generate(role: NodeRole) -> Self {
        NodeIdentity(format!("{role} {}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.0.as_bytes())
    }

    pub fn is_master(&self) -> bool {
        self.0 == MASTER_IDENTITY
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NodeIdentity {
    fn from(s: String) -> Self {
        NodeIdentity(s)
    }
}

impl From<&str> for NodeIdentity {
    fn from(s: &str) -> Self {
        NodeIdentity(s.to_owned())
    }
}

impl From<Bytes> for NodeIdentity {
    fn from(b: Bytes) -> Self {
        NodeIdentity(String::from_utf8_lossy(&b).into_owned())
    }
}

/// The role a node plays in the fabric, learned from the body of its `GREETING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Master,
    Provider,
    Kernel,
    Connection,
    Client,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Provider => "provider",
            NodeRole::Kernel => "kernel",
            NodeRole::Connection => "connection",
            NodeRole::Client => "client",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(NodeRole::Master),
            "provider" => Ok(NodeRole::Provider),
            "kernel" => Ok(NodeRole::Kernel),
            "connection" => Ok(NodeRole::Connection),
            "client" => Ok(NodeRole::Client),
            other => Err(format!("unknown node role '{other}'")),
        }
    }
}
