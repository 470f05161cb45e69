//! Wire types for the kernel coordination fabric.
//!
//! The envelope shape is frozen: `[peer_identity, message_type(u16 LE),
//! flow_id, body_type(1 byte), body]`. This crate owns that shape plus the
//! JSON payload types carried by each message type; it knows nothing about
//! sockets, dispatch, or flow bookkeeping (see `fabric-node` for that).

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod identity;
pub mod message;
pub mod payload;

pub use identity::{NodeIdentity, NodeRole, MASTER_IDENTITY};
pub use message::MessageType;
pub use payload::*;

/// A `<originator_identity>/<monotonic_seq>` correlation id.
///
/// Stable across every hop a flow's reply travels through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(String);

impl FlowId {
    /// Build a new flow id from its originator and a per-originator sequence number.
    pub fn new(originator: &NodeIdentity, seq: u64) -> Self {
        FlowId(format!("{originator}/{seq}"))
    }

    /// The originator identity encoded as the prefix of this flow id.
    pub fn origin(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for FlowId {
    fn from(s: String) -> Self {
        FlowId(s)
    }
}

impl From<&str> for FlowId {
    fn from(s: &str) -> Self {
        FlowId(s.to_owned())
    }
}

/// Tag byte distinguishing a raw-bytes body (used only by `STREAM_FILE`) from
/// a UTF-8 JSON body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BodyType {
    Raw = 0,
    Json = 1,
}

impl TryFrom<u8> for BodyType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BodyType::Raw),
            1 => Ok(BodyType::Json),
            other => Err(ProtoError::UnknownBodyType(other)),
        }
    }
}

/// Body of a message: either an opaque byte blob (file chunks) or a JSON value.
#[derive(Debug, Clone)]
pub enum Body {
    Raw(Bytes),
    Json(serde_json::Value),
}

impl Body {
    pub fn json<T: Serialize>(value: &T) -> Result<Self, ProtoError> {
        Ok(Body::Json(serde_json::to_value(value)?))
    }

    pub fn into_json<T: for<'de> Deserialize<'de>>(self) -> Result<T, ProtoError> {
        match self {
            Body::Json(v) => Ok(serde_json::from_value(v)?),
            Body::Raw(_) => Err(ProtoError::ExpectedJson),
        }
    }

    pub fn into_raw(self) -> Result<Bytes, ProtoError> {
        match self {
            Body::Raw(b) => Ok(b),
            Body::Json(_) => Err(ProtoError::ExpectedRaw),
        }
    }

    fn body_type(&self) -> BodyType {
        match self {
            Body::Raw(_) => BodyType::Raw,
            Body::Json(_) => BodyType::Json,
        }
    }
}

/// A fully decoded envelope, as handed to a dispatch handler.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Destination on send, source on receive — the node runtime rewrites
    /// this frame at each hop.
    pub peer: NodeIdentity,
    pub msg_type: MessageType,
    pub flow_id: Option<FlowId>,
    pub body: Option<Body>,
}

impl Envelope {
    pub fn new(peer: NodeIdentity, msg_type: MessageType) -> Self {
        Envelope {
            peer,
            msg_type,
            flow_id: None,
            body: None,
        }
    }

    pub fn with_flow(mut self, flow_id: FlowId) -> Self {
        self.flow_id = Some(flow_id);
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    /// Encode to the wire-frame list, excluding the leading destination-identity
    /// routing frame that the transport layer prepends/strips itself.
    pub fn encode_frames(&self) -> Vec<Bytes> {
        let mut frames = Vec::with_capacity(4);
        frames.push(self.msg_type.pack());
        frames.push(Bytes::from(
            self.flow_id
                .as_ref()
                .map(|f| f.as_str().to_owned())
                .unwrap_or_default(),
        ));
        if let Some(body) = &self.body {
            frames.push(Bytes::copy_from_slice(&[body.body_type() as u8]));
            match body {
                Body::Raw(b) => frames.push(b.clone()),
                Body::Json(v) => frames.push(Bytes::from(serde_json::to_vec(v).unwrap_or_default())),
            }
        }
        frames
    }

    /// Decode a frame list received from `peer` (the transport has already
    /// resolved the sender identity for this hop).
    pub fn decode_frames(peer: NodeIdentity, mut frames: Vec<Bytes>) -> Result<Self, ProtoError> {
        if frames.is_empty() {
            return Err(ProtoError::Truncated);
        }
        let type_frame = frames.remove(0);
        let msg_type = MessageType::unpack(&type_frame)?;

        let flow_id = if frames.is_empty() {
            None
        } else {
            let raw = frames.remove(0);
            if raw.is_empty() {
                None
            } else {
                Some(FlowId::from(String::from_utf8_lossy(&raw).into_owned()))
            }
        };

        let body = if frames.len() >= 2 {
            let body_type = BodyType::try_from(frames.remove(0)[0])?;
            let payload = frames.remove(0);
            Some(match body_type {
                BodyType::Raw => Body::Raw(payload),
                BodyType::Json => Body::Json(serde_json::from_slice(&payload)?),
            })
        } else {
            None
        };

        Ok(Envelope {
            peer,
            msg_type,
            flow_id,
            body,
        })
    }
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("envelope missing required frames")]
    Truncated,
    #[error("unknown message type code {0}")]
    UnknownMessageType(u16),
    #[error("unknown body type tag {0}")]
    UnknownBodyType(u8),
    #[error("expected a JSON body")]
    ExpectedJson,
    #[error("expected a raw body")]
    ExpectedRaw,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_with_json_body_round_trips_through_frames() {
        let identity = NodeIdentity::generate(NodeRole::Client);
        let flow = FlowId::new(&identity, 1);
        let envelope = Envelope::new(NodeIdentity::master(), MessageType::ReqKernel)
            .with_flow(flow.clone())
            .with_body(Body::Json(serde_json::json!({"purpose": "test"})));

        let frames = envelope.encode_frames();
        let decoded = Envelope::decode_frames(NodeIdentity::master(), frames).unwrap();

        assert_eq!(decoded.msg_type, MessageType::ReqKernel);
        assert_eq!(decoded.flow_id, Some(flow));
        match decoded.body {
            Some(Body::Json(v)) => assert_eq!(v["purpose"], "test"),
            other => panic!("expected a JSON body, got {other:?}"),
        }
    }

    #[test]
    fn envelope_with_no_flow_or_body_round_trips() {
        let envelope = Envelope::new(NodeIdentity::master(), MessageType::Disconnect);
        let frames = envelope.encode_frames();
        let decoded = Envelope::decode_frames(NodeIdentity::master(), frames).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Disconnect);
        assert!(decoded.flow_id.is_none());
        assert!(decoded.body.is_none());
    }

    #[test]
    fn raw_body_round_trips_byte_for_byte() {
        let payload = Bytes::from_static(b"\x00\x01\xff chunk");
        let envelope = Envelope::new(NodeIdentity::master(), MessageType::StreamFile)
            .with_body(Body::Raw(payload.clone()));

        let frames = envelope.encode_frames();
        let decoded = Envelope::decode_frames(NodeIdentity::master(), frames).unwrap();

        match decoded.body {
            Some(Body::Raw(b)) => assert_eq!(b, payload),
            other => panic!("expected a raw body, got {other:?}"),
        }
    }

    #[test]
    fn flow_id_origin_is_the_originator_prefix() {
        let identity = NodeIdentity::generate(NodeRole::Provider);
        let flow = FlowId::new(&identity, 42);
        assert_eq!(flow.origin(), identity.as_str());
        assert!(flow.as_str().ends_with("/42"));
    }

    #[test]
    fn empty_frame_list_is_rejected() {
        assert!(matches!(
            Envelope::decode_frames(NodeIdentity::master(), vec![]),
            Err(ProtoError::Truncated)
        ));
    }
}
