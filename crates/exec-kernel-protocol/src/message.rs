//! Signed shell/iopub message format (§6): `[signature, header, parent_header,
//! metadata, content]`, HMAC-SHA256 over the four JSON frames keyed by the
//! kernel's session key.

use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::ExecKernelError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub msg_type: String,
    pub username: String,
    pub session: String,
    pub date: String,
    pub version: String,
}

impl Header {
    pub fn new(msg_type: impl Into<String>, session: &str) -> Self {
        Header {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.into(),
            username: "kernel".to_owned(),
            session: session.to_owned(),
            date: Utc::now().to_rfc3339(),
            version: "5.3".to_owned(),
        }
    }

    pub fn with_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.msg_id = msg_id.into();
        self
    }
}

/// One signed shell/iopub message.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub parent_header: Option<Header>,
    pub metadata: serde_json::Value,
    pub content: serde_json::Value,
}

impl Message {
    pub fn new(header: Header, content: serde_json::Value) -> Self {
        Message {
            header,
            parent_header: None,
            metadata: serde_json::json!({}),
            content,
        }
    }

    /// Build a reply to `self`: same session, fresh `msg_id`, `self`'s header
    /// carried as `parent_header` (the correlation callers key replies on).
    pub fn reply(&self, msg_type: impl Into<String>, content: serde_json::Value) -> Message {
        Message {
            header: Header::new(msg_type, &self.header.session),
            parent_header: Some(self.header.clone()),
            metadata: serde_json::json!({}),
            content,
        }
    }

    pub fn encode_frames(&self, session_key: &[u8]) -> Result<Vec<Bytes>, ExecKernelError> {
        let header_json = serde_json::to_vec(&self.header)?;
        let parent_json = match &self.parent_header {
            Some(h) => serde_json::to_vec(h)?,
            None => b"{}".to_vec(),
        };
        let metadata_json = serde_json::to_vec(&self.metadata)?;
        let content_json = serde_json::to_vec(&self.content)?;

        let signature = hex::encode(mac_digest(
            session_key,
            &[&header_json, &parent_json, &metadata_json, &content_json],
        ));

        Ok(vec![
            Bytes::from(signature),
            Bytes::from(header_json),
            Bytes::from(parent_json),
            Bytes::from(metadata_json),
            Bytes::from(content_json),
        ])
    }

    pub fn decode_frames(
        frames: Vec<Bytes>,
        session_key: &[u8],
    ) -> Result<Self, ExecKernelError> {
        if frames.len() != 5 {
            return Err(ExecKernelError::Malformed(format!(
                "expected 5 frames, got {}",
                frames.len()
            )));
        }
        let signature = hex::decode(&frames[0])
            .map_err(|_| ExecKernelError::Malformed("signature is not hex".into()))?;
        verify_mac(
            session_key,
            &[&frames[1], &frames[2], &frames[3], &frames[4]],
            &signature,
        )?;

        let header: Header = serde_json::from_slice(&frames[1])?;
        let parent_header: Option<Header> = if frames[2].as_ref() == b"{}" {
            None
        } else {
            Some(serde_json::from_slice(&frames[2])?)
        };
        let metadata = serde_json::from_slice(&frames[3])?;
        let content = serde_json::from_slice(&frames[4])?;

        Ok(Message {
            header,
            parent_header,
            metadata,
            content,
        })
    }
}

fn mac_digest(key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

fn verify_mac(key: &[u8], parts: &[&[u8]], signature: &[u8]) -> Result<(), ExecKernelError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any length");
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(signature)
        .map_err(|_| ExecKernelError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"test-session-key";

    #[test]
    fn a_request_round_trips_through_encode_decode() {
        let header = Header::new("execute_request", "session-1");
        let msg = Message::new(header, serde_json::json!({"code": "1 + 1"}));

        let frames = msg.encode_frames(KEY).unwrap();
        assert_eq!(frames.len(), 5);

        let decoded = Message::decode_frames(frames, KEY).unwrap();
        assert_eq!(decoded.header.msg_type, "execute_request");
        assert_eq!(decoded.header.session, "session-1");
        assert!(decoded.parent_header.is_none());
        assert_eq!(decoded.content["code"], "1 + 1");
    }

    #[test]
    fn reply_carries_the_original_as_its_parent_header() {
        let request = Message::new(Header::new("execute_request", "session-1"), serde_json::json!({}));
        let reply = request.reply("execute_reply", serde_json::json!({"status": "ok"}));

        assert_eq!(reply.parent_header.as_ref().unwrap().msg_id, request.header.msg_id);
        assert_ne!(reply.header.msg_id, request.header.msg_id);
        assert_eq!(reply.header.session, request.header.session);
    }

    #[test]
    fn decoding_with_the_wrong_key_is_rejected() {
        let msg = Message::new(Header::new("status", "session-1"), serde_json::json!({"state": "idle"}));
        let frames = msg.encode_frames(KEY).unwrap();

        let err = Message::decode_frames(frames, b"wrong-key").unwrap_err();
        assert!(matches!(err, ExecKernelError::BadSignature));
    }

    #[test]
    fn decoding_a_tampered_frame_is_rejected() {
        let msg = Message::new(Header::new("status", "session-1"), serde_json::json!({"state": "idle"}));
        let mut frames = msg.encode_frames(KEY).unwrap();
        frames[4] = Bytes::from(serde_json::to_vec(&serde_json::json!({"state": "busy"})).unwrap());

        let err = Message::decode_frames(frames, KEY).unwrap_err();
        assert!(matches!(err, ExecKernelError::BadSignature));
    }

    #[test]
    fn decoding_the_wrong_number_of_frames_is_rejected() {
        let err = Message::decode_frames(vec![Bytes::from_static(b"only one")], KEY).unwrap_err();
        assert!(matches!(err, ExecKernelError::Malformed(_)));
    }
}
