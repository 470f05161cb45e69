//! Length-delimited multipart framing over a plain `TcpStream`.
//!
//! The fabric's envelope is a short list of byte frames (identity, type,
//! flow id, body type, body). The reference implementation gets multipart
//! framing for free from a ZeroMQ ROUTER socket; this port frames an entire
//! multipart message as one outer length-delimited block (via
//! [`tokio_util::codec::LengthDelimitedCodec`]) whose payload is a small
//! manual encoding of `[frame_count: u8][len: u32 LE, data]*`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::NodeError;

pub struct MultipartCodec(LengthDelimitedCodec);

impl Default for MultipartCodec {
    fn default() -> Self {
        MultipartCodec(
            LengthDelimitedCodec::builder()
                .max_frame_length(16 * 1024 * 1024)
                .new_codec(),
        )
    }
}

impl Decoder for MultipartCodec {
    type Item = Vec<Bytes>;
    type Error = NodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(mut outer) = self.0.decode(src).map_err(NodeError::Io)? else {
            return Ok(None);
        };
        if outer.is_empty() {
            return Ok(Some(Vec::new()));
        }
        let frame_count = outer.get_u8();
        let mut frames = Vec::with_capacity(frame_count as usize);
        for _ in 0..frame_count {
            if outer.remaining() < 4 {
                return Err(NodeError::Protocol("truncated multipart frame".into()));
            }
            let len = outer.get_u32() as usize;
            if outer.remaining() < len {
                return Err(NodeError::Protocol("truncated multipart frame body".into()));
            }
            frames.push(outer.copy_to_bytes(len));
        }
        Ok(Some(frames))
    }
}

impl Encoder<Vec<Bytes>> for MultipartCodec {
    type Error = NodeError;

    fn encode(&mut self, item: Vec<Bytes>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut outer = BytesMut::new();
        outer.put_u8(item.len() as u8);
        for frame in &item {
            outer.put_u32(frame.len() as u32);
            outer.put_slice(frame);
        }
        self.0
            .encode(outer.freeze(), dst)
            .map_err(NodeError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_then_decodes_a_multipart_list() {
        let mut codec = MultipartCodec::default();
        let frames = vec![
            Bytes::from_static(b"client abcd-1234"),
            Bytes::from_static(b"\x14\x00"),
            Bytes::from_static(b""),
            Bytes::from_static(b"\x01"),
            Bytes::from_static(b"{\"purpose\":\"test\"}"),
        ];

        let mut buf = BytesMut::new();
        codec.encode(frames.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frames);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_on_empty_buffer_returns_none_without_consuming_anything() {
        let mut codec = MultipartCodec::default();
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn a_zero_frame_message_round_trips_to_an_empty_list() {
        let mut codec = MultipartCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Vec::new(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn partial_frame_is_not_decoded_until_the_rest_arrives() {
        let mut codec = MultipartCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(vec![Bytes::from_static(b"hello")], &mut buf).unwrap();

        let mut truncated = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut truncated).unwrap().is_none());
    }
}
