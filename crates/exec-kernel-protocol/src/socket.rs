//! TCP transport for the three execution-kernel channels (§4.4/§6): `shell`
//! (request/reply), `iopub` (worker → connection broadcast) and `hb`
//! (single-byte echo liveness probe). Framing is the fabric's own
//! length-delimited multipart codec, reused rather than reinvented.

use std::net::IpAddr;

use bytes::Bytes;
use fabric_node::MultipartCodec;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::message::Message;
use crate::ExecKernelError;

type Wire = Framed<TcpStream, MultipartCodec>;

/// A `shell` or `iopub` channel: signed [`Message`] frames in, out.
pub struct MessageChannel(Wire);

impl MessageChannel {
    pub async fn send(&mut self, msg: &Message, session_key: &[u8]) -> Result<(), ExecKernelError> {
        let frames = msg.encode_frames(session_key)?;
        self.0.send(frames).await?;
        Ok(())
    }

    pub async fn recv(&mut self, session_key: &[u8]) -> Option<Result<Message, ExecKernelError>> {
        match self.0.next().await? {
            Ok(frames) => Some(Message::decode_frames(frames, session_key)),
            Err(e) => Some(Err(ExecKernelError::Node(e))),
        }
    }

    /// Split into independent halves so a reader task can keep draining
    /// replies while callers send on the same channel concurrently (used by
    /// the connection side's `shell` channel).
    pub fn split(self) -> (MessageSink, MessageStream) {
        let (sink, stream) = self.0.split();
        (MessageSink(sink), MessageStream(stream))
    }
}

pub struct MessageSink(SplitSink<Wire, Vec<Bytes>>);

impl MessageSink {
    pub async fn send(&mut self, msg: &Message, session_key: &[u8]) -> Result<(), ExecKernelError> {
        let frames = msg.encode_frames(session_key)?;
        self.0.send(frames).await?;
        Ok(())
    }
}

pub struct MessageStream(SplitStream<Wire>);

impl MessageStream {
    pub async fn recv(&mut self, session_key: &[u8]) -> Option<Result<Message, ExecKernelError>> {
        match self.0.next().await? {
            Ok(frames) => Some(Message::decode_frames(frames, session_key)),
            Err(e) => Some(Err(ExecKernelError::Node(e))),
        }
    }
}

/// The `hb` channel: whatever bytes arrive are echoed back unchanged.
pub struct HeartbeatChannel(Wire);

impl HeartbeatChannel {
    pub async fn send(&mut self, payload: Bytes) -> Result<(), ExecKernelError> {
        self.0.send(vec![payload]).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Option<Result<Bytes, ExecKernelError>> {
        match self.0.next().await? {
            Ok(mut frames) => Some(Ok(frames.pop().unwrap_or_default())),
            Err(e) => Some(Err(ExecKernelError::Node(e))),
        }
    }
}

/// The three ports a worker advertises in `READY_KERNEL`'s connection descriptor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KernelPorts {
    pub shell: u16,
    pub iopub: u16,
    pub hb: u16,
}

/// Worker-side: the three listeners, bound but not yet accepted.
pub struct KernelListeners {
    shell: TcpListener,
    iopub: TcpListener,
    hb: TcpListener,
}

pub async fn bind_listeners(host: IpAddr) -> Result<(KernelListeners, KernelPorts), ExecKernelError> {
    let shell = TcpListener::bind((host, 0)).await?;
    let iopub = TcpListener::bind((host, 0)).await?;
    let hb = TcpListener::bind((host, 0)).await?;
    let ports = KernelPorts {
        shell: shell.local_addr()?.port(),
        iopub: iopub.local_addr()?.port(),
        hb: hb.local_addr()?.port(),
    };
    Ok((KernelListeners { shell, iopub, hb }, ports))
}

impl KernelListeners {
    /// Accept exactly one peer on each channel — the single Connection this
    /// worker is paired with.
    pub async fn accept(self) -> Result<(MessageChannel, MessageChannel, HeartbeatChannel), ExecKernelError> {
        let (shell, _) = self.shell.accept().await?;
        let (iopub, _) = self.iopub.accept().await?;
        let (hb, _) = self.hb.accept().await?;
        Ok((
            MessageChannel(Framed::new(shell, MultipartCodec::default())),
            MessageChannel(Framed::new(iopub, MultipartCodec::default())),
            HeartbeatChannel(Framed::new(hb, MultipartCodec::default())),
        ))
    }
}

/// Connection-side: dial all three ports a worker advertised.
pub async fn connect(
    host: IpAddr,
    ports: &KernelPorts,
) -> Result<(MessageChannel, MessageChannel, HeartbeatChannel), ExecKernelError> {
    let shell = TcpStream::connect((host, ports.shell)).await?;
    let iopub = TcpStream::connect((host, ports.iopub)).await?;
    let hb = TcpStream::connect((host, ports.hb)).await?;
    Ok((
        MessageChannel(Framed::new(shell, MultipartCodec::default())),
        MessageChannel(Framed::new(iopub, MultipartCodec::default())),
        HeartbeatChannel(Framed::new(hb, MultipartCodec::default())),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Header;
    use std::net::Ipv4Addr;

    const KEY: &[u8] = b"session-key";

    #[tokio::test]
    async fn connection_dials_every_port_a_worker_advertised() {
        let host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let (listeners, ports) = bind_listeners(host).await.unwrap();

        let accept_task = tokio::spawn(listeners.accept());
        let (mut conn_shell, mut conn_iopub, mut conn_hb) = connect(host, &ports).await.unwrap();
        let (mut w_shell, mut w_iopub, mut w_hb) = accept_task.await.unwrap().unwrap();

        let request = Message::new(Header::new("execute_request", "s1"), serde_json::json!({"code": "2"}));
        conn_shell.send(&request, KEY).await.unwrap();
        let received = w_shell.recv(KEY).await.unwrap().unwrap();
        assert_eq!(received.header.msg_type, "execute_request");

        let status = Message::new(Header::new("status", "s1"), serde_json::json!({"state": "busy"}));
        w_iopub.send(&status, KEY).await.unwrap();
        let received = conn_iopub.recv(KEY).await.unwrap().unwrap();
        assert_eq!(received.content["state"], "busy");

        conn_hb.send(Bytes::from_static(b"ping")).await.unwrap();
        let echoed = w_hb.recv().await.unwrap().unwrap();
        assert_eq!(echoed, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn split_sink_and_stream_can_be_driven_independently() {
        let host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let (listeners, ports) = bind_listeners(host).await.unwrap();

        let accept_task = tokio::spawn(listeners.accept());
        let (mut conn_shell, _conn_iopub, _conn_hb) = connect(host, &ports).await.unwrap();
        let (w_shell, _w_iopub, _w_hb) = accept_task.await.unwrap().unwrap();
        let (mut w_sink, mut w_stream) = w_shell.split();

        let request = Message::new(Header::new("execute_request", "s1"), serde_json::json!({"code": "3"}));
        conn_shell.send(&request, KEY).await.unwrap();
        let received = w_stream.recv(KEY).await.unwrap().unwrap();

        let reply = received.reply("execute_reply", serde_json::json!({"status": "ok"}));
        w_sink.send(&reply, KEY).await.unwrap();
        let received_reply = conn_shell.recv(KEY).await.unwrap().unwrap();
        assert_eq!(received_reply.header.msg_type, "execute_reply");
    }
}
