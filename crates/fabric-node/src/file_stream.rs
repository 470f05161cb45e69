//! Chunked file transfer (§4.1 "File streaming"): the sender pulls a file
//! across in ≤ 1 MiB chunks, paced by the receiver's `FETCH_FILE` acks so a
//! slow receiver's disk never falls behind the sender's reads.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use fabric_proto::{Body, MessageType, NodeIdentity, ReqFileServingBody, ResFileServingBody};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::node::Node;
use crate::NodeError;

const CHUNK_SIZE: usize = 1024 * 1024;

/// A chunk queue feeding the task that owns the destination `File`. Chunks
/// are written strictly in arrival order regardless of how the dispatch
/// loop schedules the tasks that enqueue them.
pub(crate) struct IncomingFile {
    chunks: mpsc::UnboundedSender<Bytes>,
}

/// Push `local_path` to `to`, landing it at `remote_path` under the peer's
/// root directory. Resolves with the receiver-reported absolute path once
/// the peer has acknowledged the final (empty) chunk.
pub async fn send_file(
    node: &Arc<Node>,
    local_path: &Path,
    remote_path: &str,
    to: NodeIdentity,
) -> Result<String, NodeError> {
    let mut file = File::open(local_path).await?;
    let (flow_id, mut replies) = node.flows().new_channel();

    node.send(
        to.clone(),
        MessageType::ReqFileServing,
        Some(Body::json(&ReqFileServingBody {
            remote_path: remote_path.to_owned(),
        })?),
        Some(flow_id.clone()),
    )?;

    let first = replies
        .recv()
        .await
        .ok_or_else(|| NodeError::UnreachablePeer(to.to_string()))?;
    let actual_path: ResFileServingBody = first
        .body
        .ok_or_else(|| NodeError::Protocol("RES_FILE_SERVING missing body".into()))?
        .into_json()?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        let chunk = bytes::Bytes::copy_from_slice(&buf[..n]);
        node.send(
            to.clone(),
            MessageType::StreamFile,
            Some(Body::Raw(chunk)),
            Some(flow_id.clone()),
        )?;

        if n == 0 {
            node.flows().del(&flow_id);
            return Ok(actual_path.actual_path);
        }

        replies
            .recv()
            .await
            .ok_or_else(|| NodeError::UnreachablePeer(to.to_string()))?;
    }
}

/// Register the receiver-side handlers every node needs regardless of role:
/// `REQ_FILE_SERVING` opens the destination file, `STREAM_FILE` writes each
/// chunk and acks with `FETCH_FILE` until the sender signals end-of-file with
/// an empty chunk.
pub(crate) fn register_builtins(node: &Arc<Node>) {
    let req_node = node.clone();
    node.listen_builtin(MessageType::ReqFileServing, move |peer, body, flow_id| {
        let node = req_node.clone();
        tokio::spawn(async move {
            let Some(flow_id) = flow_id else {
                tracing::warn!("REQ_FILE_SERVING without a flow id, dropping");
                return;
            };
            let Some(body) = body else {
                tracing::warn!("REQ_FILE_SERVING without a body, dropping");
                return;
            };
            let request: ReqFileServingBody = match body.into_json() {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed REQ_FILE_SERVING body");
                    return;
                }
            };
            let full_path = resolve_under_root(node.root_path(), &request.remote_path);
            if let Some(parent) = full_path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    tracing::warn!(error = %e, path = %full_path.display(), "cannot create parent dir");
                    return;
                }
            }
            let mut file = match File::create(&full_path).await {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(error = %e, path = %full_path.display(), "cannot create file");
                    return;
                }
            };

            let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
            node.file_recvs
                .lock()
                .unwrap()
                .insert(flow_id.clone(), IncomingFile { chunks: tx });

            let writer_node = node.clone();
            let writer_peer = peer.clone();
            let writer_flow = flow_id.clone();
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    if chunk.is_empty() {
                        break;
                    }
                    if let Err(e) = file.write_all(&chunk).await {
                        tracing::warn!(error = %e, "failed writing chunk");
                        break;
                    }
                    let _ = writer_node.send(
                        writer_peer.clone(),
                        MessageType::FetchFile,
                        None,
                        Some(writer_flow.clone()),
                    );
                }
                writer_node.file_recvs.lock().unwrap().remove(&writer_flow);
            });

            let reply = Body::json(&ResFileServingBody {
                actual_path: full_path.display().to_string(),
            });
            if let Ok(reply) = reply {
                let _ = node.send(peer, MessageType::ResFileServing, Some(reply), Some(flow_id));
            }
        });
    });

    let stream_node = node.clone();
    node.listen_builtin(MessageType::StreamFile, move |_peer, body, flow_id| {
        let node = &stream_node;
        let Some(flow_id) = flow_id else {
            tracing::warn!("STREAM_FILE without a flow id, dropping");
            return;
        };
        let Some(body) = body else {
            return;
        };
        let chunk = match body.into_raw() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "malformed STREAM_FILE body");
                return;
            }
        };

        let recvs = node.file_recvs.lock().unwrap();
        match recvs.get(&flow_id) {
            Some(incoming) => {
                let _ = incoming.chunks.send(chunk);
            }
            None => tracing::warn!(flow = %flow_id, "STREAM_FILE for unknown flow"),
        }
    });
}

fn resolve_under_root(root: &Path, remote_path: &str) -> PathBuf {
    let relative = remote_path.trim_start_matches(['/', '\\']);
    root.join(relative)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_proto::NodeRole;

    #[test]
    fn resolve_under_root_strips_leading_slashes() {
        let root = Path::new("/srv/kernel-1");
        assert_eq!(resolve_under_root(root, "/out/result.txt"), root.join("out/result.txt"));
        assert_eq!(resolve_under_root(root, "out/result.txt"), root.join("out/result.txt"));
    }

    async fn bound(role: NodeRole) -> Arc<Node> {
        let dir = tempfile::tempdir().unwrap();
        Node::bind(role, None, dir.into_path()).await.unwrap()
    }

    #[tokio::test]
    async fn send_file_lands_the_exact_bytes_on_the_receiver() {
        let receiver = bound(NodeRole::Kernel).await;
        let sender = bound(NodeRole::Connection).await;

        let addr = std::net::SocketAddr::new("127.0.0.1".parse().unwrap(), receiver.port());
        sender.connect(addr, receiver.identity().clone());
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let src_dir = tempfile::tempdir().unwrap();
        let src_path = src_dir.path().join("payload.bin");
        let content = b"the quick brown fox jumps over the lazy dog".repeat(1000);
        tokio::fs::write(&src_path, &content).await.unwrap();

        let actual_path = send_file(&sender, &src_path, "uploads/payload.bin", receiver.identity().clone())
            .await
            .unwrap();

        let written = tokio::fs::read(&actual_path).await.unwrap();
        assert_eq!(written, content);

        // The final empty chunk isn't acked, so give the receiver's writer
        // task a moment to drain it and clean up its bookkeeping.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(receiver.file_recvs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_file_handles_an_empty_source_file() {
        let receiver = bound(NodeRole::Kernel).await;
        let sender = bound(NodeRole::Connection).await;

        let addr = std::net::SocketAddr::new("127.0.0.1".parse().unwrap(), receiver.port());
        sender.connect(addr, receiver.identity().clone());
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let src_dir = tempfile::tempdir().unwrap();
        let src_path = src_dir.path().join("empty.bin");
        tokio::fs::write(&src_path, b"").await.unwrap();

        let actual_path = send_file(&sender, &src_path, "empty.bin", receiver.identity().clone())
            .await
            .unwrap();

        let written = tokio::fs::read(&actual_path).await.unwrap();
        assert!(written.is_empty());
    }
}
