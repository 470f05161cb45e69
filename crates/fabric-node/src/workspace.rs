//! Workspace cleanup (§4.1 "Clear workspace"): wipe everything a node has
//! written under its own `root_path`, and prune empty directories on stop.

use std::path::Path;
use std::sync::Arc;

use fabric_proto::{MessageType, NodeIdentity};

use crate::node::Node;
use crate::NodeError;

/// Ask `target` to delete everything under its root directory, waiting for
/// its acknowledgement.
pub async fn clear_workspace(node: &Arc<Node>, target: NodeIdentity) -> Result<(), NodeError> {
    let (flow_id, rx) = node.flows().new_oneshot();
    node.send(target, MessageType::ReqClearWorkspace, None, Some(flow_id.clone()))?;
    rx.await
        .map_err(|_| NodeError::Protocol("workspace clear reply never arrived".into()))?;
    node.flows().del(&flow_id);
    Ok(())
}

pub(crate) fn register_builtins(node: &Arc<Node>) {
    let clear_node = node.clone();
    node.listen_builtin(MessageType::ReqClearWorkspace, move |peer, _body, flow_id| {
        let node = clear_node.clone();
        tokio::spawn(async move {
            if let Err(e) = clear_dir_contents(node.root_path()).await {
                tracing::warn!(error = %e, "failed clearing workspace");
            }
            let _ = node.send(peer, MessageType::ResClearWorkspace, None, flow_id);
        });
    });
}

async fn clear_dir_contents(root: &Path) -> Result<(), std::io::Error> {
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

/// Remove now-empty directories left under `root` after a node stops. Errors
/// are logged, not propagated — this is best-effort tidiness, not a
/// correctness requirement.
pub(crate) async fn prune_empty_dirs(root: &Path) {
    if let Err(e) = prune_inner(root).await {
        tracing::debug!(error = %e, path = %root.display(), "prune_empty_dirs failed");
    }
}

async fn prune_inner(dir: &Path) -> Result<(), std::io::Error> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut subdirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            subdirs.push(entry.path());
        }
    }
    for subdir in subdirs {
        Box::pin(prune_inner(&subdir)).await?;
        let mut remaining = tokio::fs::read_dir(&subdir).await?;
        if remaining.next_entry().await?.is_none() {
            tokio::fs::remove_dir(&subdir).await?;
        }
    }
    Ok(())
}
