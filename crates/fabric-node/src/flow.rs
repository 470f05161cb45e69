//! Flow registry: correlation records pairing a request with its reply
//! across one or more hops (§3, §4.1 "Flow semantics").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use fabric_proto::{Body, FlowId, NodeIdentity, NodeRole};
use tokio::sync::{mpsc, oneshot};

/// A reply delivered to a flow's owner, carrying the sender identity and body.
#[derive(Debug, Clone)]
pub struct FlowReply {
    pub from: NodeIdentity,
    pub body: Option<Body>,
}

enum Completion {
    /// Originator awaiting exactly one reply (e.g. `REQ_KERNEL`).
    Oneshot(oneshot::Sender<FlowReply>),
    /// Originator awaiting a stream of replies (file transfer chunk-by-chunk).
    /// `Clone`-able, so delivering one reply never consumes the registry's copy.
    Channel(mpsc::UnboundedSender<FlowReply>),
    /// Intermediate hop: no local completion, just a placeholder so the
    /// flow id round-trips back out.
    Forwarding,
}

struct FlowRecord {
    cleanup_on_next_send: AtomicBool,
    completion: Mutex<Completion>,
    /// Opaque per-flow state the owner stashes (e.g. the client identity a
    /// master remembers while a spawn is in flight).
    args: Mutex<serde_json::Value>,
}

/// Per-node table of in-flight flows, plus the monotonic sequence counter
/// used to mint new flow ids for this node's identity.
pub struct FlowRegistry {
    identity: NodeIdentity,
    seq: AtomicU64,
    flows: Mutex<HashMap<FlowId, Arc<FlowRecord>>>,
}

impl FlowRegistry {
    pub fn new(identity: NodeIdentity) -> Self {
        FlowRegistry {
            identity,
            seq: AtomicU64::new(1),
            flows: Mutex::new(HashMap::new()),
        }
    }

    fn next_id(&self) -> FlowId {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        FlowId::new(&self.identity, seq)
    }

    fn insert(&self, id: FlowId, completion: Completion) {
        let record = Arc::new(FlowRecord {
            cleanup_on_next_send: AtomicBool::new(false),
            completion: Mutex::new(completion),
            args: Mutex::new(serde_json::Value::Null),
        });
        self.flows.lock().unwrap().insert(id, record);
    }

    /// Allocate a new flow awaited by a single reply.
    pub fn new_oneshot(&self) -> (FlowId, oneshot::Receiver<FlowReply>) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.insert(id.clone(), Completion::Oneshot(tx));
        (id, rx)
    }

    /// Allocate a new flow awaited by a stream of replies (file transfer).
    pub fn new_channel(&self) -> (FlowId, mpsc::UnboundedReceiver<FlowReply>) {
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.insert(id.clone(), Completion::Channel(tx));
        (id, rx)
    }

    /// Ensure a placeholder record exists for `id` (an intermediate hop that
    /// received a flow id it doesn't own yet). A no-op if already registered.
    pub fn ensure_placeholder(&self, id: FlowId) {
        let mut flows = self.flows.lock().unwrap();
        flows.entry(id).or_insert_with(|| {
            Arc::new(FlowRecord {
                cleanup_on_next_send: AtomicBool::new(false),
                completion: Mutex::new(Completion::Forwarding),
                args: Mutex::new(serde_json::Value::Null),
            })
        });
    }

    /// Store opaque per-flow state (e.g. the requesting client's identity).
    pub fn set_args(&self, id: &FlowId, args: serde_json::Value) {
        if let Some(record) = self.flows.lock().unwrap().get(id) {
            *record.args.lock().unwrap() = args;
        }
    }

    pub fn get_args(&self, id: &FlowId) -> Option<serde_json::Value> {
        self.flows
            .lock()
            .unwrap()
            .get(id)
            .map(|r| r.args.lock().unwrap().clone())
    }

    /// Mark that this flow's record should be dropped right after the next
    /// outgoing message carrying its id is sent (the "final reply hop" rule).
    pub fn mark_cleanup(&self, id: &FlowId) {
        if let Some(record) = self.flows.lock().unwrap().get(id) {
            record.cleanup_on_next_send.store(true, Ordering::Relaxed);
        }
    }

    /// Called by the node runtime right after transmitting a message that
    /// carried `id`; drops the flow if it was marked for cleanup.
    pub fn on_sent(&self, id: &FlowId) {
        let should_drop = self
            .flows
            .lock()
            .unwrap()
            .get(id)
            .is_some_and(|r| r.cleanup_on_next_send.load(Ordering::Relaxed));
        if should_drop {
            self.flows.lock().unwrap().remove(id);
        }
    }

    /// Deliver a reply to the flow's owner. Returns `true` if the flow was
    /// known (the originator or an intermediate placeholder).
    pub fn resolve(&self, id: &FlowId, from: NodeIdentity, body: Option<Body>) -> bool {
        let record = match self.flows.lock().unwrap().get(id) {
            Some(r) => r.clone(),
            None => return false,
        };
        let mut completion = record.completion.lock().unwrap();
        match &*completion {
            Completion::Oneshot(_) => {
                if let Completion::Oneshot(tx) = std::mem::replace(&mut *completion, Completion::Forwarding) {
                    let _ = tx.send(FlowReply { from, body });
                }
            }
            Completion::Channel(tx) => {
                let _ = tx.send(FlowReply { from, body });
            }
            Completion::Forwarding => {}
        }
        true
    }

    /// Explicit removal, used by the originator once it has consumed its
    /// promise's resolution.
    pub fn del(&self, id: &FlowId) {
        self.flows.lock().unwrap().remove(id);
    }

    pub fn contains(&self, id: &FlowId) -> bool {
        self.flows.lock().unwrap().contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FlowRegistry {
        FlowRegistry::new(NodeIdentity::generate(NodeRole::Client))
    }

    #[tokio::test]
    async fn oneshot_flow_delivers_exactly_one_reply() {
        let registry = registry();
        let (id, rx) = registry.new_oneshot();

        let from = NodeIdentity::master();
        let delivered = registry.resolve(&id, from.clone(), Some(Body::Json(serde_json::json!(42))));
        assert!(delivered);

        let reply = rx.await.unwrap();
        assert_eq!(reply.from, from);
    }

    #[test]
    fn resolve_on_unknown_flow_returns_false() {
        let registry = registry();
        let bogus = FlowId::new(&NodeIdentity::generate(NodeRole::Client), 999);
        assert!(!registry.resolve(&bogus, NodeIdentity::master(), None));
    }

    #[test]
    fn placeholder_is_idempotent_and_forwards_silently() {
        let registry = registry();
        let identity = NodeIdentity::generate(NodeRole::Client);
        let id = FlowId::new(&identity, 1);

        registry.ensure_placeholder(id.clone());
        registry.ensure_placeholder(id.clone());
        assert!(registry.contains(&id));

        // A placeholder has no local completion to deliver to, but resolve
        // still reports the flow as known.
        assert!(registry.resolve(&id, NodeIdentity::master(), None));
    }

    #[test]
    fn args_round_trip_for_a_known_flow() {
        let registry = registry();
        let (id, _rx) = registry.new_oneshot();

        assert!(registry.get_args(&id).unwrap().is_null());
        registry.set_args(&id, serde_json::json!("client-42"));
        assert_eq!(registry.get_args(&id).unwrap(), serde_json::json!("client-42"));
    }

    #[test]
    fn cleanup_drops_the_record_only_after_on_sent() {
        let registry = registry();
        let (id, _rx) = registry.new_oneshot();

        registry.mark_cleanup(&id);
        assert!(registry.contains(&id), "cleanup is deferred, not immediate");

        registry.on_sent(&id);
        assert!(!registry.contains(&id));
    }

    #[test]
    fn on_sent_without_cleanup_mark_keeps_the_record() {
        let registry = registry();
        let (id, _rx) = registry.new_oneshot();

        registry.on_sent(&id);
        assert!(registry.contains(&id));
    }

    #[test]
    fn flow_ids_from_one_registry_are_sequential_and_unique() {
        let registry = registry();
        let (a, _) = registry.new_oneshot();
        let (b, _) = registry.new_oneshot();
        assert_ne!(a, b);
    }
}
