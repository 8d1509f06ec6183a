//! C5 Request Registry: correlates outbound requests with inbound responses
//! by AEAD nonce (for `whoareyou`) and by `(peerId, reqId)` (for the typed
//! response(s) the caller is actually awaiting). Both tables are TTL-bounded
//! by `responseTimeout` (spec 4.5).
//!
//! The awaited side forwards every matching message on an unbounded channel
//! rather than resolving once, since a `nodes` reply may arrive as several
//! fragments sharing one `reqId` (spec 4.6, 5): the caller drains the
//! channel until it has everything it asked for or the slot's GC timer
//! closes it out from under it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::node::{Node, NodeId};
use crate::wire::Message;

/// `{ node, message, sentAt }`, indexed by the 12-byte AEAD nonce (spec 3).
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub node: Node,
    pub message: Vec<u8>,
    pub sent_at: Instant,
}

struct AwaitedSlot {
    tx: mpsc::UnboundedSender<Message>,
    registered_at: Instant,
}

pub struct RequestRegistry {
    response_timeout: Duration,
    pending: HashMap<[u8; 12], PendingRequest>,
    awaited: HashMap<(NodeId, Vec<u8>), AwaitedSlot>,
}

impl RequestRegistry {
    pub fn new(response_timeout: Duration) -> Self {
        Self {
            response_timeout,
            pending: HashMap::new(),
            awaited: HashMap::new(),
        }
    }

    /// Registers both tables for a single outbound request; returns the
    /// receiving half the caller drains for typed replies.
    pub fn register(
        &mut self,
        nonce: [u8; 12],
        peer: NodeId,
        req_id: Vec<u8>,
        node: Node,
        message: Vec<u8>,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(
            nonce,
            PendingRequest {
                node,
                message,
                sent_at: Instant::now(),
            },
        );
        self.awaited.insert((peer, req_id), AwaitedSlot { tx, registered_at: Instant::now() });
        rx
    }

    pub fn take_pending_by_nonce(&mut self, nonce: &[u8; 12]) -> Option<PendingRequest> {
        self.pending.remove(nonce)
    }

    /// Re-keys a pending entry under the nonce of a just-sent `HandshakeMessage`
    /// retry, without touching the awaited slot the caller is still holding a
    /// receiver for (spec 4.3: the initiator resends the original plaintext
    /// once the handshake completes, under a fresh nonce).
    pub fn insert_pending(&mut self, nonce: [u8; 12], request: PendingRequest) {
        self.pending.insert(nonce, request);
    }

    pub fn peek_pending_by_nonce(&self, nonce: &[u8; 12]) -> Option<&PendingRequest> {
        self.pending.get(nonce)
    }

    /// Forwards `message` to the awaited slot for `(src, reqId)` iff one is
    /// registered. Returns `true` on a match (i.e. the message was
    /// solicited); the caller is responsible for counting "unsolicited"
    /// messages on `false`.
    pub fn resolve(&mut self, src: NodeId, req_id: &[u8], message: Message) -> bool {
        match self.awaited.get(&(src, req_id.to_vec())) {
            Some(slot) => {
                let _ = slot.tx.send(message);
                true
            }
            None => false,
        }
    }

    /// Frees the awaited slot once the caller has everything it needs,
    /// instead of waiting for `responseTimeout` to GC it.
    pub fn complete(&mut self, src: NodeId, req_id: &[u8]) {
        self.awaited.remove(&(src, req_id.to_vec()));
    }

    /// Removes pending/awaited entries older than `responseTimeout`. Dropping
    /// an awaited slot's sender closes the caller's receiver, which reads as
    /// "no more parts are coming" rather than an explicit error.
    pub fn expire(&mut self) {
        let deadline = self.response_timeout;
        let now = Instant::now();
        self.pending.retain(|_, req| now.duration_since(req.sent_at) < deadline);
        self.awaited.retain(|_, slot| now.duration_since(slot.registered_at) < deadline);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn awaited_len(&self) -> usize {
        self.awaited.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Record;
    use secp256k1::SecretKey;

    fn dummy_node() -> Node {
        let signer = SecretKey::new(&mut rand::thread_rng());
        let record = Record::new(1, None, None, None, &signer);
        Node::new(record)
    }

    #[tokio::test]
    async fn resolve_matches_exact_peer_and_req_id() {
        let mut registry = RequestRegistry::new(Duration::from_secs(4));
        let node = dummy_node();
        let peer = node.id;
        let req_id = vec![1, 2, 3];
        let mut rx = registry.register([1; 12], peer, req_id.clone(), node, vec![]);

        let msg = Message::Ping {
            req_id: req_id.clone(),
            enr_seq: 1,
        };
        assert!(registry.resolve(peer, &req_id, msg.clone()));
        assert_eq!(rx.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn resolve_on_mismatched_req_id_is_unsolicited() {
        let mut registry = RequestRegistry::new(Duration::from_secs(4));
        let node = dummy_node();
        let peer = node.id;
        let _rx = registry.register([2; 12], peer, vec![9], node, vec![]);

        let msg = Message::Ping {
            req_id: vec![1],
            enr_seq: 1,
        };
        assert!(!registry.resolve(peer, &[1], msg));
    }

    #[tokio::test]
    async fn expire_closes_stale_slots() {
        let mut registry = RequestRegistry::new(Duration::from_millis(0));
        let node = dummy_node();
        let peer = node.id;
        let mut rx = registry.register([3; 12], peer, vec![7], node, vec![]);
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.expire();
        assert!(rx.recv().await.is_none());
        assert_eq!(registry.pending_len(), 0);
        assert_eq!(registry.awaited_len(), 0);
    }

    #[tokio::test]
    async fn complete_frees_the_slot_immediately() {
        let mut registry = RequestRegistry::new(Duration::from_secs(4));
        let node = dummy_node();
        let peer = node.id;
        registry.register([4; 12], peer, vec![1], node, vec![]);
        assert_eq!(registry.awaited_len(), 1);
        registry.complete(peer, &[1]);
        assert_eq!(registry.awaited_len(), 0);
    }
}
