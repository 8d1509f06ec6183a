//! C2 Session Store and the key-derivation half of C3 (the parts that don't
//! need the packet state machine). Grounded in the teacher's
//! `discv5/session.rs`, which already implements `derive_session_keys`,
//! `create_id_signature` and `verify_id_signature` against real test vectors.

use indexmap::IndexMap;
use secp256k1::{
    Message as SecpMessage, PublicKey, SECP256K1, SecretKey, ecdh::shared_secret_point,
    ecdsa::Signature,
};
use sha2::{Digest, Sha256};

use crate::crypto;
use crate::node::{Address, NodeId};

/// Default capacity of the session store (spec 4.2).
pub const SESSION_STORE_CAPACITY: usize = 256;

const KEY_AGREEMENT_INFO: &[u8] = b"discovery v5 key agreement";
const ID_SIGNATURE_TEXT: &[u8] = b"discovery-id-nonce";

/// `Session`: `{ recipientId, readKey, writeKey }` (spec 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub recipient_id: NodeId,
    pub read_key: [u8; 16],
    pub write_key: [u8; 16],
}

/// Bounded LRU `(peerId, address) -> Session`, capacity 256, no TTL (spec 4.2).
#[derive(Debug)]
pub struct SessionStore {
    capacity: usize,
    entries: IndexMap<(NodeId, Address), Session>,
}

impl SessionStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: IndexMap::new(),
        }
    }

    /// A handshake always overwrites any existing session for its key.
    pub fn put(&mut self, peer_id: NodeId, addr: Address, session: Session) {
        let key = (peer_id, addr);
        self.entries.shift_remove(&key);
        if self.entries.len() >= self.capacity {
            // Evict the least-recently-used entry (front of the map).
            self.entries.shift_remove_index(0);
        }
        self.entries.insert(key, session);
    }

    pub fn get(&mut self, peer_id: NodeId, addr: Address) -> Option<&Session> {
        let key = (peer_id, addr);
        // Move-to-end on access so eviction is true LRU, not insertion order.
        if let Some(session) = self.entries.shift_remove(&key) {
            self.entries.insert(key, session);
        }
        self.entries.get(&key)
    }

    pub fn has(&self, peer_id: NodeId, addr: Address) -> bool {
        self.entries.contains_key(&(peer_id, addr))
    }

    pub fn remove(&mut self, peer_id: NodeId, addr: Address) -> Option<Session> {
        self.entries.shift_remove(&(peer_id, addr))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// challenge-data = masking-iv || static-header || authdata (spec 4.3 step 3).
pub fn build_challenge_data(masking_iv: &[u8], static_header: &[u8], authdata: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(masking_iv.len() + static_header.len() + authdata.len());
    data.extend_from_slice(masking_iv);
    data.extend_from_slice(static_header);
    data.extend_from_slice(authdata);
    data
}

/// Derives `(initKey, recipKey)` via HKDF and returns them arranged as
/// `(writeKey, readKey)` from the caller's point of view, per spec 4.3 step 3:
/// "The initiator's write key is initKey, read key is recipKey."
pub fn derive_session_keys(
    secret_key: &SecretKey,
    public_key: &PublicKey,
    node_id_a: &NodeId,
    node_id_b: &NodeId,
    challenge_data: &[u8],
    is_initiator: bool,
) -> Result<(NodeId, [u8; 16], [u8; 16]), crate::error::CryptoError> {
    let shared_secret = compressed_shared_secret(public_key, secret_key);

    let mut info = KEY_AGREEMENT_INFO.to_vec();
    info.extend_from_slice(node_id_a.as_bytes());
    info.extend_from_slice(node_id_b.as_bytes());

    let key_data = crypto::hkdf_expand(&shared_secret, challenge_data, &info, 32)?;

    let mut initiator_key = [0u8; 16];
    let mut recipient_key = [0u8; 16];
    initiator_key.copy_from_slice(&key_data[..16]);
    recipient_key.copy_from_slice(&key_data[16..]);

    let (write_key, read_key) = if is_initiator {
        (initiator_key, recipient_key)
    } else {
        (recipient_key, initiator_key)
    };

    let recipient_id = if is_initiator { *node_id_b } else { *node_id_a };
    Ok((recipient_id, read_key, write_key))
}

/// Signs `"discovery-id-nonce" || idNonce || ephemeralPubKey || dstId"` with
/// the static key (spec 4.3 step 4).
pub fn create_id_signature(
    static_key: &SecretKey,
    challenge_data: &[u8],
    ephemeral_pubkey: &[u8],
    dst_id: &NodeId,
) -> Signature {
    let digest = id_signature_digest(challenge_data, ephemeral_pubkey, dst_id);
    SECP256K1.sign_ecdsa(&digest, static_key)
}

pub fn verify_id_signature(
    src_pubkey: &PublicKey,
    challenge_data: &[u8],
    ephemeral_pubkey: &[u8],
    dst_id: &NodeId,
    signature: &Signature,
) -> bool {
    let digest = id_signature_digest(challenge_data, ephemeral_pubkey, dst_id);
    SECP256K1.verify_ecdsa(&digest, signature, src_pubkey).is_ok()
}

fn id_signature_digest(challenge_data: &[u8], ephemeral_pubkey: &[u8], dst_id: &NodeId) -> SecpMessage {
    let mut input = ID_SIGNATURE_TEXT.to_vec();
    input.extend_from_slice(challenge_data);
    input.extend_from_slice(ephemeral_pubkey);
    input.extend_from_slice(dst_id.as_bytes());
    let digest: [u8; 32] = Sha256::digest(&input).into();
    SecpMessage::from_digest(digest)
}

fn compressed_shared_secret(dest_pubkey: &PublicKey, local_key: &SecretKey) -> [u8; 33] {
    let xy_point = shared_secret_point(dest_pubkey, local_key);
    let mut compressed = [0u8; 33];
    let y = &xy_point[32..];
    compressed[0] = if y[31] & 1 == 0 { 0x02 } else { 0x03 };
    compressed[1..].copy_from_slice(&xy_point[..32]);
    compressed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_store_evicts_lru_entry_over_capacity() {
        let mut store = SessionStore::new(2);
        let addr: Address = "127.0.0.1:1".parse().unwrap();
        let a = NodeId::from_low_u64_be(1);
        let b = NodeId::from_low_u64_be(2);
        let c = NodeId::from_low_u64_be(3);
        let session = |id: NodeId| Session {
            recipient_id: id,
            read_key: [0; 16],
            write_key: [0; 16],
        };

        store.put(a, addr, session(a));
        store.put(b, addr, session(b));
        assert_eq!(store.len(), 2);

        store.put(c, addr, session(c));
        assert_eq!(store.len(), 2);
        assert!(!store.has(a, addr));
        assert!(store.has(b, addr));
        assert!(store.has(c, addr));
    }

    #[test]
    fn handshake_always_overwrites_existing_session() {
        let mut store = SessionStore::new(8);
        let addr: Address = "127.0.0.1:1".parse().unwrap();
        let a = NodeId::from_low_u64_be(1);
        store.put(
            a,
            addr,
            Session {
                recipient_id: a,
                read_key: [1; 16],
                write_key: [1; 16],
            },
        );
        store.put(
            a,
            addr,
            Session {
                recipient_id: a,
                read_key: [2; 16],
                write_key: [2; 16],
            },
        );
        assert_eq!(store.get(a, addr).unwrap().read_key, [2; 16]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn initiator_and_recipient_derive_mutually_inverse_keys() {
        let a_eph = SecretKey::new(&mut rand::thread_rng());
        let b_static = SecretKey::new(&mut rand::thread_rng());
        let b_pub = b_static.public_key(SECP256K1);
        let a_pub = a_eph.public_key(SECP256K1);

        let node_id_a = NodeId::random();
        let node_id_b = NodeId::random();
        let challenge_data = b"challenge".to_vec();

        let (_, a_read, a_write) =
            derive_session_keys(&a_eph, &b_pub, &node_id_a, &node_id_b, &challenge_data, true).unwrap();
        let (_, b_read, b_write) =
            derive_session_keys(&b_static, &a_pub, &node_id_a, &node_id_b, &challenge_data, false).unwrap();

        assert_eq!(a_write, b_read);
        assert_eq!(a_read, b_write);
    }
}
