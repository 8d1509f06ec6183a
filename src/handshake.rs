//! C3 Handshake Engine: the challenge/response state machine layered on top
//! of the key-derivation primitives in `session.rs` (spec 4.3).
//!
//! This module owns exactly the "at most one pending handshake per
//! `(peerId, address)`" invariant and its GC timer. The actual
//! request-by-nonce lookup on `whoareyou` arrival lives in
//! `requests::RequestRegistry`, since that's also where the matching
//! `PendingRequest` (node + original plaintext) is kept.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use secp256k1::{PublicKey, SECP256K1, SecretKey, ecdsa::Signature};

use crate::error::CryptoError;
use crate::node::{Address, NodeId};
use crate::session::{self, Session};

pub type HandshakeKey = (NodeId, Address);

/// Tracks that a handshake is in flight for a key. `challenge_data` is
/// populated on the recipient side (the node that sent `whoareyou` and is
/// waiting for the matching `HandshakeMessage`); the initiator side doesn't
/// need it here since it derives everything synchronously on `whoareyou`
/// arrival and never re-enters this state afterwards.
struct InFlight {
    started_at: Instant,
    challenge_data: Option<Vec<u8>>,
}

pub struct HandshakeEngine {
    timeout: Duration,
    in_flight: HashMap<HandshakeKey, InFlight>,
}

impl HandshakeEngine {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            in_flight: HashMap::new(),
        }
    }

    /// Registers a new in-flight handshake for `key`. Per the spec's open
    /// question (9), a second `whoareyou` for an in-flight key is dropped
    /// rather than restarting the handshake -- we surface that here as a
    /// `false` return rather than silently overwriting.
    pub fn begin(&mut self, key: HandshakeKey) -> bool {
        self.expire();
        if self.in_flight.contains_key(&key) {
            return false;
        }
        self.in_flight.insert(
            key,
            InFlight {
                started_at: Instant::now(),
                challenge_data: None,
            },
        );
        true
    }

    /// As `begin`, but also records the `challenge-data` the recipient will
    /// need to verify the eventual `HandshakeMessage`'s id-signature.
    pub fn begin_as_recipient(&mut self, key: HandshakeKey, challenge_data: Vec<u8>) -> bool {
        self.expire();
        if self.in_flight.contains_key(&key) {
            return false;
        }
        self.in_flight.insert(
            key,
            InFlight {
                started_at: Instant::now(),
                challenge_data: Some(challenge_data),
            },
        );
        true
    }

    pub fn is_in_flight(&self, key: &HandshakeKey) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn challenge_data(&self, key: &HandshakeKey) -> Option<&[u8]> {
        self.in_flight.get(key).and_then(|e| e.challenge_data.as_deref())
    }

    pub fn complete(&mut self, key: &HandshakeKey) {
        self.in_flight.remove(key);
    }

    /// GC: drop entries older than `handshakeTimeout`.
    pub fn expire(&mut self) {
        let timeout = self.timeout;
        let now = Instant::now();
        self.in_flight.retain(|_, entry| now.duration_since(entry.started_at) < timeout);
    }
}

/// A freshly generated ephemeral key pair for one handshake attempt (spec
/// 4.3 step 2).
pub struct EphemeralKeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

pub fn generate_ephemeral_keypair() -> EphemeralKeyPair {
    let secret = SecretKey::new(&mut rand::thread_rng());
    let public = secret.public_key(SECP256K1);
    EphemeralKeyPair { secret, public }
}

/// The material the initiator produces after receiving a `whoareyou`: the
/// derived session (to install once the recipient acks, optimistically
/// installed up front per spec 4.3 step 3-5), and the id-signature to attach
/// to the outbound `HandshakeMessage`.
pub struct InitiatorHandshakeOutput {
    pub session: Session,
    pub id_signature: Signature,
}

/// Spec 4.3 steps 2-4, run by the initiator once it has a `whoareyou`'s
/// `idNonce` and the recipient's static pubkey.
#[allow(clippy::too_many_arguments)]
pub fn respond_as_initiator(
    local_static_key: &SecretKey,
    local_node_id: &NodeId,
    remote_pubkey: &PublicKey,
    remote_node_id: &NodeId,
    ephemeral: &EphemeralKeyPair,
    challenge_data: &[u8],
) -> Result<InitiatorHandshakeOutput, CryptoError> {
    let (_, read_key, write_key) = session::derive_session_keys(
        &ephemeral.secret,
        remote_pubkey,
        local_node_id,
        remote_node_id,
        challenge_data,
        true,
    )?;
    let session = Session {
        recipient_id: *remote_node_id,
        read_key,
        write_key,
    };
    let id_signature = session::create_id_signature(
        local_static_key,
        challenge_data,
        &ephemeral.public.serialize(),
        remote_node_id,
    );
    Ok(InitiatorHandshakeOutput { session, id_signature })
}

/// Spec 4.3 recipient side: verify the signature, derive keys with swapped
/// roles, install the session.
pub fn respond_as_recipient(
    local_static_key: &SecretKey,
    local_node_id: &NodeId,
    remote_pubkey: &PublicKey,
    remote_node_id: &NodeId,
    remote_ephemeral_pubkey: &PublicKey,
    challenge_data: &[u8],
    id_signature: &Signature,
) -> Result<Session, CryptoError> {
    let verified = session::verify_id_signature(
        remote_pubkey,
        challenge_data,
        &remote_ephemeral_pubkey.serialize(),
        local_node_id,
        id_signature,
    );
    if !verified {
        return Err(CryptoError::BadIdSignature);
    }
    let (_, read_key, write_key) = session::derive_session_keys(
        local_static_key,
        remote_ephemeral_pubkey,
        remote_node_id,
        local_node_id,
        challenge_data,
        false,
    )?;
    Ok(Session {
        recipient_id: *remote_node_id,
        read_key,
        write_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_for_same_key_while_in_flight_is_dropped() {
        let mut engine = HandshakeEngine::new(Duration::from_secs(2));
        let key: HandshakeKey = (NodeId::random(), "127.0.0.1:1".parse().unwrap());
        assert!(engine.begin(key));
        assert!(!engine.begin(key));
    }

    #[test]
    fn begin_succeeds_again_after_completion() {
        let mut engine = HandshakeEngine::new(Duration::from_secs(2));
        let key: HandshakeKey = (NodeId::random(), "127.0.0.1:1".parse().unwrap());
        assert!(engine.begin(key));
        engine.complete(&key);
        assert!(engine.begin(key));
    }

    #[test]
    fn expired_in_flight_entries_allow_a_fresh_begin() {
        let mut engine = HandshakeEngine::new(Duration::from_millis(0));
        let key: HandshakeKey = (NodeId::random(), "127.0.0.1:1".parse().unwrap());
        assert!(engine.begin(key));
        std::thread::sleep(Duration::from_millis(5));
        assert!(engine.begin(key));
    }

    #[test]
    fn initiator_and_recipient_agree_on_session_and_signature() {
        let local_key = SecretKey::new(&mut rand::thread_rng());
        let remote_key = SecretKey::new(&mut rand::thread_rng());
        let remote_pubkey = remote_key.public_key(SECP256K1);
        let local_pubkey = local_key.public_key(SECP256K1);

        let local_id = NodeId::random();
        let remote_id = NodeId::random();
        let challenge_data = b"challenge".to_vec();
        let ephemeral = generate_ephemeral_keypair();

        let initiator_out = respond_as_initiator(
            &local_key,
            &local_id,
            &remote_pubkey,
            &remote_id,
            &ephemeral,
            &challenge_data,
        )
        .unwrap();

        let recipient_session = respond_as_recipient(
            &remote_key,
            &remote_id,
            &local_pubkey,
            &local_id,
            &ephemeral.public,
            &challenge_data,
            &initiator_out.id_signature,
        )
        .unwrap();

        assert_eq!(initiator_out.session.write_key, recipient_session.read_key);
        assert_eq!(initiator_out.session.read_key, recipient_session.write_key);
    }
}
