use std::net::SocketAddr;

use thiserror::Error;

use crate::node::NodeId;
use crate::wire::codec::DecodeError;

/// Top-level error returned by the public `Protocol` surface (C6).
///
/// Mirrors the teacher's per-module error taxonomy (`DiscoveryServerError`
/// composing `PeerTableError`/`RLPDecodeError`/io errors via `#[from]`)
/// rather than a single flat enum.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("request to {0:?} timed out")]
    Timeout(NodeId),

    #[error("response from {peer:?} did not match the awaited request kind")]
    Mismatch { peer: NodeId },

    #[error("no route to {0:?}")]
    UnknownNode(NodeId),

    #[error("talk protocol {0:?} already registered")]
    AlreadyRegistered(Vec<u8>),

    #[error("local socket bind failed: {0}")]
    Bind(SocketAddr),
}

/// Errors from the handshake/session layer (C3).
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD seal/open failed")]
    AeadFailure,
    #[error("invalid public key bytes")]
    InvalidPublicKey,
    #[error("invalid signature bytes")]
    InvalidSignature,
    #[error("id-signature verification failed")]
    BadIdSignature,
    #[error("HKDF expand failed")]
    KeyDerivation,
}
