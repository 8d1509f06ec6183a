//! Node identity and the (intentionally minimal) `Record` type.
//!
//! Spec Section 1 treats the ENR format and its signature verification as an
//! external collaborator, "consumed via `record.encode()`, `record.verify()`,
//! `record.seqNum`, `record.addressOf(scheme)`". This module gives that
//! interface a concrete, self-signed, minimal implementation so the rest of
//! the crate has something real to call -- it is deliberately not a full ENR/
//! RLP codec (see the teacher's `types::NodeRecord` for what a production ENR
//! looks like; this mirrors its accessor surface without the RLP machinery).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use ethereum_types::H256;
use secp256k1::{PublicKey, SECP256K1, SecretKey, ecdsa::Signature};
use sha3::{Digest, Keccak256};
use thiserror::Error;

/// 256-bit node identifier, derived deterministically from a peer's public key.
pub type NodeId = H256;

/// Derives a [`NodeId`] from an uncompressed secp256k1 public key, matching
/// the teacher's `utils::node_id` (keccak256 of the 64-byte X||Y encoding).
pub fn node_id_from_pubkey(pubkey: &PublicKey) -> NodeId {
    let uncompressed = pubkey.serialize_uncompressed();
    let mut hasher = Keccak256::new();
    hasher.update(&uncompressed[1..]);
    NodeId::from_slice(&hasher.finalize())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record buffer too short")]
    Truncated,
    #[error("invalid public key in record")]
    InvalidPublicKey,
    #[error("invalid signature in record")]
    InvalidSignature,
}

/// A minimal stand-in for an ENR: a signed, versioned tuple of `(seq, ip,
/// udp_port, tcp_port, pubkey)`. Real deployments plug in a full ENR codec;
/// this crate only needs the accessor surface spec.md names.
#[derive(Clone, PartialEq, Eq)]
pub struct Record {
    seq: u64,
    ip: Option<IpAddr>,
    udp_port: Option<u16>,
    tcp_port: Option<u16>,
    pubkey: PublicKey,
    signature: Signature,
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("seq", &self.seq)
            .field("ip", &self.ip)
            .field("udp_port", &self.udp_port)
            .field("tcp_port", &self.tcp_port)
            .field("pubkey", &self.pubkey)
            .finish()
    }
}

impl Record {
    /// Builds and signs a fresh record for `signer`.
    pub fn new(
        seq: u64,
        ip: Option<IpAddr>,
        udp_port: Option<u16>,
        tcp_port: Option<u16>,
        signer: &SecretKey,
    ) -> Self {
        let pubkey = signer.public_key(SECP256K1);
        let digest = Self::signing_digest(seq, ip, udp_port, tcp_port, &pubkey);
        let signature = SECP256K1.sign_ecdsa(&digest, signer);
        Self {
            seq,
            ip,
            udp_port,
            tcp_port,
            pubkey,
            signature,
        }
    }

    fn signing_digest(
        seq: u64,
        ip: Option<IpAddr>,
        udp_port: Option<u16>,
        tcp_port: Option<u16>,
        pubkey: &PublicKey,
    ) -> secp256k1::Message {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&seq.to_be_bytes());
        match ip {
            Some(IpAddr::V4(v4)) => {
                buf.push(4);
                buf.extend_from_slice(&v4.octets());
            }
            Some(IpAddr::V6(v6)) => {
                buf.push(6);
                buf.extend_from_slice(&v6.octets());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&udp_port.unwrap_or(0).to_be_bytes());
        buf.extend_from_slice(&tcp_port.unwrap_or(0).to_be_bytes());
        buf.extend_from_slice(&pubkey.serialize());
        let hash = Keccak256::digest(&buf);
        // A 32-byte keccak digest is always a valid secp256k1 message.
        secp256k1::Message::from_digest(hash.into())
    }

    /// Re-signs the record after mutating a field, bumping `seq`.
    pub fn with_updates(
        &self,
        seq: u64,
        ip: Option<IpAddr>,
        udp_port: Option<u16>,
        tcp_port: Option<u16>,
        signer: &SecretKey,
    ) -> Self {
        Self::new(seq, ip, udp_port, tcp_port, signer)
    }

    /// `record.encode()` -- the opaque byte-string form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(96);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        match self.ip {
            Some(IpAddr::V4(v4)) => {
                buf.push(4);
                buf.extend_from_slice(&v4.octets());
            }
            Some(IpAddr::V6(v6)) => {
                buf.push(6);
                buf.extend_from_slice(&v6.octets());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&self.udp_port.unwrap_or(0).to_be_bytes());
        buf.extend_from_slice(&self.tcp_port.unwrap_or(0).to_be_bytes());
        buf.extend_from_slice(&self.pubkey.serialize());
        buf.extend_from_slice(&self.signature.serialize_compact());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() < 8 + 1 + 4 + 2 + 33 + 64 {
            return Err(RecordError::Truncated);
        }
        let mut off = 0;
        let seq = u64::from_be_bytes(bytes[off..off + 8].try_into().expect("8 bytes"));
        off += 8;
        let ip_tag = bytes[off];
        off += 1;
        let ip = match ip_tag {
            0 => {
                off += 16;
                None
            }
            4 => {
                let octets: [u8; 4] = bytes[off..off + 4].try_into().expect("4 bytes");
                off += 16;
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            6 => {
                let octets: [u8; 16] = bytes[off..off + 16].try_into().expect("16 bytes");
                off += 16;
                Some(IpAddr::V6(octets.into()))
            }
            _ => return Err(RecordError::Truncated),
        };
        let udp_port = u16::from_be_bytes(bytes[off..off + 2].try_into().expect("2 bytes"));
        off += 2;
        let tcp_port = u16::from_be_bytes(bytes[off..off + 2].try_into().expect("2 bytes"));
        off += 2;
        let pubkey = PublicKey::from_slice(&bytes[off..off + 33])
            .map_err(|_| RecordError::InvalidPublicKey)?;
        off += 33;
        let signature = Signature::from_compact(&bytes[off..off + 64])
            .map_err(|_| RecordError::InvalidSignature)?;

        Ok(Self {
            seq,
            ip,
            udp_port: (udp_port != 0).then_some(udp_port),
            tcp_port: (tcp_port != 0).then_some(tcp_port),
            pubkey,
            signature,
        })
    }

    /// `record.verify()`.
    pub fn verify(&self) -> bool {
        let digest = Self::signing_digest(self.seq, self.ip, self.udp_port, self.tcp_port, &self.pubkey);
        SECP256K1
            .verify_ecdsa(&digest, &self.signature, &self.pubkey)
            .is_ok()
    }

    /// `record.seqNum`.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn udp_port(&self) -> Option<u16> {
        self.udp_port
    }

    pub fn tcp_port(&self) -> Option<u16> {
        self.tcp_port
    }

    pub fn pubkey(&self) -> PublicKey {
        self.pubkey
    }

    /// `record.addressOf(scheme)` for the single supported (IP, UDP) scheme.
    pub fn udp_address(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.ip?, self.udp_port?))
    }

    pub fn node_id(&self) -> NodeId {
        node_id_from_pubkey(&self.pubkey)
    }
}

/// A UDP socket address paired with the node that owns it, as derived from a
/// [`Record`] -- spec 3: "absent if the record omits IP/port fields".
pub type Address = SocketAddr;

/// `Node`: `{ id, record, address, seenAt }`. Compared by `id` only (spec 3).
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub record: Record,
    pub address: Option<Address>,
    pub seen_at: Instant,
}

impl Node {
    pub fn new(record: Record) -> Self {
        Self {
            id: record.node_id(),
            address: record.udp_address(),
            record,
            seen_at: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.seen_at = Instant::now();
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Node {}

/// Log-distance between two 256-bit ids: position of the highest-order
/// differing bit, in `[0, 256]`. `0` only for `a == b`.
pub fn log_distance(a: &NodeId, b: &NodeId) -> usize {
    let xor = xor_distance(a, b);
    256 - leading_zero_bits(&xor)
}

/// XOR distance as a big-endian 32-byte value, used for lookup ordering.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a.as_bytes()[i] ^ b.as_bytes()[i];
    }
    out
}

fn leading_zero_bits(bytes: &[u8; 32]) -> usize {
    let mut count = 0;
    for byte in bytes {
        if *byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros() as usize;
            break;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_record(seq: u64) -> Record {
        let signer = SecretKey::new(&mut rand::thread_rng());
        Record::new(seq, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)), Some(9000), Some(9000), &signer)
    }

    #[test]
    fn record_round_trips_and_verifies() {
        let record = random_record(1);
        let encoded = record.encode();
        let decoded = Record::decode(&encoded).unwrap();
        assert_eq!(record, decoded);
        assert!(decoded.verify());
    }

    #[test]
    fn tampered_record_fails_verification() {
        let record = random_record(1);
        let mut encoded = record.encode();
        // flip a bit in the udp_port field
        encoded[9] ^= 0xff;
        let decoded = Record::decode(&encoded).unwrap();
        assert!(!decoded.verify());
    }

    #[test]
    fn log_distance_is_zero_only_for_identical_ids() {
        let a = NodeId::random();
        assert_eq!(log_distance(&a, &a), 0);
        let b = NodeId::random();
        if a != b {
            assert!(log_distance(&a, &b) >= 1);
        }
    }

    #[test]
    fn log_distance_matches_highest_differing_bit() {
        let a = NodeId::zero();
        let mut b_bytes = [0u8; 32];
        b_bytes[0] = 0b0000_0001; // bit 255 (MSB-first byte 0, low bit)
        let b = NodeId::from(b_bytes);
        assert_eq!(log_distance(&a, &b), 256 - 7);
    }
}
