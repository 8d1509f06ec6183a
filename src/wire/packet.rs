//! The three packet flavors of spec 4.1: Ordinary, WhoAreYou, HandshakeMessage.
//! Each is `masking_iv || masked(static_header) || authdata-specific tail`,
//! with an AEAD-encrypted message body tacked on for the two that carry one.

use bytes::{Buf, BufMut};

use crate::node::{NodeId, Record};
use crate::wire::codec::DecodeError;
use crate::wire::header::{
    FLAG_HANDSHAKE, FLAG_ORDINARY, FLAG_WHOAREYOU, Header, MASKING_IV_LEN, apply_mask,
};

pub const ID_NONCE_LEN: usize = 16;

/// authdata of an Ordinary packet: just the sender's node id (spec 4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrdinaryAuthdata {
    pub source: NodeId,
}

impl OrdinaryAuthdata {
    pub(crate) fn encode(&self) -> Vec<u8> {
        self.source.as_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != 32 {
            return Err(DecodeError::Truncated);
        }
        Ok(Self {
            source: NodeId::from_slice(bytes),
        })
    }
}

/// authdata of a WHOAREYOU packet: the id-nonce and the sender's view of the
/// recipient's current ENR sequence number (spec 4.3 step 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoAreYouAuthdata {
    pub id_nonce: [u8; ID_NONCE_LEN],
    pub enr_seq: u64,
}

impl WhoAreYouAuthdata {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ID_NONCE_LEN + 8);
        buf.extend_from_slice(&self.id_nonce);
        buf.extend_from_slice(&self.enr_seq.to_be_bytes());
        buf
    }

    fn decode(mut bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != ID_NONCE_LEN + 8 {
            return Err(DecodeError::Truncated);
        }
        let mut id_nonce = [0u8; ID_NONCE_LEN];
        id_nonce.copy_from_slice(&bytes[..ID_NONCE_LEN]);
        bytes.advance(ID_NONCE_LEN);
        let enr_seq = bytes.get_u64();
        Ok(Self { id_nonce, enr_seq })
    }
}

/// authdata of a handshake packet: source id, the id-signature, the ephemeral
/// public key and an optional updated record (spec 4.3 step 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeAuthdata {
    pub source: NodeId,
    pub id_signature: Vec<u8>,
    pub ephemeral_pubkey: Vec<u8>,
    pub record: Option<Record>,
}

impl HandshakeAuthdata {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.source.as_bytes());
        buf.put_u8(self.id_signature.len() as u8);
        buf.extend_from_slice(&self.id_signature);
        buf.put_u8(self.ephemeral_pubkey.len() as u8);
        buf.extend_from_slice(&self.ephemeral_pubkey);
        match &self.record {
            Some(record) => {
                let encoded = record.encode();
                buf.put_u16(encoded.len() as u16);
                buf.extend_from_slice(&encoded);
            }
            None => buf.put_u16(0),
        }
        buf
    }

    fn decode(mut bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.remaining() < 32 {
            return Err(DecodeError::Truncated);
        }
        let source = NodeId::from_slice(&bytes[..32]);
        bytes.advance(32);

        if bytes.remaining() < 1 {
            return Err(DecodeError::Truncated);
        }
        let sig_len = bytes.get_u8() as usize;
        if bytes.remaining() < sig_len {
            return Err(DecodeError::Truncated);
        }
        let id_signature = bytes[..sig_len].to_vec();
        bytes.advance(sig_len);

        if bytes.remaining() < 1 {
            return Err(DecodeError::Truncated);
        }
        let pubkey_len = bytes.get_u8() as usize;
        if bytes.remaining() < pubkey_len {
            return Err(DecodeError::Truncated);
        }
        let ephemeral_pubkey = bytes[..pubkey_len].to_vec();
        bytes.advance(pubkey_len);

        if bytes.remaining() < 2 {
            return Err(DecodeError::Truncated);
        }
        let record_len = bytes.get_u16() as usize;
        if bytes.remaining() < record_len {
            return Err(DecodeError::Truncated);
        }
        let record = if record_len == 0 {
            None
        } else {
            let raw = &bytes[..record_len];
            Some(Record::decode(raw).map_err(|_| DecodeError::MalformedRecord)?)
        };

        Ok(Self {
            source,
            id_signature,
            ephemeral_pubkey,
            record,
        })
    }
}

/// A fully-formed packet ready to mask and put on the wire, or just parsed off
/// of it. The AEAD-encrypted message bytes (when present) are opaque here;
/// `codec.rs` owns sealing/opening them against a session's keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ordinary {
        nonce: [u8; 12],
        authdata: OrdinaryAuthdata,
        ciphertext: Vec<u8>,
    },
    WhoAreYou {
        nonce: [u8; 12],
        authdata: WhoAreYouAuthdata,
    },
    Handshake {
        nonce: [u8; 12],
        authdata: HandshakeAuthdata,
        ciphertext: Vec<u8>,
    },
}

impl Packet {
    pub fn nonce(&self) -> [u8; 12] {
        match self {
            Packet::Ordinary { nonce, .. }
            | Packet::WhoAreYou { nonce, .. }
            | Packet::Handshake { nonce, .. } => *nonce,
        }
    }

    /// Serializes `masking_iv || masked(header) || tail`, masking keyed by
    /// `recipient_id` with a fresh random `masking_iv`.
    pub fn encode(&self, recipient_id: &NodeId, masking_iv: [u8; MASKING_IV_LEN]) -> Vec<u8> {
        let (flag, authdata, ciphertext): (u8, Vec<u8>, &[u8]) = match self {
            Packet::Ordinary {
                authdata,
                ciphertext,
                ..
            } => (FLAG_ORDINARY, authdata.encode(), ciphertext),
            Packet::WhoAreYou { authdata, .. } => (FLAG_WHOAREYOU, authdata.encode(), &[]),
            Packet::Handshake {
                authdata,
                ciphertext,
                ..
            } => (FLAG_HANDSHAKE, authdata.encode(), ciphertext),
        };

        let header = Header {
            flag,
            nonce: self.nonce(),
            authdata,
        };
        let mut masked = header.plaintext_bytes();
        apply_mask(recipient_id, &masking_iv, &mut masked);

        let mut out = Vec::with_capacity(MASKING_IV_LEN + masked.len() + ciphertext.len());
        out.extend_from_slice(&masking_iv);
        out.extend_from_slice(&masked);
        out.extend_from_slice(ciphertext);
        out
    }

    /// Unmasks and parses a datagram addressed to `local_id`. The returned
    /// packet's ciphertext (if any) is still AEAD-sealed.
    pub fn decode(local_id: &NodeId, datagram: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_with_iv(local_id, datagram).map(|(packet, _iv)| packet)
    }

    /// As [`Packet::decode`], but also returns the datagram's `masking_iv` --
    /// the handshake engine needs it to reconstruct `challenge-data` on a
    /// `whoareyou` (spec 4.3 step 3).
    pub fn decode_with_iv(local_id: &NodeId, datagram: &[u8]) -> Result<(Self, [u8; MASKING_IV_LEN]), DecodeError> {
        if datagram.len() < MASKING_IV_LEN {
            return Err(DecodeError::Truncated);
        }
        let mut masking_iv = [0u8; MASKING_IV_LEN];
        masking_iv.copy_from_slice(&datagram[..MASKING_IV_LEN]);
        let rest = &datagram[MASKING_IV_LEN..];

        if rest.len() < crate::wire::header::FIXED_HEADER_LEN {
            return Err(DecodeError::Truncated);
        }
        let mut fixed = rest[..crate::wire::header::FIXED_HEADER_LEN].to_vec();
        apply_mask(local_id, &masking_iv, &mut fixed);

        let flag = fixed[0];
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&fixed[1..13]);
        let authdata_len = u16::from_be_bytes([fixed[13], fixed[14]]) as usize;

        let after_fixed = &rest[crate::wire::header::FIXED_HEADER_LEN..];
        if after_fixed.len() < authdata_len {
            return Err(DecodeError::Truncated);
        }
        let mut authdata = after_fixed[..authdata_len].to_vec();
        apply_mask_offset(local_id, &masking_iv, crate::wire::header::FIXED_HEADER_LEN, &mut authdata);
        let ciphertext = after_fixed[authdata_len..].to_vec();

        let packet = match flag {
            FLAG_ORDINARY => Packet::Ordinary {
                nonce,
                authdata: OrdinaryAuthdata::decode(&authdata)?,
                ciphertext,
            },
            FLAG_WHOAREYOU => Packet::WhoAreYou {
                nonce,
                authdata: WhoAreYouAuthdata::decode(&authdata)?,
            },
            FLAG_HANDSHAKE => Packet::Handshake {
                nonce,
                authdata: HandshakeAuthdata::decode(&authdata)?,
                ciphertext,
            },
            other => return Err(DecodeError::UnknownPacketFlag(other)),
        };
        Ok((packet, masking_iv))
    }

    /// `challenge-data = masking-iv || static-header || authdata` (spec 4.3
    /// step 3), computable only for a `WhoAreYou` packet.
    pub fn whoareyou_challenge_data(&self, masking_iv: &[u8; MASKING_IV_LEN]) -> Option<Vec<u8>> {
        let (nonce, authdata) = match self {
            Packet::WhoAreYou { nonce, authdata } => (*nonce, authdata.encode()),
            _ => return None,
        };
        let header = Header {
            flag: FLAG_WHOAREYOU,
            nonce,
            authdata,
        };
        let plaintext = header.plaintext_bytes();
        let static_header = &plaintext[..crate::wire::header::FIXED_HEADER_LEN];
        let authdata = &plaintext[crate::wire::header::FIXED_HEADER_LEN..];
        Some(crate::session::build_challenge_data(masking_iv, static_header, authdata))
    }
}

/// The masked `flag || nonce || authdata_len || authdata` header, used as
/// AEAD additional data when sealing/opening an Ordinary or Handshake
/// packet's ciphertext (spec 4.1: "authenticated data = masked header").
/// Computable before the ciphertext exists since `authdata`'s length never
/// depends on it.
pub(crate) fn masked_header_bytes(
    flag: u8,
    nonce: [u8; 12],
    authdata: Vec<u8>,
    recipient_id: &NodeId,
    masking_iv: &[u8; MASKING_IV_LEN],
) -> Vec<u8> {
    let header = Header { flag, nonce, authdata };
    let mut masked = header.plaintext_bytes();
    apply_mask(recipient_id, masking_iv, &mut masked);
    masked
}

/// Masking is a keystream XOR; masking a suffix of the plaintext is
/// equivalent to masking the whole buffer and keeping only that suffix, since
/// CTR-mode keystream bytes depend only on their position. Re-deriving just
/// the trailing keystream keeps this allocation-free for the common case.
fn apply_mask_offset(recipient_id: &NodeId, masking_iv: &[u8; MASKING_IV_LEN], offset: usize, data: &mut [u8]) {
    let mut scratch = vec![0u8; offset + data.len()];
    scratch[offset..].copy_from_slice(data);
    apply_mask(recipient_id, masking_iv, &mut scratch);
    data.copy_from_slice(&scratch[offset..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_packet_round_trips() {
        let recipient = NodeId::random();
        let packet = Packet::Ordinary {
            nonce: [3; 12],
            authdata: OrdinaryAuthdata {
                source: NodeId::random(),
            },
            ciphertext: vec![1, 2, 3, 4, 5],
        };
        let encoded = packet.encode(&recipient, [4u8; MASKING_IV_LEN]);
        let decoded = Packet::decode(&recipient, &encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn whoareyou_packet_round_trips() {
        let recipient = NodeId::random();
        let packet = Packet::WhoAreYou {
            nonce: [7; 12],
            authdata: WhoAreYouAuthdata {
                id_nonce: [9; ID_NONCE_LEN],
                enr_seq: 42,
            },
        };
        let encoded = packet.encode(&recipient, [1u8; MASKING_IV_LEN]);
        let decoded = Packet::decode(&recipient, &encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn handshake_packet_round_trips_without_record() {
        let recipient = NodeId::random();
        let packet = Packet::Handshake {
            nonce: [1; 12],
            authdata: HandshakeAuthdata {
                source: NodeId::random(),
                id_signature: vec![0xaa; 64],
                ephemeral_pubkey: vec![0xbb; 33],
                record: None,
            },
            ciphertext: vec![8, 8, 8],
        };
        let encoded = packet.encode(&recipient, [2u8; MASKING_IV_LEN]);
        let decoded = Packet::decode(&recipient, &encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn truncated_datagram_is_rejected() {
        let recipient = NodeId::random();
        assert!(Packet::decode(&recipient, &[0u8; 4]).is_err());
    }
}
