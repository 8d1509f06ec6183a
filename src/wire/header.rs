//! Masked 16-byte-keyed header shared by all three packet flavors (spec 4.1):
//! "Three packet flavors share a 16-byte masked header whose mask is derived
//! from the recipient's node-id prefix."

use aes::Aes128;
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::node::NodeId;

/// `flag` values tagging which of the three packet flavors follows.
pub const FLAG_ORDINARY: u8 = 0x00;
pub const FLAG_WHOAREYOU: u8 = 0x01;
pub const FLAG_HANDSHAKE: u8 = 0x02;

pub const MASKING_IV_LEN: usize = 16;
/// flag(1) + nonce(12) + authdata_len(2)
pub const FIXED_HEADER_LEN: usize = 1 + 12 + 2;

type MaskCipher = Ctr128BE<Aes128>;

fn mask_key(recipient_id: &NodeId) -> [u8; 16] {
    recipient_id.as_bytes()[..16].try_into().expect("16 bytes")
}

/// Encrypts (or decrypts -- CTR is an involution) `flag || nonce ||
/// authdata_len || authdata` in place, keyed by the recipient's node-id
/// prefix and the per-packet `masking_iv`.
pub fn apply_mask(recipient_id: &NodeId, masking_iv: &[u8; MASKING_IV_LEN], data: &mut [u8]) {
    let key = mask_key(recipient_id);
    let mut cipher = MaskCipher::new((&key).into(), masking_iv.into());
    cipher.apply_keystream(data);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub flag: u8,
    pub nonce: [u8; 12],
    pub authdata: Vec<u8>,
}

impl Header {
    pub fn plaintext_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + self.authdata.len());
        buf.push(self.flag);
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&(self.authdata.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.authdata);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masking_round_trips() {
        let recipient = NodeId::random();
        let iv = [9u8; MASKING_IV_LEN];
        let header = Header {
            flag: FLAG_ORDINARY,
            nonce: [1; 12],
            authdata: vec![5, 6, 7, 8],
        };
        let mut data = header.plaintext_bytes();
        apply_mask(&recipient, &iv, &mut data);
        assert_ne!(data, header.plaintext_bytes());
        apply_mask(&recipient, &iv, &mut data);
        assert_eq!(data, header.plaintext_bytes());
    }
}
