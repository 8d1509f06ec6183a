//! The low-level AEAD and KDF primitives spec.md treats as external
//! collaborators ("consumed as `AEAD.seal/open(key, nonce, ad, pt)` and
//! `HKDF(ikm, salt, info)`"). Thin wrappers over real crates, grounded in the
//! teacher's `experimental-discv5` Cargo feature which already pulls in
//! `aes-gcm`/`hkdf` for exactly this purpose.

use aes_gcm::{
    Aes128Gcm, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptoError;

/// `AEAD.seal(key, nonce, ad, pt)`.
pub fn seal(key: &[u8; 16], nonce: &[u8; 12], ad: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .expect("AES-128-GCM sealing with a well-formed key/nonce never fails")
}

/// `AEAD.open(key, nonce, ad, ct)`.
pub fn open(key: &[u8; 16], nonce: &[u8; 12], ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: ad,
            },
        )
        .map_err(|_| CryptoError::AeadFailure)
}

/// `HKDF(ikm, salt, info)` expanded to `len` bytes.
pub fn hkdf_expand(ikm: &[u8], salt: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; len];
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_round_trips() {
        let key = [7u8; 16];
        let nonce = [1u8; 12];
        let ad = b"header";
        let pt = b"hello discovery";
        let ct = seal(&key, &nonce, ad, pt);
        let opened = open(&key, &nonce, ad, &ct).unwrap();
        assert_eq!(opened, pt);
    }

    #[test]
    fn open_fails_on_wrong_key() {
        let key = [7u8; 16];
        let wrong_key = [8u8; 16];
        let nonce = [1u8; 12];
        let ct = seal(&key, &nonce, b"ad", b"secret");
        assert!(open(&wrong_key, &nonce, b"ad", &ct).is_err());
    }

    #[test]
    fn open_fails_on_tampered_ad() {
        let key = [7u8; 16];
        let nonce = [1u8; 12];
        let ct = seal(&key, &nonce, b"ad", b"secret");
        assert!(open(&key, &nonce, b"tampered", &ct).is_err());
    }
}
