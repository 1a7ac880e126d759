//! Authenticated encryption
//!
//! Two distinct uses, two distinct suites:
//!
//! - **Message sealing** — XChaCha20-Poly1305 with a 24-byte nonce derived
//!   from the message key (`kdf::message_seal_material`). The nonce is NOT
//!   carried on the wire; both sides derive it. The ratchet header bytes are
//!   bound as associated data so a relay cannot splice headers between
//!   ciphertexts.
//!
//! - **At-rest wrapping** — AES-256-GCM under the local store's master key
//!   with a fresh random 96-bit IV per value. Wire form: `iv || ct+tag`.

use aes_gcm::{
    aead::{Aead as _, KeyInit as _, Payload},
    Aes256Gcm,
};
use chacha20poly1305::{aead::Aead as _, KeyInit as _, XChaCha20Poly1305, XNonce};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// AES-GCM IV length (96 bits).
const GCM_IV_LEN: usize = 12;

// ── Message sealing (XChaCha20-Poly1305, derived nonce) ──────────────────────

/// Seal a message payload under a derived key/nonce pair, binding `aad`.
/// Returns ciphertext+tag only; the nonce is re-derived by the receiver.
pub fn seal_message(
    key: &[u8; 32],
    nonce: &[u8; 24],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            chacha20poly1305::aead::Payload { msg: plaintext, aad },
        )
        .map_err(|_| CryptoError::AeadEncrypt)
}

/// Open a sealed message. Any mismatch (key, nonce, aad, tag) fails.
pub fn open_message(
    key: &[u8; 32],
    nonce: &[u8; 24],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce),
            chacha20poly1305::aead::Payload { msg: ciphertext, aad },
        )
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

// ── At-rest wrapping (AES-256-GCM, random IV) ────────────────────────────────

/// Encrypt a stored secret under the master key. Output: `iv || ct+tag`.
pub fn seal_at_rest(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;

    let mut iv = [0u8; GCM_IV_LEN];
    use rand::RngCore;
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(
            aes_gcm::Nonce::from_slice(&iv),
            Payload { msg: plaintext, aad: b"sl-store-v1" },
        )
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(GCM_IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `iv || ct+tag` produced by [`seal_at_rest`].
pub fn open_at_rest(key: &[u8; 32], data: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < GCM_IV_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (iv, ct) = data.split_at(GCM_IV_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(
            aes_gcm::Nonce::from_slice(iv),
            Payload { msg: ct, aad: b"sl-store-v1" },
        )
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roundtrip_binds_aad() {
        let key = [1u8; 32];
        let nonce = [2u8; 24];
        let ct = seal_message(&key, &nonce, b"hello", b"header").unwrap();
        assert_eq!(
            open_message(&key, &nonce, &ct, b"header").unwrap().as_slice(),
            b"hello"
        );
        assert!(open_message(&key, &nonce, &ct, b"other").is_err());
        assert!(open_message(&key, &[3u8; 24], &ct, b"header").is_err());
    }

    #[test]
    fn at_rest_roundtrip_and_fresh_iv() {
        let key = [7u8; 32];
        let a = seal_at_rest(&key, b"secret").unwrap();
        let b = seal_at_rest(&key, b"secret").unwrap();
        assert_ne!(a, b, "IV must be fresh per value");
        assert_eq!(open_at_rest(&key, &a).unwrap().as_slice(), b"secret");
        assert_eq!(open_at_rest(&key, &b).unwrap().as_slice(), b"secret");
    }

    #[test]
    fn at_rest_rejects_wrong_key_and_truncation() {
        let sealed = seal_at_rest(&[7u8; 32], b"secret").unwrap();
        assert!(open_at_rest(&[8u8; 32], &sealed).is_err());
        assert!(open_at_rest(&[7u8; 32], &sealed[..8]).is_err());
    }
}
