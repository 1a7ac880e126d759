//! Key derivation functions
//!
//! `kdf_rk` / `kdf_ck` — the two Double Ratchet derivations: the root
//!   derivation mixes a DH output into the root key via HKDF-SHA256, the
//!   chain derivation steps a chain key with HMAC-SHA256.
//!
//! `message_seal_material` — expands a one-shot message key into the AEAD
//!   key and nonce used to seal a single message.
//!
//! `master_kek_from_passphrase` — Argon2id, derives the 32-byte key that
//!   wraps the local store's master key.

use argon2::{Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

// ── HKDF-SHA256 ───────────────────────────────────────────────────────────────

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be `None` (HKDF will use a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

// ── Double Ratchet derivations ────────────────────────────────────────────────

/// Root key derivation: mix a DH output into the root key.
/// Returns `(new_root_key, new_chain_key)` — a single 64-byte expansion, split.
pub fn kdf_rk(rk: &[u8; 32], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut okm = [0u8; 64];
    hkdf_expand(dh_output, Some(rk), b"DR-root", &mut okm)?;
    let mut new_rk = [0u8; 32];
    let mut ck = [0u8; 32];
    new_rk.copy_from_slice(&okm[..32]);
    ck.copy_from_slice(&okm[32..]);
    Ok((new_rk, ck))
}

/// Chain key step: `ck → (next_chain_key, message_key)`.
///
/// The chain advances under constant 0x02, the message key derives under
/// constant 0x01. Both sides must agree on these constants or every message
/// key diverges.
pub fn kdf_ck(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut mac_ck = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_ck.update(&[0x02]);
    let next_ck: [u8; 32] = mac_ck.finalize().into_bytes().into();

    let mut mac_mk = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_mk.update(&[0x01]);
    let mk: [u8; 32] = mac_mk.finalize().into_bytes().into();

    Ok((next_ck, mk))
}

/// Expand a one-shot message key into AEAD material.
/// Returns `(aead_key, nonce)` — both deterministic, so the receiver derives
/// the identical pair from the same message key.
pub fn message_seal_material(mk: &[u8; 32]) -> Result<([u8; 32], [u8; 24]), CryptoError> {
    let mut key = [0u8; 32];
    hkdf_expand(mk, None, b"DR-key", &mut key)?;
    let mut nonce = [0u8; 24];
    hkdf_expand(mk, None, b"DR-nonce", &mut nonce)?;
    Ok((key, nonce))
}

// ── Master-key KEK (Argon2id) ─────────────────────────────────────────────────

/// Argon2id parameters — tuned for interactive (desktop) use.
fn argon2_params() -> Params {
    Params::new(
        64 * 1024, // m_cost: 64 MiB
        3,         // t_cost: 3 iterations
        1,         // p_cost: 1 thread
        Some(32),  // output len
    )
    .expect("static Argon2 params are always valid")
}

/// Derive the key-encryption key that wraps the store master key.
/// The salt is stored alongside the wrapped key (not secret).
pub fn master_kek_from_passphrase(
    passphrase: &[u8],
    salt: &[u8; 16],
) -> Result<[u8; 32], CryptoError> {
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon2_params());
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(passphrase, salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(output)
}

/// Fresh random 16-byte salt (call once on first run; store next to the
/// wrapped key).
pub fn generate_salt() -> [u8; 16] {
    use rand::RngCore;
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kdf_rk_splits_and_differs() {
        let rk = [7u8; 32];
        let (rk1, ck1) = kdf_rk(&rk, &[1u8; 32]).unwrap();
        let (rk2, ck2) = kdf_rk(&rk, &[2u8; 32]).unwrap();
        assert_ne!(rk1, ck1, "root and chain halves must differ");
        assert_ne!(rk1, rk2, "different DH outputs must diverge");
        assert_ne!(ck1, ck2);
    }

    #[test]
    fn kdf_ck_is_deterministic_and_one_way() {
        let ck = [9u8; 32];
        let (next_a, mk_a) = kdf_ck(&ck).unwrap();
        let (next_b, mk_b) = kdf_ck(&ck).unwrap();
        assert_eq!(next_a, next_b);
        assert_eq!(mk_a, mk_b);
        assert_ne!(next_a, mk_a, "chain key and message key use distinct constants");
        assert_ne!(next_a, ck);
    }

    #[test]
    fn seal_material_is_stable_per_message_key() {
        let mk = [3u8; 32];
        let (k1, n1) = message_seal_material(&mk).unwrap();
        let (k2, n2) = message_seal_material(&mk).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(n1, n2);
        let (k3, _) = message_seal_material(&[4u8; 32]).unwrap();
        assert_ne!(k1, k3);
    }

    #[test]
    fn kek_depends_on_salt_and_passphrase() {
        let salt_a = [1u8; 16];
        let salt_b = [2u8; 16];
        let a = master_kek_from_passphrase(b"hunter2", &salt_a).unwrap();
        let b = master_kek_from_passphrase(b"hunter2", &salt_b).unwrap();
        let c = master_kek_from_passphrase(b"hunter3", &salt_a).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, master_kek_from_passphrase(b"hunter2", &salt_a).unwrap());
    }
}
