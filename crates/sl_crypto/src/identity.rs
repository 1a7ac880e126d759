//! Identity key material
//!
//! Each local user has one 32-byte seed, created once. Two key pairs derive
//! deterministically from it:
//!
//! - an Ed25519 signing pair (signs the signed prekey),
//! - an X25519 agreement pair (the identity key used in X3DH DH mixes).
//!
//! The user-visible fingerprint is the SHA-256 of the X25519 public identity
//! key, hex-encoded in 4-character groups. Resetting the seed invalidates
//! every session built on it.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::{error::CryptoError, kdf};

/// Ed25519 signatures are 64 bytes raw.
pub const SIGNATURE_LEN: usize = 64;

/// Long-term identity. Drop clears all secret halves.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    seed: [u8; 32],
    signing_secret: [u8; 32],
    agreement_secret: [u8; 32],
    #[zeroize(skip)]
    signing_public: [u8; 32],
    #[zeroize(skip)]
    agreement_public: [u8; 32],
}

impl Identity {
    /// Create a fresh identity from OS randomness.
    pub fn generate() -> Result<Self, CryptoError> {
        use rand::RngCore;
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Deterministically derive both key pairs from a stored seed.
    pub fn from_seed(seed: [u8; 32]) -> Result<Self, CryptoError> {
        let mut signing_secret = [0u8; 32];
        kdf::hkdf_expand(&seed, None, b"identity-sign", &mut signing_secret)?;
        let mut agreement_secret = [0u8; 32];
        kdf::hkdf_expand(&seed, None, b"identity-x25519", &mut agreement_secret)?;

        let signing_public = SigningKey::from_bytes(&signing_secret)
            .verifying_key()
            .to_bytes();
        let agreement_public = X25519Public::from(&StaticSecret::from(agreement_secret)).to_bytes();

        Ok(Self {
            seed,
            signing_secret,
            agreement_secret,
            signing_public,
            agreement_public,
        })
    }

    pub fn seed(&self) -> &[u8; 32] {
        &self.seed
    }

    /// Ed25519 verifying key bytes.
    pub fn signing_public(&self) -> &[u8; 32] {
        &self.signing_public
    }

    /// X25519 identity public key bytes.
    pub fn agreement_public(&self) -> &[u8; 32] {
        &self.agreement_public
    }

    /// X25519 identity secret, for DH mixes. The caller must not retain it.
    pub fn agreement_secret(&self) -> StaticSecret {
        StaticSecret::from(self.agreement_secret)
    }

    /// Sign arbitrary bytes; returns the 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_LEN] {
        SigningKey::from_bytes(&self.signing_secret)
            .sign(msg)
            .to_bytes()
    }

    /// Fingerprint of this identity's X25519 public key.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.agreement_public)
    }
}

/// Verify a signature made by an Ed25519 public key over `msg`.
pub fn verify(public: &[u8; 32], msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
    let vk = VerifyingKey::from_bytes(public)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let sig_arr: [u8; SIGNATURE_LEN] = sig
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("signature must be 64 bytes".into()))?;
    vk.verify(msg, &Signature::from_bytes(&sig_arr))
        .map_err(|_| CryptoError::SignatureVerification)
}

/// Human-readable fingerprint: SHA-256 of a public key, hex in groups of 4.
///
/// Example: "a1b2 c3d4 e5f6 ..."
pub fn fingerprint(public_key: &[u8; 32]) -> String {
    let digest = Sha256::digest(public_key);
    let hx = hex::encode(digest);
    hx.chars()
        .collect::<Vec<_>>()
        .chunks(4)
        .map(|c| c.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let seed = [11u8; 32];
        let a = Identity::from_seed(seed).unwrap();
        let b = Identity::from_seed(seed).unwrap();
        assert_eq!(a.signing_public(), b.signing_public());
        assert_eq!(a.agreement_public(), b.agreement_public());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn distinct_seeds_distinct_keys() {
        let a = Identity::generate().unwrap();
        let b = Identity::generate().unwrap();
        assert_ne!(a.agreement_public(), b.agreement_public());
        assert_ne!(a.signing_public(), b.signing_public());
    }

    #[test]
    fn sign_verify_roundtrip() {
        let id = Identity::generate().unwrap();
        let sig = id.sign(b"prekey bytes");
        verify(id.signing_public(), b"prekey bytes", &sig).unwrap();
        assert!(verify(id.signing_public(), b"other bytes", &sig).is_err());

        let other = Identity::generate().unwrap();
        assert!(verify(other.signing_public(), b"prekey bytes", &sig).is_err());
    }

    #[test]
    fn fingerprint_formats_in_groups_of_four() {
        let id = Identity::generate().unwrap();
        let fp = id.fingerprint();
        let groups: Vec<&str> = fp.split(' ').collect();
        assert_eq!(groups.len(), 16, "sha-256 hex is 16 groups of 4");
        assert!(groups.iter().all(|g| g.len() == 4));
        assert!(groups
            .iter()
            .all(|g| g.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())));
    }
}
