//! Store master key: the 32-byte key every secret column is wrapped under.
//!
//! Bootstrap happens at first open: a fresh random key is generated and
//! persisted in the metadata row. With a passphrase the key is stored
//! Argon2id-wrapped (KEK derived from passphrase + salt); without one it is
//! stored raw, which only protects against casual inspection — embedders
//! that can prompt for a passphrase should.

use zeroize::ZeroizeOnDrop;

use sl_crypto::{aead, kdf};

use crate::error::StoreError;

/// In-memory master key. Loaded once per process, zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Wrap this key under a passphrase-derived KEK.
    /// Returns `(wrapped_key, salt)` — both safe to persist.
    pub fn wrap(&self, passphrase: &str) -> Result<(Vec<u8>, [u8; 16]), StoreError> {
        let salt = kdf::generate_salt();
        let kek = kdf::master_kek_from_passphrase(passphrase.as_bytes(), &salt)?;
        let wrapped = aead::seal_at_rest(&kek, &self.0)?;
        Ok((wrapped, salt))
    }

    /// Unwrap a persisted key. A wrong passphrase surfaces as
    /// [`StoreError::Decryption`].
    pub fn unwrap(
        wrapped: &[u8],
        passphrase: &str,
        salt: &[u8; 16],
    ) -> Result<Self, StoreError> {
        let kek = kdf::master_kek_from_passphrase(passphrase.as_bytes(), salt)?;
        let plain = aead::open_at_rest(&kek, wrapped)?;
        let key: [u8; 32] = plain
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Corrupt("wrapped master key has wrong length".into()))?;
        Ok(Self(key))
    }
}
