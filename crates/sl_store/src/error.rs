use thiserror::Error;

use sl_crypto::CryptoError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Stored value failed to decrypt — wrong passphrase, or the store was tampered with")]
    Decryption,

    #[error("Store is passphrase-protected; a passphrase is required to open it")]
    PassphraseRequired,

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("One-time prekey {0} was already consumed")]
    PrekeyConsumed(u32),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<CryptoError> for StoreError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AeadDecrypt => StoreError::Decryption,
            other => StoreError::Crypto(other),
        }
    }
}
