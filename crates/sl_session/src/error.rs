use thiserror::Error;

use sl_crypto::CryptoError;
use sl_proto::EnvelopeError;
use sl_store::StoreError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Storage: {0}")]
    Store(StoreError),

    #[error("Crypto: {0}")]
    Crypto(CryptoError),

    #[error("Peer bundle failed signature verification")]
    BundleUnverified,

    #[error("Peer bundle is malformed: {0}")]
    MalformedBundle(String),

    #[error("One-time prekey {0} was already consumed")]
    OpkAlreadyConsumed(u32),

    #[error("Decrypt would skip more messages than the session allows")]
    TooManySkipped,

    #[error("No session with {0} and the message carries no handshake prelude")]
    SessionNotFound(String),

    #[error("Transport: {0}")]
    Transport(String),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(#[from] EnvelopeError),

    #[error("Identity key for {peer} changed (stored {stored}, presented {presented}) — re-verify out of band")]
    IdentityMismatch {
        peer: String,
        stored: String,
        presented: String,
    },

    #[error("Message could not be decrypted")]
    DecryptionFailed,
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Decryption => SessionError::DecryptionFailed,
            other => SessionError::Store(other),
        }
    }
}

impl From<CryptoError> for SessionError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::TooManySkipped { .. } => SessionError::TooManySkipped,
            CryptoError::AeadDecrypt => SessionError::DecryptionFailed,
            other => SessionError::Crypto(other),
        }
    }
}
