//! Value-typed records handed out by the key store.
//!
//! The store owns durable state; everything here is a decrypted in-memory
//! view. Secret-bearing records scrub themselves on drop.

use chrono::{DateTime, Utc};
use zeroize::ZeroizeOnDrop;

use sl_crypto::ratchet::RatchetState;

/// Local identity: one per store, created once.
#[derive(ZeroizeOnDrop)]
pub struct IdentityRecord {
    #[zeroize(skip)]
    pub user_id: String,
    pub seed: [u8; 32],
    #[zeroize(skip)]
    pub signing_public: [u8; 32],
    #[zeroize(skip)]
    pub agreement_public: [u8; 32],
    #[zeroize(skip)]
    pub fingerprint: String,
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
}

#[derive(ZeroizeOnDrop)]
pub struct SignedPrekeyRecord {
    #[zeroize(skip)]
    pub key_id: u32,
    #[zeroize(skip)]
    pub public: [u8; 32],
    pub secret: [u8; 32],
    #[zeroize(skip)]
    pub signature: Vec<u8>,
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
    #[zeroize(skip)]
    pub uploaded: bool,
}

#[derive(ZeroizeOnDrop)]
pub struct OneTimePrekeyRecord {
    #[zeroize(skip)]
    pub key_id: u32,
    #[zeroize(skip)]
    pub public: [u8; 32],
    pub secret: [u8; 32],
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
    #[zeroize(skip)]
    pub uploaded: bool,
    #[zeroize(skip)]
    pub consumed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Ready,
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Ready => "ready",
            SessionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SessionStatus::Pending),
            "ready" => Some(SessionStatus::Ready),
            "error" => Some(SessionStatus::Error),
            _ => None,
        }
    }
}

/// One session per peer. Remote fields are `None` while the session is still
/// `pending` (before the bundle fetch completed) and always set once `ready`.
pub struct SessionRecord {
    pub peer_id: String,
    pub session_id: String,
    pub status: SessionStatus,
    pub remote_identity_key: Option<[u8; 32]>,
    pub remote_signing_key: Option<[u8; 32]>,
    pub remote_signed_prekey: Option<[u8; 32]>,
    pub remote_signed_prekey_id: Option<u32>,
    pub remote_fingerprint: Option<String>,
    /// Initiator's handshake ephemeral, kept for the first round-trip.
    pub local_ephemeral_public: Option<[u8; 32]>,
    pub local_ephemeral_secret: Option<[u8; 32]>,
    pub used_one_time_prekey_id: Option<u32>,
    /// True while the opening message (with the handshake prelude) has not
    /// been produced yet.
    pub prelude_pending: bool,
    pub ratchet: Option<RatchetState>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Drop for SessionRecord {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        // RatchetState scrubs itself; the loose ephemeral secret is ours.
        if let Some(mut secret) = self.local_ephemeral_secret.take() {
            secret.zeroize();
        }
    }
}

/// Per-store counters and bookkeeping.
#[derive(Debug, Clone)]
pub struct StoreMetadata {
    /// Next prekey id to hand out; strictly monotonic for the store's life.
    pub next_prekey_id: u32,
    pub last_signed_prekey_id: Option<u32>,
    pub last_upload_at: Option<DateTime<Utc>>,
}

/// Partial metadata update; `None` fields are left untouched.
#[derive(Debug, Default, Clone)]
pub struct MetadataPatch {
    pub last_signed_prekey_id: Option<u32>,
    pub last_upload_at: Option<DateTime<Utc>>,
}
