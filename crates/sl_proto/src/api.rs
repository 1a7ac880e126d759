//! Prekey endpoint request/response bodies.
//!
//! These map directly to the JSON bodies on the wire:
//!
//! - `POST /api/users/prekeys`           — [`PrekeyUploadRequest`]
//! - `GET  /api/users/prekeys/status`    — [`PrekeyStatusResponse`]
//! - `GET  /api/users/{peer}/prekey_bundle` — [`PrekeyBundleResponse`]
//!
//! Key fields are lowercase hex; signatures are base64. The bundle endpoint
//! consumes one one-time prekey server-side per fetch.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use sl_crypto::x3dh::{OneTimeKey, PeerBundle};

#[derive(Debug, Error)]
pub enum ApiDecodeError {
    #[error("bad {field}: {reason}")]
    Field { field: &'static str, reason: String },
}

fn hex32(field: &'static str, s: &str) -> Result<[u8; 32], ApiDecodeError> {
    hex::decode(s)
        .map_err(|e| ApiDecodeError::Field { field, reason: e.to_string() })?
        .try_into()
        .map_err(|_| ApiDecodeError::Field {
            field,
            reason: "expected 32 bytes".into(),
        })
}

// ── Upload ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyUploadRequest {
    /// X25519 identity public key (hex).
    pub identity_key: String,
    /// Ed25519 verifying key (hex).
    pub signing_key: String,
    /// Present only when a not-yet-uploaded signed prekey is staged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_prekey: Option<UploadedSignedPrekey>,
    pub one_time_prekeys: Vec<UploadedOneTimePrekey>,
}

impl PrekeyUploadRequest {
    pub fn is_empty(&self) -> bool {
        self.signed_prekey.is_none() && self.one_time_prekeys.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedSignedPrekey {
    pub key_id: u32,
    /// X25519 public key (hex).
    pub public: String,
    /// Ed25519 signature over the raw public key bytes (base64).
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedOneTimePrekey {
    pub key_id: u32,
    /// X25519 public key (hex).
    pub public: String,
}

// ── Status ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyStatusResponse {
    pub one_time_prekey_count: u32,
    pub signed_prekey_key_id: Option<u32>,
    pub signed_prekey_created_at: Option<DateTime<Utc>>,
}

// ── Bundle fetch ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundleResponse {
    /// X25519 identity public key (hex).
    pub identity_key: String,
    /// Ed25519 verifying key (hex).
    pub signing_key: String,
    pub signed_prekey: BundleSignedPrekey,
    pub one_time_prekey: Option<BundleOneTimePrekey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleSignedPrekey {
    pub key_id: u32,
    pub public: String,
    /// Base64 Ed25519 signature.
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleOneTimePrekey {
    pub key_id: u32,
    pub public: String,
}

impl TryFrom<&PrekeyBundleResponse> for PeerBundle {
    type Error = ApiDecodeError;

    fn try_from(resp: &PrekeyBundleResponse) -> Result<Self, Self::Error> {
        let signature = URL_SAFE_NO_PAD
            .decode(&resp.signed_prekey.signature)
            .map_err(|e| ApiDecodeError::Field {
                field: "signed_prekey.signature",
                reason: e.to_string(),
            })?;

        let one_time_prekey = match &resp.one_time_prekey {
            None => None,
            Some(opk) => Some(OneTimeKey {
                key_id: opk.key_id,
                public: hex32("one_time_prekey.public", &opk.public)?,
            }),
        };

        Ok(PeerBundle {
            identity_key: hex32("identity_key", &resp.identity_key)?,
            signing_key: hex32("signing_key", &resp.signing_key)?,
            signed_prekey_id: resp.signed_prekey.key_id,
            signed_prekey: hex32("signed_prekey.public", &resp.signed_prekey.public)?,
            signed_prekey_signature: signature,
            one_time_prekey,
        })
    }
}
