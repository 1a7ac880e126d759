//! KeyManager: identity and prekey lifecycle.
//!
//! Owns creation and rotation of everything the server-side bundle is built
//! from. The replenishment loop (`crate::replenish`) drives the policy; this
//! type does the work.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;

use sl_crypto::{identity::Identity, x3dh};
use sl_proto::api::{PrekeyUploadRequest, UploadedOneTimePrekey, UploadedSignedPrekey};
use sl_store::{
    IdentityRecord, KeyStore, MetadataPatch, OneTimePrekeyRecord, SignedPrekeyRecord, StoreError,
};

use crate::{config::CoreConfig, error::SessionError};

pub struct KeyManager {
    store: KeyStore,
    config: CoreConfig,
}

impl KeyManager {
    pub fn new(store: KeyStore, config: CoreConfig) -> Arc<Self> {
        Arc::new(Self { store, config })
    }

    pub fn store(&self) -> &KeyStore {
        &self.store
    }

    /// Load the stored identity, or create one on first use.
    pub async fn initialize(&self, user_id: &str) -> Result<IdentityRecord, SessionError> {
        if let Some(existing) = self.store.load_identity().await? {
            return Ok(existing);
        }

        let identity = Identity::generate()?;
        let record = IdentityRecord {
            user_id: user_id.to_string(),
            seed: *identity.seed(),
            signing_public: *identity.signing_public(),
            agreement_public: *identity.agreement_public(),
            fingerprint: identity.fingerprint(),
            created_at: Utc::now(),
        };
        self.store.save_identity(&record).await?;

        tracing::info!(
            target: "sl_session",
            event = "identity_created",
            user_id = %user_id,
            fingerprint = %record.fingerprint
        );
        Ok(record)
    }

    /// Reconstruct the full identity (both key pairs) from the stored seed.
    pub async fn identity(&self) -> Result<Identity, SessionError> {
        let record = self
            .store
            .load_identity()
            .await?
            .ok_or_else(|| SessionError::Store(StoreError::NotFound("identity".into())))?;
        Ok(Identity::from_seed(record.seed)?)
    }

    /// Generate, sign and persist a new signed prekey. The previous one is
    /// retained for in-flight inbound sessions that still reference it.
    pub async fn rotate_signed_prekey(&self) -> Result<SignedPrekeyRecord, SessionError> {
        let identity = self.identity().await?;
        let key_id = self.store.allocate_prekey_ids(1).await?;
        let (secret, public, signature) = x3dh::generate_signed_prekey(&identity);

        let record = SignedPrekeyRecord {
            key_id,
            public: public.to_bytes(),
            secret: secret.to_bytes(),
            signature: signature.to_vec(),
            created_at: Utc::now(),
            uploaded: false,
        };
        self.store.save_signed_prekey(&record).await?;
        self.store
            .update_metadata(&MetadataPatch {
                last_signed_prekey_id: Some(key_id),
                ..Default::default()
            })
            .await?;

        tracing::info!(
            target: "sl_session",
            event = "signed_prekey_rotated",
            key_id
        );
        Ok(record)
    }

    /// The current signed prekey, rotating one into existence if none exists.
    pub async fn current_signed_prekey(&self) -> Result<SignedPrekeyRecord, SessionError> {
        match self.store.load_current_signed_prekey().await? {
            Some(record) => Ok(record),
            None => self.rotate_signed_prekey().await,
        }
    }

    /// Generate `count` one-time prekeys over a freshly reserved contiguous
    /// id range. Returns the assigned ids.
    pub async fn generate_one_time_prekeys(&self, count: u32) -> Result<Vec<u32>, SessionError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let first_id = self.store.allocate_prekey_ids(count).await?;
        let now = Utc::now();

        let records: Vec<OneTimePrekeyRecord> = x3dh::generate_one_time_prekeys(count as usize)
            .into_iter()
            .enumerate()
            .map(|(i, (secret, public))| OneTimePrekeyRecord {
                key_id: first_id + i as u32,
                public: public.to_bytes(),
                secret: secret.to_bytes(),
                created_at: now,
                uploaded: false,
                consumed: false,
            })
            .collect();

        self.store.save_one_time_prekeys(&records).await?;
        Ok(records.iter().map(|r| r.key_id).collect())
    }

    /// Everything staged for upload: the signed prekey if it has not been
    /// uploaded yet, plus not-yet-uploaded one-time prekeys (capped).
    /// `None` when the server already has everything.
    pub async fn pending_bundle(&self) -> Result<Option<PrekeyUploadRequest>, SessionError> {
        let identity = self
            .store
            .load_identity()
            .await?
            .ok_or_else(|| SessionError::Store(StoreError::NotFound("identity".into())))?;

        let signed_prekey = self
            .store
            .load_current_signed_prekey()
            .await?
            .filter(|spk| !spk.uploaded)
            .map(|spk| UploadedSignedPrekey {
                key_id: spk.key_id,
                public: hex::encode(spk.public),
                signature: URL_SAFE_NO_PAD.encode(&spk.signature),
            });

        let one_time_prekeys: Vec<UploadedOneTimePrekey> = self
            .store
            .pending_one_time_prekeys(self.config.max_upload_prekeys)
            .await?
            .iter()
            .map(|otp| UploadedOneTimePrekey {
                key_id: otp.key_id,
                public: hex::encode(otp.public),
            })
            .collect();

        let request = PrekeyUploadRequest {
            identity_key: hex::encode(identity.agreement_public),
            signing_key: hex::encode(identity.signing_public),
            signed_prekey,
            one_time_prekeys,
        };

        Ok(if request.is_empty() { None } else { Some(request) })
    }

    /// Flip the uploaded flags for everything a completed upload carried.
    /// Idempotent on already-uploaded material.
    pub async fn mark_bundle_uploaded(
        &self,
        request: &PrekeyUploadRequest,
    ) -> Result<(), SessionError> {
        if let Some(spk) = &request.signed_prekey {
            self.store.mark_signed_prekey_uploaded(spk.key_id).await?;
        }
        let ids: Vec<u32> = request.one_time_prekeys.iter().map(|o| o.key_id).collect();
        if !ids.is_empty() {
            self.store.mark_one_time_prekeys_uploaded(&ids).await?;
        }
        self.store
            .update_metadata(&MetadataPatch {
                last_upload_at: Some(Utc::now()),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    /// Destroy identity, prekeys and sessions, then mint a fresh identity.
    /// Every peer will see the key change; the caller must re-upload the new
    /// bundle.
    pub async fn reset_identity(&self, user_id: &str) -> Result<IdentityRecord, SessionError> {
        tracing::warn!(
            target: "sl_session",
            event = "identity_reset",
            user_id = %user_id
        );
        self.store.reset_all().await?;
        self.initialize(user_id).await
    }
}
