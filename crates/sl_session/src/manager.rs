//! SessionManager: peer → session orchestration.
//!
//! Establishes sessions (X3DH initiator and responder sides), routes
//! encrypt/decrypt through the Double Ratchet, and keeps durable state in
//! the key store.
//!
//! # Locking discipline
//! Every mutation of one peer's session runs under that peer's async mutex;
//! operations on different peers interleave freely. Locks are taken for one
//! peer at a time and never nested, so there is no ordering to get wrong.
//!
//! # Persistence discipline
//! - encrypt: the advanced ratchet state is persisted BEFORE the envelope is
//!   produced — an emitted ciphertext always has its chain counter on disk,
//!   and counters never rewind.
//! - decrypt: state is persisted only AFTER the AEAD open succeeds, so a
//!   duplicate or tampered message leaves durable state untouched.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, Zeroizing};

use sl_crypto::{aead, identity, kdf, ratchet::RatchetState, x3dh, x3dh::PeerBundle, CryptoError};
use sl_proto::{api::PrekeyBundleResponse, Envelope, X3dhPrelude};
use sl_store::{KeyStore, SessionRecord, SessionStatus, StoreError};

use crate::{
    config::CoreConfig,
    error::SessionError,
    keys::KeyManager,
    replenish::{spawn_replenish_loop, ReplenishHandle},
    transport::Transport,
};

/// Public view of a session; no secret material.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer_id: String,
    pub session_id: String,
    pub status: SessionStatus,
    pub remote_fingerprint: Option<String>,
}

impl SessionInfo {
    fn of(rec: &SessionRecord) -> Self {
        Self {
            peer_id: rec.peer_id.clone(),
            session_id: rec.session_id.clone(),
            status: rec.status,
            remote_fingerprint: rec.remote_fingerprint.clone(),
        }
    }
}

pub struct SessionManager {
    store: KeyStore,
    keys: Arc<KeyManager>,
    transport: Arc<dyn Transport>,
    config: CoreConfig,
    peer_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(
        store: KeyStore,
        keys: Arc<KeyManager>,
        transport: Arc<dyn Transport>,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            keys,
            transport,
            config,
            peer_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the periodic prekey replenishment task for this user.
    pub fn start_replenishment(&self) -> ReplenishHandle {
        spawn_replenish_loop(self.keys.clone(), self.transport.clone(), self.config.clone())
    }

    async fn peer_lock(&self, peer_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.peer_locks.lock().await;
        map.entry(peer_id.to_string()).or_default().clone()
    }

    // ── Session establishment (initiator) ────────────────────────────────

    /// Return the ready session with `peer_id`, establishing one via X3DH if
    /// needed. Idempotent once ready; a failed attempt is persisted as
    /// `error` with `last_error` set and retried from scratch next call.
    pub async fn ensure_session(&self, peer_id: &str) -> Result<SessionInfo, SessionError> {
        let lock = self.peer_lock(peer_id).await;
        let _guard = lock.lock().await;
        self.ensure_session_locked(peer_id).await.map(|r| SessionInfo::of(&r))
    }

    async fn ensure_session_locked(&self, peer_id: &str) -> Result<SessionRecord, SessionError> {
        let existing = self.store.load_session(peer_id).await?;
        if let Some(rec) = existing {
            if rec.status == SessionStatus::Ready && rec.ratchet.is_some() {
                return Ok(rec);
            }
            // Fall through and re-establish; keep the identity pin and the
            // original creation time.
            return self.establish_outbound(peer_id, rec.remote_identity_key, rec.created_at).await;
        }
        self.establish_outbound(peer_id, None, Utc::now()).await
    }

    async fn establish_outbound(
        &self,
        peer_id: &str,
        pinned_identity: Option<[u8; 32]>,
        created_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<SessionRecord, SessionError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        // Mark pending before any suspension point so a cancelled or failed
        // attempt is visible and retryable.
        let mut rec = SessionRecord {
            peer_id: peer_id.to_string(),
            session_id: session_id.clone(),
            status: SessionStatus::Pending,
            remote_identity_key: pinned_identity,
            remote_signing_key: None,
            remote_signed_prekey: None,
            remote_signed_prekey_id: None,
            remote_fingerprint: pinned_identity.map(|k| identity::fingerprint(&k)),
            local_ephemeral_public: None,
            local_ephemeral_secret: None,
            used_one_time_prekey_id: None,
            prelude_pending: false,
            ratchet: None,
            last_error: None,
            created_at,
            updated_at: now,
        };
        self.store.save_session(&rec).await?;

        match self.run_x3dh_initiator(peer_id, pinned_identity, &mut rec).await {
            Ok(()) => {
                rec.status = SessionStatus::Ready;
                rec.last_error = None;
                rec.updated_at = Utc::now();
                self.store.save_session(&rec).await?;
                tracing::info!(
                    target: "sl_session",
                    event = "session_established",
                    peer_id = %peer_id,
                    session_id = %rec.session_id,
                    with_opk = rec.used_one_time_prekey_id.is_some()
                );
                Ok(rec)
            }
            Err(e) => {
                rec.status = SessionStatus::Error;
                rec.last_error = Some(e.to_string());
                rec.updated_at = Utc::now();
                rec.ratchet = None;
                self.store.save_session(&rec).await?;
                tracing::warn!(
                    target: "sl_session",
                    event = "session_establishment_failed",
                    peer_id = %peer_id,
                    error = %e
                );
                Err(e)
            }
        }
    }

    async fn run_x3dh_initiator(
        &self,
        peer_id: &str,
        pinned_identity: Option<[u8; 32]>,
        rec: &mut SessionRecord,
    ) -> Result<(), SessionError> {
        let response: PrekeyBundleResponse = self
            .transport
            .fetch_bundle(peer_id)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        let bundle =
            PeerBundle::try_from(&response).map_err(|e| SessionError::MalformedBundle(e.to_string()))?;

        if let Some(stored) = pinned_identity {
            if stored != bundle.identity_key {
                return Err(SessionError::IdentityMismatch {
                    peer: peer_id.to_string(),
                    stored: identity::fingerprint(&stored),
                    presented: identity::fingerprint(&bundle.identity_key),
                });
            }
        }

        bundle.verify().map_err(|_| SessionError::BundleUnverified)?;

        let me = self.keys.identity().await?;
        let agreement = x3dh::initiate(&me, &bundle).map_err(|e| match e {
            CryptoError::SignatureVerification => SessionError::BundleUnverified,
            other => other.into(),
        })?;

        let ratchet = RatchetState::init_sender(
            agreement.shared_key,
            &bundle.signed_prekey,
            self.config.max_skipped,
        )?;

        rec.remote_identity_key = Some(bundle.identity_key);
        rec.remote_signing_key = Some(bundle.signing_key);
        rec.remote_signed_prekey = Some(bundle.signed_prekey);
        rec.remote_signed_prekey_id = Some(bundle.signed_prekey_id);
        rec.remote_fingerprint = Some(identity::fingerprint(&bundle.identity_key));
        rec.local_ephemeral_public = Some(agreement.ephemeral_public);
        rec.local_ephemeral_secret = Some(agreement.ephemeral_secret);
        rec.used_one_time_prekey_id = agreement.used_one_time_prekey_id;
        rec.prelude_pending = true;
        rec.ratchet = Some(ratchet);
        Ok(())
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    /// Encrypt `plaintext` for `peer_id`, establishing a session first if
    /// none exists. Returns the textual envelope for the transport.
    pub async fn encrypt(&self, peer_id: &str, plaintext: &[u8]) -> Result<String, SessionError> {
        let lock = self.peer_lock(peer_id).await;
        let _guard = lock.lock().await;

        let mut rec = self.ensure_session_locked(peer_id).await?;
        let ratchet = rec
            .ratchet
            .as_mut()
            .ok_or_else(|| SessionError::Store(StoreError::Corrupt("ready session without ratchet".into())))?;

        let (header, mut mk) = ratchet.encrypt_step()?;

        // The opening message carries the handshake prelude; afterwards the
        // ratchet header stands alone.
        let prelude = if rec.prelude_pending {
            let me = self
                .store
                .load_identity()
                .await?
                .ok_or_else(|| SessionError::Store(StoreError::NotFound("identity".into())))?;
            Some(X3dhPrelude {
                identity_key: me.agreement_public,
                ephemeral_key: rec.local_ephemeral_public.ok_or_else(|| {
                    SessionError::Store(StoreError::Corrupt("initiator session without ephemeral".into()))
                })?,
                opk_id: rec.used_one_time_prekey_id,
            })
        } else {
            None
        };
        rec.prelude_pending = false;
        rec.updated_at = Utc::now();

        // Persist the advanced chain before emitting any ciphertext.
        self.store.save_session(&rec).await?;

        let (mut key, nonce) = kdf::message_seal_material(&mk)?;
        mk.zeroize();
        let ciphertext = aead::seal_message(&key, &nonce, plaintext, &header.aad_bytes())?;
        key.zeroize();

        tracing::debug!(
            target: "sl_session",
            event = "message_encrypted",
            peer_id = %peer_id,
            n = header.n,
            with_prelude = prelude.is_some()
        );

        Ok(Envelope { header, ciphertext, x3dh: prelude }.encode())
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// Decrypt an envelope from `peer_id`. A first message with a handshake
    /// prelude establishes the responder-side session on the fly.
    pub async fn decrypt(
        &self,
        peer_id: &str,
        envelope_text: &str,
    ) -> Result<Zeroizing<Vec<u8>>, SessionError> {
        let envelope = Envelope::decode(envelope_text)?;

        let lock = self.peer_lock(peer_id).await;
        let _guard = lock.lock().await;

        let mut existing = self.store.load_session(peer_id).await?;

        // A prelude naming a different identity than the one we pinned is a
        // trust decision for the user, never an auto-accept.
        if let (Some(prelude), Some(stored)) = (
            envelope.x3dh.as_ref(),
            existing.as_ref().and_then(|r| r.remote_identity_key),
        ) {
            if prelude.identity_key != stored {
                return Err(SessionError::IdentityMismatch {
                    peer: peer_id.to_string(),
                    stored: identity::fingerprint(&stored),
                    presented: identity::fingerprint(&prelude.identity_key),
                });
            }
        }

        if let Some(rec) = existing.as_mut() {
            if let Some(ratchet) = rec.ratchet.as_mut() {
                let mut mk = ratchet.decrypt_step(&envelope.header)?;
                let (mut key, nonce) = kdf::message_seal_material(&mk)?;
                mk.zeroize();
                let plaintext = aead::open_message(
                    &key,
                    &nonce,
                    &envelope.ciphertext,
                    &envelope.header.aad_bytes(),
                )?;
                key.zeroize();

                rec.updated_at = Utc::now();
                self.store.save_session(rec).await?;
                return Ok(plaintext);
            }
        }

        let Some(prelude) = envelope.x3dh else {
            return Err(SessionError::SessionNotFound(peer_id.to_string()));
        };
        self.establish_inbound(peer_id, &prelude, &envelope, existing).await
    }

    /// Responder side: mirror the DH set against the referenced one-time
    /// prekey, initialize the ratchet as receiver and decrypt the opening
    /// message. The prekey is consumed (secret deleted) only once the
    /// session actually establishes, so a refused opening message does not
    /// burn it.
    async fn establish_inbound(
        &self,
        peer_id: &str,
        prelude: &X3dhPrelude,
        envelope: &Envelope,
        prior: Option<SessionRecord>,
    ) -> Result<Zeroizing<Vec<u8>>, SessionError> {
        let me = self.keys.identity().await?;

        let opk_secret: Option<StaticSecret> = match prelude.opk_id {
            None => None,
            Some(id) => {
                let record = self.store.load_one_time_prekey(id).await.map_err(|e| match e {
                    StoreError::PrekeyConsumed(_) | StoreError::NotFound(_) => {
                        SessionError::OpkAlreadyConsumed(id)
                    }
                    other => other.into(),
                })?;
                Some(StaticSecret::from(record.secret))
            }
        };

        // The prelude does not name the signed prekey generation the
        // initiator fetched, and a rotation may have happened in between.
        // Try stored signed prekeys newest-first; the AEAD open arbitrates.
        let spks = self.store.load_signed_prekeys().await?;
        if spks.is_empty() {
            return Err(SessionError::Store(StoreError::NotFound("signed prekey".into())));
        }

        for spk in &spks {
            let spk_secret = StaticSecret::from(spk.secret);
            let shared_key = x3dh::respond(
                &me,
                &spk_secret,
                opk_secret.as_ref(),
                &prelude.identity_key,
                &prelude.ephemeral_key,
            )?;

            let mut ratchet =
                RatchetState::init_receiver(shared_key, &spk_secret, self.config.max_skipped);
            let mut mk = ratchet.decrypt_step(&envelope.header)?;
            let (mut key, nonce) = kdf::message_seal_material(&mk)?;
            mk.zeroize();

            match aead::open_message(&key, &nonce, &envelope.ciphertext, &envelope.header.aad_bytes())
            {
                Ok(plaintext) => {
                    key.zeroize();

                    // Spend the prekey now that the handshake is proven. A
                    // concurrent establishment from another peer id racing
                    // on the same prekey loses here and is refused.
                    if let Some(id) = prelude.opk_id {
                        self.store.consume_one_time_prekey(id).await.map_err(|e| match e {
                            StoreError::PrekeyConsumed(_) | StoreError::NotFound(_) => {
                                SessionError::OpkAlreadyConsumed(id)
                            }
                            other => other.into(),
                        })?;
                    }

                    let now = Utc::now();
                    let rec = SessionRecord {
                        peer_id: peer_id.to_string(),
                        session_id: uuid::Uuid::new_v4().to_string(),
                        status: SessionStatus::Ready,
                        remote_identity_key: Some(prelude.identity_key),
                        remote_signing_key: None,
                        remote_signed_prekey: None,
                        remote_signed_prekey_id: None,
                        remote_fingerprint: Some(identity::fingerprint(&prelude.identity_key)),
                        local_ephemeral_public: None,
                        local_ephemeral_secret: None,
                        used_one_time_prekey_id: prelude.opk_id,
                        prelude_pending: false,
                        ratchet: Some(ratchet),
                        last_error: None,
                        created_at: prior.as_ref().map_or(now, |r| r.created_at),
                        updated_at: now,
                    };
                    self.store.save_session(&rec).await?;
                    tracing::info!(
                        target: "sl_session",
                        event = "session_established_inbound",
                        peer_id = %peer_id,
                        session_id = %rec.session_id,
                        signed_prekey_id = spk.key_id,
                        with_opk = prelude.opk_id.is_some()
                    );
                    return Ok(plaintext);
                }
                Err(_) => {
                    key.zeroize();
                    // Wrong signed prekey generation; try the next one.
                    continue;
                }
            }
        }

        Err(SessionError::DecryptionFailed)
    }

    /// Drop the session with `peer_id` entirely. The next message in either
    /// direction starts a fresh handshake.
    pub async fn delete_session(&self, peer_id: &str) -> Result<(), SessionError> {
        let lock = self.peer_lock(peer_id).await;
        let _guard = lock.lock().await;
        self.store.delete_session(peer_id).await?;
        Ok(())
    }

    /// Sessions currently known to the store.
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, SessionError> {
        Ok(self
            .store
            .list_sessions()
            .await?
            .iter()
            .map(SessionInfo::of)
            .collect())
    }
}
