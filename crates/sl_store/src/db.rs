//! KeyStore: persistence over SQLite via sqlx.
//!
//! Five tables: `identity`, `signed_prekeys`, `one_time_prekeys`,
//! `sessions`, `metadata`. Every secret-bearing column is wrapped by the
//! master key before it touches a row (`seal` / `open_sealed`); public keys
//! and signatures are stored verbatim.
//!
//! Each operation is atomic with respect to its table. Callers that need a
//! cross-table invariant (the session manager's per-peer discipline)
//! serialize above this layer.

use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
    SqlitePool,
};
use zeroize::Zeroizing;

use sl_crypto::{aead, ratchet::RatchetState};

use crate::{
    error::StoreError,
    master_key::MasterKey,
    records::{
        IdentityRecord, MetadataPatch, OneTimePrekeyRecord, SessionRecord, SessionStatus,
        SignedPrekeyRecord, StoreMetadata,
    },
};

/// Key store handle. Cheap to clone (pool + Arc internally).
#[derive(Clone)]
pub struct KeyStore {
    pool: SqlitePool,
    master: Arc<MasterKey>,
}

impl KeyStore {
    /// Open (or create) the store at `db_path`, running pending migrations.
    ///
    /// WAL journal mode and foreign-key enforcement are configured at
    /// connection time, not inside a migration — SQLite refuses to change
    /// `journal_mode` inside a transaction and sqlx wraps every migration in
    /// one.
    ///
    /// With `passphrase` the master key is persisted Argon2id-wrapped; an
    /// existing wrapped store refuses to open without it.
    pub async fn open(db_path: &Path, passphrase: Option<&str>) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        let master = Self::bootstrap_master_key(&pool, passphrase).await?;

        tracing::info!(
            target: "sl_store",
            event = "store_opened",
            path = %db_path.display(),
            wrapped = passphrase.is_some()
        );

        Ok(Self { pool, master: Arc::new(master) })
    }

    async fn bootstrap_master_key(
        pool: &SqlitePool,
        passphrase: Option<&str>,
    ) -> Result<MasterKey, StoreError> {
        let row: Option<(Option<String>, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT master_key, master_key_wrapped, kek_salt FROM metadata WHERE id = 1",
        )
        .fetch_optional(pool)
        .await?;

        match row {
            None => {
                // First open: generate and persist.
                let master = MasterKey::generate();
                let (raw, wrapped, salt) = match passphrase {
                    Some(pass) => {
                        let (wrapped, salt) = master.wrap(pass)?;
                        (None, Some(URL_SAFE_NO_PAD.encode(wrapped)), Some(hex::encode(salt)))
                    }
                    None => (Some(URL_SAFE_NO_PAD.encode(master.as_bytes())), None, None),
                };
                sqlx::query(
                    "INSERT INTO metadata (id, next_prekey_id, master_key, master_key_wrapped, kek_salt, created_at) \
                     VALUES (1, 1, ?, ?, ?, ?)",
                )
                .bind(raw)
                .bind(wrapped)
                .bind(salt)
                .bind(Utc::now())
                .execute(pool)
                .await?;
                Ok(master)
            }
            Some((Some(raw), _, _)) => {
                let bytes = URL_SAFE_NO_PAD
                    .decode(&raw)
                    .map_err(|e| StoreError::Corrupt(format!("master key: {e}")))?;
                let key: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("master key has wrong length".into()))?;
                Ok(MasterKey::from_bytes(key))
            }
            Some((None, Some(wrapped), Some(salt_hex))) => {
                let pass = passphrase.ok_or(StoreError::PassphraseRequired)?;
                let wrapped = URL_SAFE_NO_PAD
                    .decode(&wrapped)
                    .map_err(|e| StoreError::Corrupt(format!("wrapped master key: {e}")))?;
                let salt: [u8; 16] = hex::decode(&salt_hex)
                    .map_err(|e| StoreError::Corrupt(format!("kek salt: {e}")))?
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("kek salt has wrong length".into()))?;
                MasterKey::unwrap(&wrapped, pass, &salt)
            }
            Some(_) => Err(StoreError::Corrupt("metadata row has no master key".into())),
        }
    }

    // ── Wrapping helpers ─────────────────────────────────────────────────

    fn seal(&self, plaintext: &[u8]) -> Result<String, StoreError> {
        let ct = aead::seal_at_rest(self.master.as_bytes(), plaintext)?;
        Ok(URL_SAFE_NO_PAD.encode(ct))
    }

    fn open_sealed(&self, b64: &str) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        let ct = URL_SAFE_NO_PAD
            .decode(b64)
            .map_err(|e| StoreError::Corrupt(format!("sealed value: {e}")))?;
        Ok(aead::open_at_rest(self.master.as_bytes(), &ct)?)
    }

    fn open_sealed32(&self, b64: &str) -> Result<[u8; 32], StoreError> {
        let plain = self.open_sealed(b64)?;
        plain
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Corrupt("sealed value has wrong length".into()))
    }

    // ── Identity ─────────────────────────────────────────────────────────

    pub async fn save_identity(&self, rec: &IdentityRecord) -> Result<(), StoreError> {
        let seed_enc = self.seal(&rec.seed)?;
        sqlx::query(
            "INSERT OR REPLACE INTO identity \
             (user_id, seed_enc, signing_public, agreement_public, fingerprint, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&rec.user_id)
        .bind(seed_enc)
        .bind(hex::encode(rec.signing_public))
        .bind(hex::encode(rec.agreement_public))
        .bind(&rec.fingerprint)
        .bind(rec.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_identity(&self) -> Result<Option<IdentityRecord>, StoreError> {
        let row: Option<(String, String, String, String, String, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT user_id, seed_enc, signing_public, agreement_public, fingerprint, created_at \
                 FROM identity LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await?;

        let Some((user_id, seed_enc, signing_public, agreement_public, fingerprint, created_at)) =
            row
        else {
            return Ok(None);
        };

        Ok(Some(IdentityRecord {
            user_id,
            seed: self.open_sealed32(&seed_enc)?,
            signing_public: decode32("identity.signing_public", &signing_public)?,
            agreement_public: decode32("identity.agreement_public", &agreement_public)?,
            fingerprint,
            created_at,
        }))
    }

    // ── Signed prekeys ───────────────────────────────────────────────────

    pub async fn save_signed_prekey(&self, rec: &SignedPrekeyRecord) -> Result<(), StoreError> {
        let secret_enc = self.seal(&rec.secret)?;
        sqlx::query(
            "INSERT OR REPLACE INTO signed_prekeys \
             (key_id, public_key, secret_enc, signature, created_at, uploaded) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(rec.key_id as i64)
        .bind(hex::encode(rec.public))
        .bind(secret_enc)
        .bind(URL_SAFE_NO_PAD.encode(&rec.signature))
        .bind(rec.created_at)
        .bind(rec.uploaded)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The signed prekey with the highest id, i.e. the one rotations would
    /// replace.
    pub async fn load_current_signed_prekey(
        &self,
    ) -> Result<Option<SignedPrekeyRecord>, StoreError> {
        let mut all = self.load_signed_prekeys().await?;
        Ok(if all.is_empty() { None } else { Some(all.remove(0)) })
    }

    /// All signed prekeys, newest first. Older entries stay usable for
    /// in-flight inbound sessions until the rotation after next.
    pub async fn load_signed_prekeys(&self) -> Result<Vec<SignedPrekeyRecord>, StoreError> {
        let rows: Vec<(i64, String, String, String, DateTime<Utc>, bool)> = sqlx::query_as(
            "SELECT key_id, public_key, secret_enc, signature, created_at, uploaded \
             FROM signed_prekeys ORDER BY key_id DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(key_id, public_key, secret_enc, signature, created_at, uploaded)| {
                Ok(SignedPrekeyRecord {
                    key_id: key_id as u32,
                    public: decode32("signed_prekey.public_key", &public_key)?,
                    secret: self.open_sealed32(&secret_enc)?,
                    signature: URL_SAFE_NO_PAD
                        .decode(&signature)
                        .map_err(|e| StoreError::Corrupt(format!("signed_prekey.signature: {e}")))?,
                    created_at,
                    uploaded,
                })
            })
            .collect()
    }

    pub async fn mark_signed_prekey_uploaded(&self, key_id: u32) -> Result<(), StoreError> {
        sqlx::query("UPDATE signed_prekeys SET uploaded = 1 WHERE key_id = ?")
            .bind(key_id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── One-time prekeys ─────────────────────────────────────────────────

    pub async fn save_one_time_prekeys(
        &self,
        batch: &[OneTimePrekeyRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for rec in batch {
            let secret_enc = self.seal(&rec.secret)?;
            sqlx::query(
                "INSERT INTO one_time_prekeys \
                 (key_id, public_key, secret_enc, created_at, uploaded, consumed) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(rec.key_id as i64)
            .bind(hex::encode(rec.public))
            .bind(secret_enc)
            .bind(rec.created_at)
            .bind(rec.uploaded)
            .bind(rec.consumed)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Unconsumed prekeys that have not been uploaded yet, oldest id first.
    pub async fn pending_one_time_prekeys(
        &self,
        limit: u32,
    ) -> Result<Vec<OneTimePrekeyRecord>, StoreError> {
        let rows: Vec<(i64, String, String, DateTime<Utc>, bool, bool)> = sqlx::query_as(
            "SELECT key_id, public_key, secret_enc, created_at, uploaded, consumed \
             FROM one_time_prekeys \
             WHERE uploaded = 0 AND consumed = 0 ORDER BY key_id ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(key_id, public_key, secret_enc, created_at, uploaded, consumed)| {
                Ok(OneTimePrekeyRecord {
                    key_id: key_id as u32,
                    public: decode32("one_time_prekey.public_key", &public_key)?,
                    secret: self.open_sealed32(&secret_enc)?,
                    created_at,
                    uploaded,
                    consumed,
                })
            })
            .collect()
    }

    pub async fn mark_one_time_prekeys_uploaded(&self, ids: &[u32]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("UPDATE one_time_prekeys SET uploaded = 1 WHERE key_id = ?")
                .bind(*id as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Read a one-time prekey without spending it. A consumed tombstone
    /// surfaces as [`StoreError::PrekeyConsumed`].
    pub async fn load_one_time_prekey(
        &self,
        key_id: u32,
    ) -> Result<OneTimePrekeyRecord, StoreError> {
        let row: Option<(String, Option<String>, DateTime<Utc>, bool, bool)> = sqlx::query_as(
            "SELECT public_key, secret_enc, created_at, uploaded, consumed \
             FROM one_time_prekeys WHERE key_id = ?",
        )
        .bind(key_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        let (public_key, secret_enc, created_at, uploaded, consumed) =
            row.ok_or_else(|| StoreError::NotFound(format!("one-time prekey {key_id}")))?;
        if consumed {
            return Err(StoreError::PrekeyConsumed(key_id));
        }
        let secret_enc = secret_enc.ok_or(StoreError::PrekeyConsumed(key_id))?;

        Ok(OneTimePrekeyRecord {
            key_id,
            public: decode32("one_time_prekey.public_key", &public_key)?,
            secret: self.open_sealed32(&secret_enc)?,
            created_at,
            uploaded,
            consumed: false,
        })
    }

    /// Spend a one-time prekey: return its secret exactly once, NULL the
    /// stored secret and keep the row as a consumed tombstone.
    pub async fn consume_one_time_prekey(
        &self,
        key_id: u32,
    ) -> Result<OneTimePrekeyRecord, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(String, Option<String>, DateTime<Utc>, bool, bool)> = sqlx::query_as(
            "SELECT public_key, secret_enc, created_at, uploaded, consumed \
             FROM one_time_prekeys WHERE key_id = ?",
        )
        .bind(key_id as i64)
        .fetch_optional(&mut *tx)
        .await?;

        let (public_key, secret_enc, created_at, uploaded, consumed) = row
            .ok_or_else(|| StoreError::NotFound(format!("one-time prekey {key_id}")))?;

        if consumed {
            return Err(StoreError::PrekeyConsumed(key_id));
        }
        let secret_enc =
            secret_enc.ok_or(StoreError::PrekeyConsumed(key_id))?;
        let secret = self.open_sealed32(&secret_enc)?;

        sqlx::query(
            "UPDATE one_time_prekeys SET consumed = 1, secret_enc = NULL WHERE key_id = ?",
        )
        .bind(key_id as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(OneTimePrekeyRecord {
            key_id,
            public: decode32("one_time_prekey.public_key", &public_key)?,
            secret,
            created_at,
            uploaded,
            consumed: true,
        })
    }

    /// Locally held, unconsumed one-time prekeys.
    pub async fn count_one_time_prekeys(&self) -> Result<u32, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM one_time_prekeys WHERE consumed = 0")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u32)
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    pub async fn save_session(&self, rec: &SessionRecord) -> Result<(), StoreError> {
        let ratchet_enc = match &rec.ratchet {
            Some(state) => Some(self.seal(&serde_json::to_vec(state)?)?),
            None => None,
        };
        let ephemeral_secret_enc = match &rec.local_ephemeral_secret {
            Some(secret) => Some(self.seal(secret)?),
            None => None,
        };

        sqlx::query(
            "INSERT OR REPLACE INTO sessions \
             (peer_id, session_id, status, remote_identity_key, remote_signing_key, \
              remote_signed_prekey, remote_signed_prekey_id, remote_fingerprint, \
              ephemeral_public, ephemeral_secret_enc, used_one_time_prekey_id, \
              prelude_pending, ratchet_enc, last_error, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rec.peer_id)
        .bind(&rec.session_id)
        .bind(rec.status.as_str())
        .bind(rec.remote_identity_key.map(hex::encode))
        .bind(rec.remote_signing_key.map(hex::encode))
        .bind(rec.remote_signed_prekey.map(hex::encode))
        .bind(rec.remote_signed_prekey_id.map(|id| id as i64))
        .bind(&rec.remote_fingerprint)
        .bind(rec.local_ephemeral_public.map(hex::encode))
        .bind(ephemeral_secret_enc)
        .bind(rec.used_one_time_prekey_id.map(|id| id as i64))
        .bind(rec.prelude_pending)
        .bind(ratchet_enc)
        .bind(&rec.last_error)
        .bind(rec.created_at)
        .bind(rec.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_session(&self, peer_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT peer_id, session_id, status, remote_identity_key, remote_signing_key, \
                    remote_signed_prekey, remote_signed_prekey_id, remote_fingerprint, \
                    ephemeral_public, ephemeral_secret_enc, used_one_time_prekey_id, \
                    prelude_pending, ratchet_enc, last_error, created_at, updated_at \
             FROM sessions WHERE peer_id = ?",
        )
        .bind(peer_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| self.session_from_row(r)).transpose()
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT peer_id, session_id, status, remote_identity_key, remote_signing_key, \
                    remote_signed_prekey, remote_signed_prekey_id, remote_fingerprint, \
                    ephemeral_public, ephemeral_secret_enc, used_one_time_prekey_id, \
                    prelude_pending, ratchet_enc, last_error, created_at, updated_at \
             FROM sessions ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| self.session_from_row(r)).collect()
    }

    pub async fn delete_session(&self, peer_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE peer_id = ?")
            .bind(peer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn session_from_row(&self, row: SessionRow) -> Result<SessionRecord, StoreError> {
        let status = SessionStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("session status {:?}", row.status)))?;

        let ratchet: Option<RatchetState> = match row.ratchet_enc {
            Some(enc) => {
                let plain = self.open_sealed(&enc)?;
                Some(serde_json::from_slice(&plain)?)
            }
            None => None,
        };

        let local_ephemeral_secret = match row.ephemeral_secret_enc {
            Some(enc) => Some(self.open_sealed32(&enc)?),
            None => None,
        };

        Ok(SessionRecord {
            peer_id: row.peer_id,
            session_id: row.session_id,
            status,
            remote_identity_key: decode32_opt("sessions.remote_identity_key", row.remote_identity_key)?,
            remote_signing_key: decode32_opt("sessions.remote_signing_key", row.remote_signing_key)?,
            remote_signed_prekey: decode32_opt("sessions.remote_signed_prekey", row.remote_signed_prekey)?,
            remote_signed_prekey_id: row.remote_signed_prekey_id.map(|id| id as u32),
            remote_fingerprint: row.remote_fingerprint,
            local_ephemeral_public: decode32_opt("sessions.ephemeral_public", row.ephemeral_public)?,
            local_ephemeral_secret,
            used_one_time_prekey_id: row.used_one_time_prekey_id.map(|id| id as u32),
            prelude_pending: row.prelude_pending,
            ratchet,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    // ── Metadata ─────────────────────────────────────────────────────────

    /// Atomically reserve `n` contiguous prekey ids; returns the first.
    pub async fn allocate_prekey_ids(&self, n: u32) -> Result<u32, StoreError> {
        let new_next: i64 = sqlx::query_scalar(
            "UPDATE metadata SET next_prekey_id = next_prekey_id + ? WHERE id = 1 \
             RETURNING next_prekey_id",
        )
        .bind(n as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok((new_next - n as i64) as u32)
    }

    pub async fn get_metadata(&self) -> Result<StoreMetadata, StoreError> {
        let (next_prekey_id, last_signed_prekey_id, last_upload_at): (
            i64,
            Option<i64>,
            Option<DateTime<Utc>>,
        ) = sqlx::query_as(
            "SELECT next_prekey_id, last_signed_prekey_id, last_upload_at FROM metadata WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreMetadata {
            next_prekey_id: next_prekey_id as u32,
            last_signed_prekey_id: last_signed_prekey_id.map(|id| id as u32),
            last_upload_at,
        })
    }

    pub async fn update_metadata(&self, patch: &MetadataPatch) -> Result<(), StoreError> {
        if let Some(id) = patch.last_signed_prekey_id {
            sqlx::query("UPDATE metadata SET last_signed_prekey_id = ? WHERE id = 1")
                .bind(id as i64)
                .execute(&self.pool)
                .await?;
        }
        if let Some(at) = patch.last_upload_at {
            sqlx::query("UPDATE metadata SET last_upload_at = ? WHERE id = 1")
                .bind(at)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    // ── Reset ────────────────────────────────────────────────────────────

    /// Destroy identity, prekeys and sessions. The prekey id counter is NOT
    /// reset: ids stay monotonic for the store's whole life.
    pub async fn reset_all(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM identity").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM signed_prekeys").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM one_time_prekeys").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM sessions").execute(&mut *tx).await?;
        tx.commit().await?;

        tracing::warn!(target: "sl_store", event = "store_reset");
        Ok(())
    }

    /// Close the underlying pool (flushes WAL). Mainly for tests and clean
    /// shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    peer_id: String,
    session_id: String,
    status: String,
    remote_identity_key: Option<String>,
    remote_signing_key: Option<String>,
    remote_signed_prekey: Option<String>,
    remote_signed_prekey_id: Option<i64>,
    remote_fingerprint: Option<String>,
    ephemeral_public: Option<String>,
    ephemeral_secret_enc: Option<String>,
    used_one_time_prekey_id: Option<i64>,
    prelude_pending: bool,
    ratchet_enc: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn decode32(field: &str, s: &str) -> Result<[u8; 32], StoreError> {
    hex::decode(s)
        .map_err(|e| StoreError::Corrupt(format!("{field}: {e}")))?
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("{field}: expected 32 bytes")))
}

fn decode32_opt(field: &str, s: Option<String>) -> Result<Option<[u8; 32]>, StoreError> {
    s.map(|v| decode32(field, &v)).transpose()
}
