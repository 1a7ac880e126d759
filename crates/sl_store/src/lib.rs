//! sl_store — Saltline encrypted key store
//!
//! # Encryption strategy
//! SQLite does NOT natively encrypt. We use application-level encryption:
//! - Secret columns (identity seed, prekey secrets, ratchet state) are
//!   AES-256-GCM ciphertext under a per-store master key, base64-encoded.
//! - The master key is generated at first open and held in memory for the
//!   process lifetime; with a passphrase it rests Argon2id-wrapped.
//! - Public keys, signatures and timestamps are plaintext so lookups stay
//!   cheap.
//!
//! # Migration
//! sqlx migrations in `migrations/` run on open. Migrations add tables,
//! never rewrite rows.

pub mod db;
pub mod error;
pub mod master_key;
pub mod records;

pub use db::KeyStore;
pub use error::StoreError;
pub use records::{
    IdentityRecord, MetadataPatch, OneTimePrekeyRecord, SessionRecord, SessionStatus,
    SignedPrekeyRecord, StoreMetadata,
};
