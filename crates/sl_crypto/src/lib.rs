//! sl_crypto — Saltline cryptographic core
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Everything here is pure state + math; persistence and I/O live in
//!   `sl_store` / `sl_session`.
//!
//! # Module layout
//! - `identity` — seed-derived Ed25519 signing + X25519 agreement keys
//! - `x3dh`     — asynchronous key agreement over published prekey bundles
//! - `ratchet`  — Double Ratchet with DH steps + bounded skipped-key cache
//! - `aead`     — XChaCha20-Poly1305 message sealing, AES-256-GCM at rest
//! - `kdf`      — HKDF / HMAC chain derivations, Argon2id master-key KEK
//! - `error`    — unified error type

pub mod aead;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod ratchet;
pub mod x3dh;

pub use error::CryptoError;
