//! sl_proto — Saltline wire formats
//!
//! - `envelope` — the `E2EE:`-tagged message envelope carried by the
//!   transport (ratchet header + ciphertext, plus the handshake prelude on
//!   a session's first message)
//! - `api`      — JSON bodies for the prekey endpoints

pub mod api;
pub mod envelope;

pub use envelope::{Envelope, EnvelopeError, X3dhPrelude};
