//! sl_session — Saltline session orchestration
//!
//! The top layer of the E2EE core. Wires the crypto (`sl_crypto`), the wire
//! formats (`sl_proto`) and the encrypted store (`sl_store`) into a usable
//! client surface:
//!
//! - [`KeyManager`] — identity bootstrap, signed-prekey rotation, one-time
//!   prekey batches, upload staging
//! - [`SessionManager`] — X3DH establishment (both sides), per-peer
//!   serialized encrypt/decrypt through the Double Ratchet
//! - [`replenish`] — the background task that keeps the server-side bundle
//!   healthy
//! - [`transport`] — the narrow capability interface to the server, with an
//!   HTTP implementation and an in-memory double ([`testing`])
//!
//! Construction is explicit: open a [`sl_store::KeyStore`], build a
//! [`KeyManager`] and a [`Transport`], hand both to [`SessionManager::new`],
//! and call [`SessionManager::start_replenishment`] once per login.

pub mod config;
pub mod error;
pub mod keys;
pub mod manager;
pub mod replenish;
pub mod testing;
pub mod transport;

pub use config::CoreConfig;
pub use error::SessionError;
pub use keys::KeyManager;
pub use manager::{SessionInfo, SessionManager};
pub use replenish::{replenish_tick, spawn_replenish_loop, ReplenishHandle};
pub use transport::{HttpTransport, Transport, TransportError};
