//! In-memory test doubles.
//!
//! [`MemoryServer`] plays the prekey-bundle server for any number of users;
//! [`MemoryTransport`] is one user's authenticated view of it. Integration
//! tests wire two stores to one server and shuttle envelopes by hand.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use sl_proto::api::{
    BundleOneTimePrekey, BundleSignedPrekey, PrekeyBundleResponse, PrekeyStatusResponse,
    PrekeyUploadRequest,
};

use crate::transport::{Transport, TransportError};

#[derive(Default)]
struct Shelf {
    identity_key: String,
    signing_key: String,
    signed_prekey: Option<BundleSignedPrekey>,
    signed_prekey_uploaded_at: Option<DateTime<Utc>>,
    one_time: VecDeque<BundleOneTimePrekey>,
}

/// Shared bundle store standing in for the server.
#[derive(Default)]
pub struct MemoryServer {
    users: Mutex<HashMap<String, Shelf>>,
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport authenticated as `user_id`.
    pub fn client_for(self: &Arc<Self>, user_id: &str) -> MemoryTransport {
        MemoryTransport {
            server: Arc::clone(self),
            user_id: user_id.to_string(),
        }
    }

    /// One-time prekeys the server still holds for `user_id`.
    pub fn one_time_prekey_count(&self, user_id: &str) -> usize {
        self.users
            .lock()
            .expect("server mutex")
            .get(user_id)
            .map_or(0, |s| s.one_time.len())
    }

    /// Backdate a user's signed prekey, as if the TTL had elapsed.
    pub fn age_signed_prekey(&self, user_id: &str, by: Duration) {
        if let Some(shelf) = self.users.lock().expect("server mutex").get_mut(user_id) {
            if let Some(at) = shelf.signed_prekey_uploaded_at.as_mut() {
                *at -= by;
            }
        }
    }
}

pub struct MemoryTransport {
    server: Arc<MemoryServer>,
    user_id: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch_bundle(&self, peer_id: &str) -> Result<PrekeyBundleResponse, TransportError> {
        let mut users = self.server.users.lock().expect("server mutex");
        let shelf = users.get_mut(peer_id).ok_or(TransportError::Status {
            status: 404,
            body: format!("no bundle for {peer_id}"),
        })?;
        let signed_prekey = shelf.signed_prekey.clone().ok_or(TransportError::Status {
            status: 404,
            body: format!("no signed prekey for {peer_id}"),
        })?;

        Ok(PrekeyBundleResponse {
            identity_key: shelf.identity_key.clone(),
            signing_key: shelf.signing_key.clone(),
            signed_prekey,
            one_time_prekey: shelf.one_time.pop_front(),
        })
    }

    async fn upload_prekeys(&self, request: &PrekeyUploadRequest) -> Result<(), TransportError> {
        let mut users = self.server.users.lock().expect("server mutex");
        let shelf = users.entry(self.user_id.clone()).or_default();
        shelf.identity_key = request.identity_key.clone();
        shelf.signing_key = request.signing_key.clone();
        if let Some(spk) = &request.signed_prekey {
            shelf.signed_prekey = Some(BundleSignedPrekey {
                key_id: spk.key_id,
                public: spk.public.clone(),
                signature: spk.signature.clone(),
            });
            shelf.signed_prekey_uploaded_at = Some(Utc::now());
        }
        shelf.one_time.extend(
            request
                .one_time_prekeys
                .iter()
                .map(|opk| BundleOneTimePrekey {
                    key_id: opk.key_id,
                    public: opk.public.clone(),
                }),
        );
        Ok(())
    }

    async fn prekey_status(&self) -> Result<PrekeyStatusResponse, TransportError> {
        let users = self.server.users.lock().expect("server mutex");
        let shelf = users.get(&self.user_id);
        Ok(PrekeyStatusResponse {
            one_time_prekey_count: shelf.map_or(0, |s| s.one_time.len() as u32),
            signed_prekey_key_id: shelf.and_then(|s| s.signed_prekey.as_ref().map(|p| p.key_id)),
            signed_prekey_created_at: shelf.and_then(|s| s.signed_prekey_uploaded_at),
        })
    }
}
