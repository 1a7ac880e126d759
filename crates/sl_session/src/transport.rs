//! Transport capability: the three prekey endpoints the core needs.
//!
//! Message delivery itself is the embedding application's business — the
//! core hands it opaque envelope strings. What the core does own is keeping
//! the server-side bundle healthy, so the trait covers exactly that:
//! fetching a peer's bundle, uploading our own material, and polling the
//! server's view of our inventory.
//!
//! Injected at construction; an in-memory double lives in
//! [`crate::testing`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use sl_proto::api::{PrekeyBundleResponse, PrekeyStatusResponse, PrekeyUploadRequest};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response body: {0}")]
    Decode(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// `GET /api/users/{peer_id}/prekey_bundle` — the server hands out (and
    /// deletes) one one-time prekey per call.
    async fn fetch_bundle(&self, peer_id: &str) -> Result<PrekeyBundleResponse, TransportError>;

    /// `POST /api/users/prekeys`
    async fn upload_prekeys(&self, request: &PrekeyUploadRequest) -> Result<(), TransportError>;

    /// `GET /api/users/prekeys/status`
    async fn prekey_status(&self) -> Result<PrekeyStatusResponse, TransportError>;
}

/// HTTP client, authenticated by bearer user-id.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    user_id: String,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        user_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id: user_id.into(),
        })
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(TransportError::Status { status: status.as_u16(), body })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_bundle(&self, peer_id: &str) -> Result<PrekeyBundleResponse, TransportError> {
        let resp = self
            .client
            .get(format!("{}/api/users/{peer_id}/prekey_bundle", self.base_url))
            .bearer_auth(&self.user_id)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn upload_prekeys(&self, request: &PrekeyUploadRequest) -> Result<(), TransportError> {
        let resp = self
            .client
            .post(format!("{}/api/users/prekeys", self.base_url))
            .bearer_auth(&self.user_id)
            .json(request)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn prekey_status(&self) -> Result<PrekeyStatusResponse, TransportError> {
        let resp = self
            .client
            .get(format!("{}/api/users/prekeys/status", self.base_url))
            .bearer_auth(&self.user_id)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}
