//! Construction-time knobs. Every constant the protocol cares about is
//! overridable here; the defaults match the deployed service.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// How many one-time prekeys the server should hold for us.
    pub one_time_prekey_target: u32,
    /// Top up once the server reports fewer than this.
    pub server_prekey_minimum: u32,
    /// Cap on one-time prekeys staged per upload.
    pub max_upload_prekeys: u32,
    /// Rotate the signed prekey once the server's copy is older than this.
    pub signed_prekey_ttl: Duration,
    /// Cadence of the replenishment poll.
    pub status_poll_interval: Duration,
    /// Bound on cached skipped message keys per session.
    pub max_skipped: u64,
    /// Deadline for a single transport call.
    pub transport_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            one_time_prekey_target: 100,
            server_prekey_minimum: 20,
            max_upload_prekeys: 100,
            signed_prekey_ttl: Duration::from_secs(7 * 86_400),
            status_poll_interval: Duration::from_secs(300),
            max_skipped: 1000,
            transport_timeout: Duration::from_secs(30),
        }
    }
}
