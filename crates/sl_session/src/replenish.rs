//! Periodic prekey replenishment.
//!
//! Runs at startup and on a fixed interval: asks the server how our bundle
//! looks, tops up one-time prekeys when the count drops under the minimum,
//! rotates the signed prekey past its TTL, and uploads whatever got staged.
//!
//! Errors are logged and swallowed — the next tick retries. Nothing here may
//! take a session lock.

use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::{
    config::CoreConfig, error::SessionError, keys::KeyManager, transport::Transport,
};

/// Handle to the running loop: wake it early or shut it down.
pub struct ReplenishHandle {
    /// Notify to trigger an immediate tick (e.g. right after registration).
    pub wake: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReplenishHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

pub fn spawn_replenish_loop(
    keys: Arc<KeyManager>,
    transport: Arc<dyn Transport>,
    config: CoreConfig,
) -> ReplenishHandle {
    let wake = Arc::new(Notify::new());
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let wake_task = wake.clone();

    let task = tokio::spawn(async move {
        tracing::info!(
            target: "sl_session",
            event = "replenish_loop_started",
            interval_secs = config.status_poll_interval.as_secs()
        );

        loop {
            if let Err(err) = replenish_tick(&keys, transport.as_ref(), &config).await {
                tracing::warn!(
                    target: "sl_session",
                    event = "replenish_tick_failed",
                    error = %err
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(config.status_poll_interval) => {}
                _ = wake_task.notified() => {
                    tracing::debug!(target: "sl_session", "replenish loop woken early");
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!(target: "sl_session", event = "replenish_loop_stopped");
                        return;
                    }
                }
            }
        }
    });

    ReplenishHandle { wake, shutdown_tx, task }
}

/// One pass of the replenishment policy. Public so embedders (and tests) can
/// run it synchronously, e.g. right after first registration.
pub async fn replenish_tick(
    keys: &KeyManager,
    transport: &dyn Transport,
    config: &CoreConfig,
) -> Result<(), SessionError> {
    let status = transport
        .prekey_status()
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))?;

    if status.one_time_prekey_count < config.server_prekey_minimum {
        let deficit = config
            .one_time_prekey_target
            .saturating_sub(status.one_time_prekey_count);
        if deficit > 0 {
            let batch = deficit.min(config.max_upload_prekeys);
            let ids = keys.generate_one_time_prekeys(batch).await?;
            tracing::info!(
                target: "sl_session",
                event = "one_time_prekeys_queued",
                server_count = status.one_time_prekey_count,
                generated = ids.len()
            );
        }
    }

    let ttl = chrono::Duration::from_std(config.signed_prekey_ttl)
        .unwrap_or_else(|_| chrono::Duration::days(7));
    let spk_stale = match status.signed_prekey_created_at {
        None => true,
        Some(created_at) => chrono::Utc::now() - created_at > ttl,
    };
    if spk_stale {
        keys.rotate_signed_prekey().await?;
    }

    if let Some(bundle) = keys.pending_bundle().await? {
        transport
            .upload_prekeys(&bundle)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        keys.mark_bundle_uploaded(&bundle).await?;
        tracing::info!(
            target: "sl_session",
            event = "bundle_uploaded",
            signed_prekey = bundle.signed_prekey.is_some(),
            one_time_prekeys = bundle.one_time_prekeys.len()
        );
    }

    Ok(())
}
