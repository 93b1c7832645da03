//! Periodic sweeps for expired token records and stale login counters.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::LoginLimiter;
use crate::config::SESSION_SWEEP_INTERVAL_SECS;
use crate::sessions::TokenStore;

/// Starts the background sweep task. Redemption and validation already
/// delete expired records lazily, the sweep only bounds store growth.
pub fn spawn_background_tasks(store: Arc<TokenStore>, limiter: Arc<LoginLimiter>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SESSION_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            match store.cleanup_expired().await {
                Ok(0) => {}
                Ok(count) => debug!(count, "swept expired tokens"),
                Err(err) => warn!(error = %err, "token sweep failed"),
            }
            limiter.prune().await;
        }
    });
}
