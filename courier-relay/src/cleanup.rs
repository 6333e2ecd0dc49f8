//! Background cleanup task for expired queued messages.
//!
//! Runs periodically to delete queue entries past their TTL and to evict
//! idle rate-limiter keys.

use crate::config::CleanupConfig;
use crate::limits::RateLimits;
use crate::storage::{OfflineQueue, SqliteStorage};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Spawn a background cleanup task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(
    storage: Arc<SqliteStorage>,
    rate_limits: RateLimits,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Cleanup task disabled");
            return;
        }

        let interval_secs = config.interval_secs;
        tracing::info!("Cleanup task started (interval: {}s)", interval_secs);

        let mut timer = interval(Duration::from_secs(interval_secs));

        loop {
            timer.tick().await;

            match storage.cleanup_expired().await {
                Ok(deleted) => {
                    if deleted > 0 {
                        tracing::info!("Cleanup: deleted {} expired queue entries", deleted);
                    } else {
                        tracing::debug!("Cleanup: no expired queue entries");
                    }
                }
                Err(e) => {
                    tracing::error!("Cleanup error: {}", e);
                }
            }

            rate_limits.shrink();
        }
    })
}
