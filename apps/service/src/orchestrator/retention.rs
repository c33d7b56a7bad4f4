//! Expiry of endpoints whose resident has stopped checking in.
//!
//! An endpoint that has not been seen for `expire_days` is deleted. Cleanup
//! runs once at startup and then every `cleanup_interval` as a background
//! task until cancelled.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::database::Database;

/// Retention policy for registered endpoints
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Days without a check-in before an endpoint is deleted
    pub expire_days: u64,
    pub cleanup_interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            expire_days: 3,
            cleanup_interval: Duration::from_secs(24 * 3600),
        }
    }
}

impl RetentionPolicy {
    fn expire_after(&self) -> Duration {
        Duration::from_secs(self.expire_days.saturating_mul(24 * 3600))
    }

    /// Last-seen times before this are expired
    fn cutoff(&self, now: SystemTime) -> SystemTime {
        now.checked_sub(self.expire_after()).unwrap_or(SystemTime::UNIX_EPOCH)
    }
}

/// Cleanup manager for expired endpoints
pub struct RetentionCleanup {
    database: Arc<dyn Database>,
    policy: RetentionPolicy,
}

impl RetentionCleanup {
    pub fn new(database: Arc<dyn Database>, policy: RetentionPolicy) -> Self {
        Self { database, policy }
    }

    pub async fn cleanup_expired_endpoints(&self) -> Result<u64> {
        let deleted = self
            .database
            .delete_endpoints_unseen_since(self.policy.cutoff(SystemTime::now()))
            .await?;

        if deleted > 0 {
            info!(
                "Retention cleanup removed {} endpoints unseen for {} days",
                deleted, self.policy.expire_days
            );
        } else {
            debug!("Retention cleanup found no expired endpoints");
        }
        Ok(deleted)
    }

    /// Start background cleanup task (runs immediately, then every interval)
    pub fn start_periodic_cleanup(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let cleanup = RetentionCleanup::new(Arc::clone(&self.database), self.policy.clone());

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup.policy.cleanup_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                if let Err(e) = cleanup.cleanup_expired_endpoints().await {
                    warn!("Periodic endpoint cleanup failed: {}", e);
                }
            }
            debug!("Retention cleanup stopped");
        })
    }
}
