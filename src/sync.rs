//! Bounded synchronization and publish-with-retry over a [`SharedStore`].

use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{BenchError, Result};
use crate::store::{Publish, SharedStore, SyncStatus};

/// Retry budget for synchronization and publishing.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts before declaring an operational failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }

    fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// Brings the local view up to the store's latest accepted state.
///
/// Unpublished local state is abandoned and the sync retried, up to
/// `max_retries` times. Fails with [`BenchError::SyncConflict`] once the
/// retry budget is spent.
pub async fn synchronize<S: SharedStore>(store: &mut S, retry: &RetryConfig) -> Result<SyncStatus> {
    let retries = retry.attempts();
    let mut attempt = 0;
    loop {
        match store.sync()? {
            SyncStatus::Diverged if attempt < retries => {
                attempt += 1;
                let delay_ms = retry.delay_for_attempt(attempt);
                warn!(attempt, max = retries, delay_ms, "local state diverged, discarding");
                store.discard()?;
                sleep(Duration::from_millis(delay_ms)).await;
            }
            SyncStatus::Diverged => return Err(BenchError::SyncConflict { attempts: retries }),
            status => return Ok(status),
        }
    }
}

/// Applies a change-set to freshly synchronized state and publishes it,
/// re-applying on top of the new state whenever the publish is rejected.
///
/// `apply` must be safe to run repeatedly: it sees a clean view each time.
pub async fn publish_with_retry<S, F>(
    store: &mut S,
    retry: &RetryConfig,
    message: &str,
    mut apply: F,
) -> Result<()>
where
    S: SharedStore,
    F: FnMut(&mut S) -> Result<()>,
{
    for attempt in 1..=retry.attempts() {
        synchronize(store, retry).await?;
        apply(store)?;
        match store.publish(message)? {
            Publish::Accepted => {
                debug!(message, attempt, "change-set published");
                return Ok(());
            }
            Publish::Rejected => {
                let delay_ms = retry.delay_for_attempt(attempt);
                warn!(message, attempt, delay_ms, "publish rejected, store moved");
                store.discard()?;
                sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }
    Err(BenchError::SyncConflict {
        attempts: retry.attempts(),
    })
}
