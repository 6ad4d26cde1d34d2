use std::time::Duration;

use backup_common::{NamespacedRef, ResourceClient, ResourceKind};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::{BackupError, Result};

pub const READY_JSON_PATH: &str = "{.status.readyToUse}";

/// Bounded exponential backoff for the readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Pause after the failed attempt number `attempt` (starting at 1):
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Wait until the snapshot reports `readyToUse=true`, giving each attempt
/// `timeout`. Any failure counts as "not ready yet", including the object or
/// its status field not existing. Returns the number of attempts used.
pub async fn wait_until_ready(
    client: &dyn ResourceClient,
    snapshot: &NamespacedRef,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<u32> {
    let mut attempt = 1;
    loop {
        let result = client
            .wait_for_condition(
                ResourceKind::VolumeSnapshot,
                Some(&snapshot.namespace),
                &snapshot.name,
                READY_JSON_PATH,
                "true",
                timeout,
            )
            .await;

        match result {
            Ok(()) => {
                info!(%snapshot, attempt, "Snapshot is ready to use");
                return Ok(attempt);
            }
            Err(source) if attempt >= policy.attempts() => {
                return Err(BackupError::ReadinessTimeout {
                    snapshot: snapshot.clone(),
                    attempts: attempt,
                    source,
                });
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                warn!(%snapshot, attempt, error = %e, ?delay, "Snapshot not ready, retrying");
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
