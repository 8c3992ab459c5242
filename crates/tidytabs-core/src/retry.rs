//! Retry and batching helpers for host calls.
//!
//! Every mutating call against the tab host goes through [`with_retry`];
//! bulk operations additionally go through [`run_batched`], which chunks a
//! large id list and paces the chunks so a burst of mutations does not
//! starve the host.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tidytabs_core::retry::{RetryPolicy, with_retry};
//!
//! let policy = RetryPolicy::default();
//!
//! let tabs = with_retry(&policy, "list_all_tabs", || async {
//!     host.list_all_tabs().await
//! }).await?;
//! ```
//!
//! Only transient failures are retried; structural failures such as a dead
//! group id are returned immediately so callers can run their fallbacks.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::HostResult;
use crate::tabs::TabId;

/// Default chunk size for bulk mutations
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default pause between bulk mutation chunks
pub const DEFAULT_BATCH_PACE_MS: u64 = 50;

/// Configuration for retry behavior with a linearly increasing delay.
///
/// The delay before retry `n` (0-indexed) is `initial_delay * (n + 1)`,
/// capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry (default: 120ms).
    pub initial_delay: Duration,
    /// Maximum delay between retries (default: 2s).
    pub max_delay: Duration,
    /// Maximum number of attempts, including the first (default: 3).
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::host_call()
    }
}

impl RetryPolicy {
    /// Policy for tab host calls: 3 attempts, 120ms initial delay.
    #[must_use]
    pub fn host_call() -> Self {
        Self {
            initial_delay: Duration::from_millis(120),
            max_delay: Duration::from_secs(2),
            max_attempts: 3,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.initial_delay
            .saturating_mul(attempt.saturating_add(1))
            .min(self.max_delay)
    }
}

/// Batching configuration for bulk mutations.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum ids per host call.
    pub size: usize,
    /// Pause inserted between chunks.
    pub pace: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_BATCH_SIZE,
            pace: Duration::from_millis(DEFAULT_BATCH_PACE_MS),
        }
    }
}

/// Execute an async host operation with bounded retry.
///
/// The operation is retried according to the policy while it keeps failing
/// transiently. Structural failures are returned on the first occurrence.
///
/// # Logging
///
/// Each retry attempt is logged at debug with the operation label, attempt
/// number, applied delay, and the error that triggered it; exhaustion is
/// logged at warn.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> HostResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HostResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        op = label,
                        attempt = attempt + 1,
                        "operation succeeded after {} retries",
                        attempt
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                attempt += 1;

                if !err.is_transient() {
                    debug!(
                        op = label,
                        attempt,
                        error = %err,
                        "structural failure, not retrying"
                    );
                    return Err(err);
                }

                if attempt >= max_attempts {
                    warn!(
                        op = label,
                        attempt,
                        max_attempts,
                        error = %err,
                        "operation failed after all retry attempts"
                    );
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    op = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying operation after transient failure"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Run a bulk mutation over `ids` in fixed-size chunks.
///
/// Each chunk is executed through [`with_retry`]; chunks are separated by
/// the configured pacing delay. The first chunk whose retries are exhausted
/// aborts the remainder.
pub async fn run_batched<F, Fut>(
    policy: &RetryPolicy,
    batch: &BatchConfig,
    label: &str,
    ids: &[TabId],
    mut operation: F,
) -> HostResult<()>
where
    F: FnMut(Vec<TabId>) -> Fut,
    Fut: Future<Output = HostResult<()>>,
{
    if ids.is_empty() {
        return Ok(());
    }

    let size = batch.size.max(1);
    let chunk_count = ids.len().div_ceil(size);
    debug!(
        op = label,
        ids = ids.len(),
        chunks = chunk_count,
        "running batched mutation"
    );

    for (position, chunk) in ids.chunks(size).enumerate() {
        with_retry(policy, label, || operation(chunk.to_vec())).await?;

        if position + 1 < chunk_count && !batch.pace.is_zero() {
            tokio::time::sleep(batch.pace).await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[test]
    fn delay_grows_linearly() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            max_attempts: 10,
        };

        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn retry_succeeds_immediately() {
        let policy = RetryPolicy::default();
        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = Arc::clone(&call_count);

        let result = with_retry(&policy, "test_op", || {
            let count = Arc::clone(&call_count_clone);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok::<_, HostError>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            max_attempts: 5,
        };
        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = Arc::clone(&call_count);

        let result = with_retry(&policy, "test_op", || {
            let count = Arc::clone(&call_count_clone);
            async move {
                let n = count.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(HostError::CallFailed("busy".into()))
                } else {
                    Ok::<_, HostError>(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhausts_attempts() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            max_attempts: 3,
        };
        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = Arc::clone(&call_count);

        let result: HostResult<i32> = with_retry(&policy, "test_op", || {
            let count = Arc::clone(&call_count_clone);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err(HostError::Timeout(50))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn structural_failures_are_not_retried() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            max_attempts: 5,
        };
        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = Arc::clone(&call_count);

        let result: HostResult<i32> = with_retry(&policy, "test_op", || {
            let count = Arc::clone(&call_count_clone);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err(HostError::GroupNotFound(crate::tabs::GroupId(55)))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn batched_run_chunks_and_paces() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            max_attempts: 3,
        };
        let batch = BatchConfig {
            size: 2,
            pace: Duration::from_millis(50),
        };
        let ids: Vec<TabId> = (1..=5).map(TabId).collect();
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let chunks_clone = Arc::clone(&chunks);

        run_batched(&policy, &batch, "close_tabs", &ids, |chunk| {
            let seen = Arc::clone(&chunks_clone);
            async move {
                seen.lock().unwrap().push(chunk);
                Ok(())
            }
        })
        .await
        .unwrap();

        let seen = chunks.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], vec![TabId(1), TabId(2)]);
        assert_eq!(seen[1], vec![TabId(3), TabId(4)]);
        assert_eq!(seen[2], vec![TabId(5)]);
    }

    #[tokio::test]
    async fn batched_run_skips_empty_input() {
        let policy = RetryPolicy::default();
        let batch = BatchConfig::default();
        let called = Arc::new(AtomicU32::new(0));
        let called_clone = Arc::clone(&called);

        run_batched(&policy, &batch, "close_tabs", &[], |_chunk| {
            let count = Arc::clone(&called_clone);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn batched_run_aborts_on_exhausted_chunk() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_attempts: 2,
        };
        let batch = BatchConfig {
            size: 2,
            pace: Duration::ZERO,
        };
        let ids: Vec<TabId> = (1..=6).map(TabId).collect();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = run_batched(&policy, &batch, "move_tabs", &ids, |chunk| {
            let count = Arc::clone(&calls_clone);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                if chunk.contains(&TabId(3)) {
                    Err(HostError::CallFailed("stuck".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_err());
        // chunk 1 once, chunk 2 twice (retry), chunk 3 never
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn default_policy_matches_host_preset() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(120));
    }
}
