//! Named retry policies built on `backon`.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `store_policy` | 25ms | 1s | 4 | Lease store reads and heartbeats |
//! | `checkpoint_policy` | 50ms | 2s | 5 | Checkpoint writes inside the lease window |
//! | `source_policy` | 100ms | 30s | unbounded | Transient event source failures |
//!
//! Every policy uses jitter so a fleet recovering from the same outage does
//! not retry in lockstep.
//!
//! # Example
//!
//! ```rust,no_run
//! use leasehold::consumer::retry;
//! use backon::Retryable;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let result = (|| async { Ok::<_, std::io::Error>(()) })
//!         .retry(retry::store_policy())
//!         .when(|e| e.kind() == std::io::ErrorKind::TimedOut)
//!         .await?;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder, Retryable};

/// Delay used once the source backoff iterator is exhausted.
pub const SOURCE_MAX_DELAY: Duration = Duration::from_secs(30);

/// Policy for lease store reads and membership heartbeats.
pub fn store_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(25))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(4)
        .with_jitter()
}

/// Policy for checkpoint writes.
///
/// The whole sequence must fit well inside one lease duration; the lease
/// guard is re-checked before every attempt regardless.
pub fn checkpoint_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(5)
        .with_jitter()
}

/// Policy for transient event source failures. Retried indefinitely.
pub fn source_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(SOURCE_MAX_DELAY)
        .with_max_times(usize::MAX)
        .with_jitter()
}

/// A fresh backoff sequence for the event source.
pub fn source_backoff() -> ExponentialBackoff {
    source_policy().build()
}

/// Execute an async operation with the store retry policy.
///
/// Retries are counted under `policy_name` in the retry metric.
pub async fn with_store_policy<F, Fut, T, E, C>(
    policy_name: &str,
    operation: F,
    condition: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::error::Error,
    C: FnMut(&E) -> bool,
{
    let retries = AtomicU32::new(0);
    let result = operation
        .retry(store_policy())
        .when(condition)
        .notify(|_: &E, _: Duration| {
            let attempt = retries.fetch_add(1, Ordering::Relaxed) + 1;
            record_retry_attempt(policy_name, attempt);
        })
        .await;

    if retries.load(Ordering::Relaxed) > 0 {
        match &result {
            Ok(_) => record_retry_success(policy_name),
            Err(_) => record_retry_exhausted(policy_name),
        }
    }
    result
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(policy_name: &str, attempt: u32) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "attempt"])
        .inc();

    tracing::debug!(policy = policy_name, attempt, "Retry attempt");
}

/// Record a retry exhaustion (all retries failed).
pub fn record_retry_exhausted(policy_name: &str) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "exhausted"])
        .inc();

    tracing::warn!(policy = policy_name, "Retry policy exhausted");
}

/// Record a retry success.
pub fn record_retry_success(policy_name: &str) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "success"])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_source_backoff_is_capped() {
        let delays: Vec<_> = source_backoff().take(20).collect();
        assert_eq!(delays.len(), 20);
        assert!(delays.iter().all(|d| *d <= SOURCE_MAX_DELAY * 2));
    }

    #[test]
    fn test_checkpoint_policy_is_bounded() {
        let attempts = checkpoint_policy().build().count();
        assert_eq!(attempts, 5);
    }

    #[tokio::test]
    async fn test_with_store_policy_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_store_policy(
            "test",
            || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"))
                    } else {
                        Ok(7)
                    }
                }
            },
            |e| e.kind() == std::io::ErrorKind::TimedOut,
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_store_policy_stops_on_non_retriable() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_store_policy(
            "test",
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad"))
                }
            },
            |e| e.kind() == std::io::ErrorKind::TimedOut,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_store_policy_counts_retries() {
        let before = crate::consumer::metrics::RETRY_ATTEMPTS
            .with_label_values(&["counted", "attempt"])
            .get();
        let calls = &AtomicU32::new(0);
        let result = with_store_policy(
            "counted",
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"))
                } else {
                    Ok(())
                }
            },
            |e| e.kind() == std::io::ErrorKind::TimedOut,
        )
        .await;
        assert!(result.is_ok());
        let after = crate::consumer::metrics::RETRY_ATTEMPTS
            .with_label_values(&["counted", "attempt"])
            .get();
        assert_eq!(after - before, 1);
    }
}
