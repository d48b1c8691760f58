// SPDX-License-Identifier: MIT
//! Exponential backoff retry for external calls.
//!
//! Generalises the basic retry-every-error helper with a `should_retry`
//! predicate, so a caller can retry only a specific transient condition
//! (the MCP Bridge's "no views" error, spec §4.9) while letting every other
//! failure through on the first attempt.

use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for [`retry_with_backoff`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Delay before the second attempt; each subsequent delay is multiplied
    /// by `multiplier`.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied to the previous delay on each retry.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// The MCP Bridge's "no views" retry policy (spec §4.9 step 4): base
    /// 500ms, multiplier 2, cap 5s, max 8 attempts.
    pub fn bridge_no_views() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }

    /// Suitable for quick unit tests (no real waiting).
    pub fn instant() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }
}

/// Retry an async operation with exponential backoff, retrying only errors
/// for which `should_retry` returns true. An error the predicate rejects is
/// returned immediately without consuming further attempts.
///
/// # Panics
/// Panics if `config.max_attempts` is 0.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut should_retry: P,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
    P: FnMut(&E) -> bool,
{
    assert!(
        config.max_attempts > 0,
        "RetryConfig.max_attempts must be at least 1"
    );

    let mut delay = config.initial_delay;

    for attempt in 1..=config.max_attempts {
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "retry succeeded");
                }
                return Ok(value);
            }
            Err(e) => {
                let retryable = should_retry(&e);
                if retryable && attempt < config.max_attempts {
                    warn!(
                        attempt,
                        max = config.max_attempts,
                        delay_ms = delay.as_millis(),
                        err = ?e,
                        "attempt failed — retrying"
                    );
                    tokio::time::sleep(delay).await;
                    let next_ms = (delay.as_millis() as f64 * config.multiplier) as u128;
                    delay = Duration::from_millis(next_ms.min(config.max_delay.as_millis()) as u64);
                } else {
                    if retryable {
                        warn!(attempt, max = config.max_attempts, err = ?e, "all retry attempts exhausted");
                    } else {
                        debug!(attempt, "non-retryable error, returning");
                    }
                    return Err(e);
                }
            }
        }
    }

    unreachable!("loop always returns on or before the final attempt")
}

/// Convenience wrapper: retry every error with the default config.
pub async fn retry<F, Fut, T, E>(f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    retry_with_backoff(&RetryConfig::default(), |_| true, f).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let cfg = RetryConfig::instant();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, String> = retry_with_backoff(&cfg, |_| true, || {
            let c = calls2.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn succeeds_on_fourth_attempt_matching_predicate() {
        let cfg = RetryConfig {
            max_attempts: 8,
            ..RetryConfig::instant()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, String> = retry_with_backoff(
            &cfg,
            |e: &String| e == "no views for file:///p/main.go",
            || {
                let c = calls2.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::Relaxed) + 1;
                    if n < 4 {
                        Err("no views for file:///p/main.go".to_string())
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let cfg = RetryConfig::instant();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, String> = retry_with_backoff(&cfg, |_| false, || {
            let c = calls2.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Err("permanent error".to_string())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn returns_last_error_after_all_attempts() {
        let cfg = RetryConfig {
            max_attempts: 3,
            ..RetryConfig::instant()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, String> = retry_with_backoff(&cfg, |_| true, || {
            let c = calls2.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Err("permanent error".to_string())
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), "permanent error");
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn delay_is_capped_at_max() {
        let cfg = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 10.0,
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let start = std::time::Instant::now();
        let _: Result<(), String> = retry_with_backoff(&cfg, |_| true, || {
            let c = calls2.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Err("fail".to_string())
            }
        })
        .await;

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::Relaxed), 10);
    }
}
