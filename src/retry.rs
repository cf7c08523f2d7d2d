//! Retry controller — wraps a fallible async operation in exponential
//! backoff with jitter, gated on a rate-limit predicate. A standalone
//! higher-order wrapper so it isn't baked into any one caller.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
        }
    }
}

impl RetryConfig {
    pub fn from_config(cfg: &crate::config::RateLimitConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            initial_delay: Duration::from_millis(cfg.initial_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self
            .initial_delay
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let capped = scaled.min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        capped.mul_f64(jitter)
    }
}

/// Runs `op` until it succeeds, `is_rate_limited` says the error isn't
/// retryable, or `max_retries` attempts have failed. Non-rate-limit errors
/// surface immediately on the first failure.
pub async fn with_retry<T, F, Fut>(
    config: RetryConfig,
    is_rate_limited: impl Fn(&anyhow::Error) -> bool,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_rate_limited(&err) {
                    return Err(err);
                }
                if attempt >= config.max_retries {
                    return Err(err);
                }
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    "rate limited, retrying in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    config.max_retries
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn always_rate_limited(_: &anyhow::Error) -> bool {
        true
    }

    fn never_rate_limited(_: &anyhow::Error) -> bool {
        false
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        };
        let result: anyhow::Result<u32> = with_retry(config, always_rate_limited, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        };
        let result: anyhow::Result<u32> = with_retry(config, always_rate_limited, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(anyhow::anyhow!("429"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_rate_limit_error_surfaces_immediately() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::default();
        let result: anyhow::Result<u32> = with_retry(config, never_rate_limited, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("not found"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bounded_by_max_retries() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let result: anyhow::Result<u32> = with_retry(config, always_rate_limited, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("429"))
        })
        .await;
        assert!(result.is_err());
        // initial attempt + 2 retries = 3 calls total
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
