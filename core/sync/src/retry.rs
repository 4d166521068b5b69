//! Exponential backoff for transient backend failures.
//!
//! [`RetryConfig`] is the single backoff schedule of the crate: the drain
//! loop uses it between failed passes, and [`RetryExecutor`] uses it for
//! one-shot calls such as collection refreshes.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use larder_common::Result;

/// Backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt. Only used by [`RetryExecutor`].
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Spread delays by +/- 25% so clients do not retry in lockstep.
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after `failures` consecutive failures, counting from 0.
    ///
    /// `initial * multiplier^failures`, jittered, then capped at `max_delay`.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let max_ms = self.max_delay.as_millis() as f64;
        let exponent = failures.min(i32::MAX as u32) as i32;
        let grown = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let grown = if grown.is_finite() { grown.min(max_ms) } else { max_ms };

        Duration::from_millis(self.jittered(grown).min(max_ms) as u64)
    }

    fn jittered(&self, millis: f64) -> f64 {
        if self.jitter {
            millis * (0.75 + rand::random::<f64>() * 0.5)
        } else {
            millis
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Runs a fallible async call, retrying transient failures on the schedule.
///
/// Errors that are not transient (see `Error::is_transient`) return at once.
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `call`, naming it `what` in log lines.
    pub async fn execute<F, Fut, T>(&self, what: &str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = 0;
        loop {
            let err = match call().await {
                Ok(value) => {
                    if failures > 0 {
                        debug!("{} succeeded after {} retries", what, failures);
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err),
            };

            if failures >= self.config.max_retries {
                warn!("{} gave up after {} attempts: {}", what, failures + 1, err);
                return Err(err);
            }

            let delay = self.config.delay_for_attempt(failures);
            failures += 1;
            warn!("{} failed ({}), retry {} in {:?}", what, err, failures, delay);
            sleep(delay).await;
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_common::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn steady(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1))
            .with_jitter(false)
    }

    #[test]
    fn test_delays_double_until_capped() {
        let config = steady(0);
        let delays: Vec<u64> = (0..6)
            .map(|n| config.delay_for_attempt(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = steady(0).with_jitter(true);
        for _ in 0..50 {
            let delay = config.delay_for_attempt(1).as_millis();
            assert!((150..=250).contains(&delay), "delay {} out of band", delay);
        }
    }

    #[test]
    fn test_jitter_never_exceeds_max_delay() {
        let config = steady(0).with_jitter(true);
        for failures in [4, 5, 10, u32::MAX] {
            for _ in 0..50 {
                let delay = config.delay_for_attempt(failures);
                assert!(delay <= Duration::from_secs(1), "delay {:?} over cap", delay);
                assert!(delay >= Duration::from_millis(750));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_on_schedule() {
        let calls = &AtomicU32::new(0);
        let executor = RetryExecutor::new(steady(3));
        let started = Instant::now();

        let result = executor
            .execute("fetch ingredients", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Transport("connection reset".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let executor = RetryExecutor::new(steady(3));

        let result: Result<()> = executor
            .execute("create recipe", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Validation("negative stock".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = &AtomicU32::new(0);
        let executor = RetryExecutor::new(steady(2));

        let result: Result<()> = executor
            .execute("fetch recipes", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Transport("timeout".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
