//! Exponential backoff for transient upstream failures

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::RetryableError;

/// Re-runs an operation while it fails with a retryable error
#[derive(Debug, Clone)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// A manager that never retries
    pub fn disabled() -> Self {
        Self::new(RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        })
    }

    /// Run `operation`, retrying up to `max_retries` times
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError + std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= self.config.max_retries {
                if self.config.max_retries > 0 {
                    warn!(attempts = attempt + 1, error = %err, "Upstream retries exhausted");
                }
                return Err(err);
            }

            let backoff = self.backoff(attempt);
            debug!(
                attempt = attempt + 1,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Retrying upstream call"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// `initial * multiplier^attempt`, capped, optionally scaled into 50-100%
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.config.max_backoff_ms as f64);
        let millis = if self.config.jitter {
            capped * rand::thread_rng().gen_range(0.5..1.0)
        } else {
            capped
        };
        Duration::from_millis(millis as u64)
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}
