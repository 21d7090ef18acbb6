//! Retry with exponential backoff for remote capability calls.
//!
//! Retries rate limits, transport failures and timeouts. Never retries
//! authentication failures or malformed responses: a second attempt would
//! fail the same way.

use std::time::Duration;

use tracing::warn;

use crate::error::CapabilityError;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = fail on the first error).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Scale delays down by a fixed per-attempt factor.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        if self.jitter {
            // Deterministic spread; no rand dependency for this.
            let factor = match attempt % 4 {
                0 => 0.75,
                1 => 0.90,
                2 => 0.60,
                _ => 0.85,
            };
            Duration::from_secs_f64(capped * factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

/// Whether another attempt could succeed.
pub fn is_transient(error: &CapabilityError) -> bool {
    match error {
        CapabilityError::RateLimited(_) | CapabilityError::Timeout(_) => true,
        CapabilityError::Transport(detail) => {
            let permanent = ["HTTP 400", "HTTP 404", "HTTP 422"];
            !permanent.iter().any(|p| detail.contains(p))
        }
        CapabilityError::Unavailable(_)
        | CapabilityError::Auth(_)
        | CapabilityError::Malformed(_)
        | CapabilityError::Storage(_) => false,
    }
}

/// Run `call` until it succeeds, fails permanently, or retries run out.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut call: F,
) -> Result<T, CapabilityError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, CapabilityError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < config.max_retries && is_transient(&e) => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    "{label}: transient failure (attempt {}/{}): {e}. Retrying in {delay:?}",
                    attempt + 1,
                    config.max_retries,
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
