//! Retry logic with exponential backoff and jitter.
//!
//! Wraps a single provider call. Every attempt is admitted by the provider's
//! circuit breaker and its outcome is recorded back, so a breaker that opens
//! mid-sequence stops the remaining attempts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::circuit::{duration_secs, BreakerRegistry};
use super::clock::{SharedClock, SystemClock};
use crate::ai::ProviderError;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 = double each time).
    pub multiplier: f64,

    /// Maximum delay between retries.
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,

    /// Whether to add jitter to delays (prevents thundering herd).
    pub jitter: bool,

    /// Timeout for each individual attempt.
    #[serde(with = "duration_secs")]
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
            attempt_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryConfig {
    /// Create a config with no retries (fail fast).
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Default::default() }
    }

    /// Calculate the delay to wait after `attempt` failed (1-based).
    ///
    /// `base * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base_delay = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Add up to 25% jitter
            let jitter_factor = 1.0 + (rand_jitter() * 0.25);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

/// Simple pseudo-random jitter (0.0 to 1.0) without external deps.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// Why a retried call produced no value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    /// The breaker refused an attempt.
    #[error("circuit open for {provider} after {attempts} attempt(s)")]
    CircuitOpen { provider: String, attempts: u32, last: Option<ProviderError> },

    /// Transient failures used up every attempt.
    #[error("{provider} failed after {attempts} attempt(s): {last}")]
    Exhausted { provider: String, attempts: u32, last: ProviderError },

    /// A non-retryable failure.
    #[error("{provider} rejected the request: {error}")]
    Permanent { provider: String, attempts: u32, error: ProviderError },

    /// Cancellation was requested.
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl RetryError {
    /// Attempts that reached the provider.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::CircuitOpen { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Permanent { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }
}

/// Successful result of a retried call.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    /// Attempts made, including the successful one
    pub attempts: u32,
}

/// Retry policy: config, retryable predicate and clock.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    retryable: Arc<dyn Fn(&ProviderError) -> bool + Send + Sync>,
    clock: SharedClock,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy").field("config", &self.config).finish()
    }
}

impl RetryPolicy {
    /// Policy retrying transient provider errors on the system clock.
    pub fn new(config: RetryConfig) -> Self {
        Self { config, retryable: Arc::new(ProviderError::is_transient), clock: Arc::new(SystemClock) }
    }

    /// Use the given clock for backoff sleeps.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the retryable-error predicate.
    pub fn with_predicate(
        mut self,
        retryable: impl Fn(&ProviderError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retryable = Arc::new(retryable);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` against `provider` until it succeeds, fails
    /// permanently, runs out of attempts, trips the breaker or is cancelled.
    pub async fn run<T, F, Fut>(
        &self,
        provider: &str,
        breakers: &BreakerRegistry,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<Retried<T>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0;
        let mut last_error = None;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts });
            }
            if !breakers.allow(provider) {
                tracing::debug!(provider, attempts, "Attempt short-circuited by open breaker");
                return Err(RetryError::CircuitOpen {
                    provider: provider.to_string(),
                    attempts,
                    last: last_error,
                });
            }

            attempts += 1;
            let attempt = tokio::time::timeout(self.config.attempt_timeout, operation(attempts));
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    breakers.abandon_probe(provider);
                    return Err(RetryError::Cancelled { attempts });
                }
                outcome = attempt => outcome
                    .unwrap_or(Err(ProviderError::Timeout(self.config.attempt_timeout))),
            };

            let error = match result {
                Ok(value) => {
                    breakers.record_success(provider);
                    return Ok(Retried { value, attempts });
                }
                Err(error) => {
                    breakers.record_failure(provider);
                    error
                }
            };

            if !(self.retryable)(&error) {
                tracing::debug!(provider, attempts, error = %error, "Permanent provider failure");
                return Err(RetryError::Permanent {
                    provider: provider.to_string(),
                    attempts,
                    error,
                });
            }

            if attempts >= max_attempts {
                return Err(RetryError::Exhausted {
                    provider: provider.to_string(),
                    attempts,
                    last: error,
                });
            }

            let delay = self.config.delay_after_attempt(attempts);
            tracing::debug!(provider, attempts, ?delay, error = %error, "Retrying provider call");
            last_error = Some(error);

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RetryError::Cancelled { attempts }),
                () = self.clock.sleep(delay) => {}
            }
        }
    }
}
