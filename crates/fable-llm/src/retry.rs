use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use fable_core::errors::GenerateError;
use fable_core::generate::{ReplyGenerator, ReplyStream, TurnRequest};

/// Configuration for RetryGenerator backoff behavior.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.2,
        }
    }
}

/// Wraps a ReplyGenerator with bounded retry on retryable errors.
///
/// Retries apply only to the generate() call itself. Once a stream has been
/// handed back, mid-stream failures are not retried here; the turn surfaces
/// an error event instead, and the client refetches from history.
pub struct RetryGenerator<G> {
    inner: G,
    config: RetryConfig,
    total_retries: AtomicU64,
}

impl<G> RetryGenerator<G> {
    pub fn new(inner: G, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: G) -> Self {
        Self::new(inner, RetryConfig::default())
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Delay for a retry attempt: exponential backoff with jitter.
    fn retry_delay(&self, attempt: u32) -> Duration {
        // Exponential backoff: base * 2^attempt
        let exp_delay = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_delay.min(self.config.max_delay.as_millis() as f64);

        // Jitter: delay * (1 ± jitter_factor)
        let jitter_range = capped * self.config.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            (rand::random::<f64>() * 2.0 - 1.0) * jitter_range
        } else {
            0.0
        };
        let final_ms = (capped + jitter).max(50.0);

        Duration::from_millis(final_ms as u64)
    }
}

#[async_trait]
impl<G: ReplyGenerator> ReplyGenerator for RetryGenerator<G> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(&self, turn: &TurnRequest) -> Result<ReplyStream, GenerateError> {
        let mut last_error: Option<GenerateError> = None;

        for attempt in 0..=self.config.max_retries {
            match self.inner.generate(turn).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    if !e.is_retryable() || attempt == self.config.max_retries {
                        return Err(e);
                    }

                    let delay = self.retry_delay(attempt);
                    self.total_retries.fetch_add(1, Ordering::Relaxed);

                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "reply generation failed, retrying"
                    );

                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or(GenerateError::Network("retry budget exhausted".into())))
    }
}
