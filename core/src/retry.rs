//! Bounded retry with exponential backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{Result, TtsError};

/// Information handed to the `on_retry` hook before each backoff sleep.
#[derive(Debug, Clone)]
pub struct RetryInfo {
    /// Zero-based index of the attempt that just failed
    pub attempt: u32,
    pub delay: Duration,
    pub error: String,
}

type ShouldRetry = Arc<dyn Fn(&TtsError) -> bool + Send + Sync>;
type OnRetry = Arc<dyn Fn(&RetryInfo) + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    should_retry: Option<ShouldRetry>,
    on_retry: Option<OnRetry>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(5_000),
            should_retry: None,
            on_retry: None,
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retries", &self.retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl RetryPolicy {
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn should_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&TtsError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(f));
        self
    }

    /// Informational hook; cannot alter control flow.
    pub fn on_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&RetryInfo) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(f));
        self
    }

    /// Delay before attempt `k` (k ≥ 1): `min(base * 2^(k-1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        2u32.checked_pow(attempt - 1)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    fn allows(&self, error: &TtsError) -> bool {
        self.should_retry.as_ref().map(|f| f(error)).unwrap_or(true)
    }
}

/// Run `op` up to `retries + 1` times.
///
/// Aborts are rethrown immediately; a `should_retry` veto stops at once; after
/// the last attempt the last error is returned. Backoff sleeps end early with
/// [`TtsError::Aborted`] when `cancel` fires.
pub async fn with_retry<T, F, Fut>(
    mut op: F,
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if error.is_abort() || attempt >= policy.retries || !policy.allows(&error) {
            return Err(error);
        }

        let delay = policy.delay_for(attempt + 1);
        if let Some(hook) = &policy.on_retry {
            hook(&RetryInfo {
                attempt,
                delay,
                error: error.to_string(),
            });
        }
        info!(
            target: "tts.retry",
            attempt = attempt + 1,
            total = policy.retries + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, retrying"
        );

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(TtsError::Aborted("retry backoff cancelled".to_string()));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1_000));
    }
}
