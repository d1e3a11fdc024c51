use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::WireError;

type RetryPredicate = Arc<dyn Fn(&WireError) -> bool + Send + Sync>;
type RetryHook = Arc<dyn Fn(u32, &WireError, Duration) + Send + Sync>;

/// Bounded-retry policy for one asynchronous unit of work.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Per-attempt deadline; a timed-out attempt is a retry-eligible failure.
    pub timeout: Option<Duration>,
    /// Overrides [`WireError::retryable`] when present.
    retryable: Option<RetryPredicate>,
    /// Observability hook fired before each backoff sleep. Must not affect
    /// control flow.
    on_retry: Option<RetryHook>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            multiplier: 2.0,
            timeout: None,
            retryable: None,
            on_retry: None,
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    pub fn with_retryable(
        mut self,
        predicate: impl Fn(&WireError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retryable = Some(Arc::new(predicate));
        self
    }

    pub fn with_on_retry(
        mut self,
        hook: impl Fn(u32, &WireError, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    fn is_retryable(&self, error: &WireError) -> bool {
        match &self.retryable {
            Some(predicate) => predicate(error),
            None => error.retryable(),
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let scaled = current.as_millis() as f64 * self.multiplier;
        Duration::from_millis((scaled as u64).min(self.max_delay.as_millis() as u64))
    }
}

/// Run `operation` under `policy`. The last error is returned unchanged so
/// callers can still match on the original failure kind.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, WireError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WireError>>,
{
    let mut delay = policy.initial_delay;

    for attempt in 0..=policy.max_retries {
        let result = match policy.timeout {
            Some(deadline) => match tokio::time::timeout(deadline, operation()).await {
                Ok(result) => result,
                Err(_) => Err(WireError::transport(format!(
                    "attempt timed out after {}ms",
                    deadline.as_millis()
                ))),
            },
            None => operation().await,
        };

        match result {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt, "operation recovered after retries");
                }
                return Ok(value);
            }
            Err(error) => {
                if attempt >= policy.max_retries || !policy.is_retryable(&error) {
                    return Err(error);
                }
                if let Some(hook) = &policy.on_retry {
                    hook(attempt + 1, &error, delay);
                }
                tracing::warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "retryable failure, backing off: {error}"
                );
                tokio::time::sleep(delay).await;
                delay = policy.next_delay(delay);
            }
        }
    }

    unreachable!("retry loop always returns")
}
