use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

/// Decides whether a failed attempt is worth retrying.
type RetryPredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Retry behavior for one call site. Immutable; build one per call site
/// and share it freely (cloning is cheap).
#[derive(Clone)]
pub struct RetryPolicy {
    /// Number of retries after the first try. Worst case the operation
    /// runs `1 + attempts` times.
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    should_retry: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            should_retry: Arc::new(|_| true),
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Replace the retry predicate. Errors the predicate rejects are
    /// propagated immediately without sleeping.
    pub fn with_should_retry<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    fn retryable(&self, err: &anyhow::Error) -> bool {
        (self.should_retry)(err)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("attempts", &self.attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .finish()
    }
}

/// Why `with_retry` gave up. The underlying cause is always attached —
/// callers get the actual final error, never an aggregate.
#[derive(Debug)]
pub enum RetryError {
    /// The policy's predicate rejected the error; the operation ran once.
    NonRetryable(anyhow::Error),
    /// Every allowed attempt failed. `attempts` counts total invocations.
    Exhausted { attempts: u32, source: anyhow::Error },
}

impl fmt::Display for RetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::NonRetryable(err) => write!(f, "non-retryable error: {}", err),
            RetryError::Exhausted { attempts, source } => {
                write!(f, "failed after {} attempts: {}", attempts, source)
            }
        }
    }
}

impl std::error::Error for RetryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RetryError::NonRetryable(err) | RetryError::Exhausted { source: err, .. } => {
                Some(&**err)
            }
        }
    }
}

/// Exponential backoff delay for a zero-indexed retry attempt:
/// `min(max, initial * multiplier^attempt)`. Deterministic, no jitter.
/// Multipliers below 1.0 are treated as 1.0; delays never shrink below
/// `initial`.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration, multiplier: f64) -> Duration {
    let multiplier = if multiplier.is_finite() && multiplier > 1.0 {
        multiplier
    } else {
        1.0
    };
    let scaled = initial.as_secs_f64() * multiplier.powf(f64::from(attempt));
    if !scaled.is_finite() || scaled >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(scaled)
    }
}

/// Run `operation`, retrying per `policy` with exponential backoff.
///
/// A first-attempt success returns immediately and logs nothing. Each
/// retry logs a warn with the attempt number and the sleep it is about
/// to take.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !policy.retryable(&err) {
                    return Err(RetryError::NonRetryable(err));
                }
                if attempt >= policy.attempts {
                    return Err(RetryError::Exhausted {
                        attempts: policy.attempts + 1,
                        source: err,
                    });
                }
                let delay = backoff_delay(
                    attempt,
                    policy.initial_delay,
                    policy.max_delay,
                    policy.backoff_multiplier,
                );
                warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
