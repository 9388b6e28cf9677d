//! Retry execution with exponential backoff and jitter.
//!
//! [`execute_with_retry`] is the base primitive: it runs an async operation
//! up to `max_retries + 1` times, waiting out a capped exponential backoff
//! (plus additive jitter) between attempts. The other entry points layer one
//! concern each on top: a per-attempt deadline, an external abort signal,
//! backend-shaped `{data, error}` responses, and windowed batch execution.

use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backend::BackendResponse;
use crate::error::{ApiError, ValidationError};

/// Upper bound of the random jitter added to every computed backoff delay.
pub const MAX_JITTER: Duration = Duration::from_millis(1_000);

/// Default window size for [`execute_batch`].
pub const DEFAULT_BATCH_CONCURRENCY: usize = 5;

/// Backoff strategy for retrying failed requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Uses a fixed delay between retries.
    Fixed {
        /// Delay between retries.
        delay: Duration,
    },
    /// Uses an exponential delay between retries.
    ///
    /// The delay is calculated as `base * (factor ^ attempt)`, capped at `max`.
    Exponential {
        /// The initial backoff duration.
        base: Duration,
        /// The multiplicative factor for each subsequent retry.
        factor: f64,
        /// The maximum duration to wait between retries.
        max: Duration,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Calculate the delay for a given retry attempt (0-based, per retry).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential { base, factor, max } => {
                let scale = factor.powi(attempt as i32);
                let seconds = base.as_secs_f64() * scale;
                let capped_seconds = seconds.min(max.as_secs_f64());
                Duration::from_secs_f64(capped_seconds)
            }
        }
    }

    /// The computed delay plus a uniform random jitter in `0..=MAX_JITTER`.
    ///
    /// Jitter only ever adds: the result is never below [`Backoff::delay`].
    pub fn delay_with_jitter(self, attempt: u32) -> Duration {
        let jitter = Duration::from_millis(fastrand::u64(0..=MAX_JITTER.as_millis() as u64));
        self.delay(attempt) + jitter
    }
}

/// Caller-supplied predicate deciding whether a failure should be retried.
pub type RetryCondition = Arc<dyn Fn(&ApiError) -> bool + Send + Sync>;

/// Caller-supplied hook observing each scheduled retry.
///
/// Receives the 1-based count of retries issued so far and the error that
/// triggered the retry; invoked synchronously before the backoff wait.
pub type RetryHook = Arc<dyn Fn(u32, &ApiError) + Send + Sync>;

/// Configuration for the automatic retry mechanism.
///
/// Immutable per call; services merge their defaults into one of these and
/// hand it to the executor.
#[derive(Clone)]
pub struct RetryConfig {
    /// Enables or disables the retry mechanism.
    pub enabled: bool,
    /// The maximum number of retries to attempt.
    /// Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// The backoff strategy to use between retries.
    pub backoff: Backoff,
    /// Overrides the default retry classification when set.
    pub retry_condition: Option<RetryCondition>,
    /// Observes each scheduled retry.
    pub on_retry: Option<RetryHook>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            backoff: Backoff::default(),
            retry_condition: None,
            on_retry: None,
        }
    }
}

impl Debug for RetryConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("enabled", &self.enabled)
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("retry_condition", &self.retry_condition.as_ref().map(|_| "<fn>"))
            .field("on_retry", &self.on_retry.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl RetryConfig {
    /// Create a new retry configuration with exponential backoff.
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Create a new retry configuration with fixed backoff.
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed { delay },
            ..Self::default()
        }
    }

    /// Disable retries.
    pub fn no_retry() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Replace the retry classification.
    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.retry_condition = Some(condition);
        self
    }

    /// Attach a retry observer.
    pub fn with_retry_hook(mut self, hook: RetryHook) -> Self {
        self.on_retry = Some(hook);
        self
    }

    /// Whether the given failure should be retried under this configuration.
    pub fn should_retry(&self, error: &ApiError) -> bool {
        match &self.retry_condition {
            Some(condition) => condition(error),
            None => error.is_retryable(),
        }
    }
}

/// Run `operation` with bounded retries.
///
/// The operation is attempted up to `max_retries + 1` times. The error from
/// the final attempt is propagated unmodified; an error the configured
/// condition declines is propagated immediately with no further attempts.
pub async fn execute_with_retry<T, F, Fut>(
    mut operation: F,
    config: &RetryConfig,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let budget = if config.enabled { config.max_retries } else { 0 };
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= budget || !config.should_retry(&error) {
                    return Err(error);
                }

                let retry_number = attempt + 1;
                if let Some(hook) = &config.on_retry {
                    hook(retry_number, &error);
                }

                let delay = config.backoff.delay_with_jitter(attempt);
                log::debug!(
                    "retry {retry_number}/{budget} in {}ms after: {error}",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt = retry_number;
            }
        }
    }
}

/// Run `operation` with retries, racing every attempt against `timeout`.
///
/// An attempt that outlives the deadline fails with a timeout error, which is
/// subject to the same retry policy as any other failure.
pub async fn execute_with_timeout<T, F, Fut>(
    mut operation: F,
    config: &RetryConfig,
    timeout: Duration,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    execute_with_retry(
        || {
            let attempt = operation();
            async move {
                match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(ApiError::timeout(format!(
                        "operation timed out after {}ms",
                        timeout.as_millis()
                    ))),
                }
            }
        },
        config,
    )
    .await
}

/// Run `operation` with retries under an external abort signal.
///
/// Triggering the token aborts whatever the retry loop is doing (an in-flight
/// attempt or a backoff wait) and surfaces a cancellation error, which the
/// default condition does not retry.
pub async fn execute_cancellable<T, F, Fut>(
    operation: F,
    config: &RetryConfig,
    abort: &CancellationToken,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    tokio::select! {
        _ = abort.cancelled() => Err(ApiError::cancelled()),
        result = execute_with_retry(operation, config) => result,
    }
}

/// Run a backend-shaped operation (`{data, error}` rather than `Result`) with
/// retries.
///
/// A non-null `error` member is converted to an [`ApiError`] and retried per
/// policy; a null `data` with no error is a non-retryable no-data failure.
pub async fn execute_backend_call<T, F, Fut>(
    mut operation: F,
    config: &RetryConfig,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResponse<T>>,
{
    execute_with_retry(
        || {
            let attempt = operation();
            async move {
                let response = attempt.await;
                if let Some(body) = response.error {
                    return Err(body.into_api_error());
                }
                match response.data {
                    Some(data) => Ok(data),
                    None => Err(ApiError::no_data()),
                }
            }
        },
        config,
    )
    .await
}

/// Run many independent operations, each with its own retry loop, in
/// fixed-size concurrent windows.
///
/// A window fully settles before the next one starts; operations inside a
/// window run in parallel with no ordering among them. Results come back in
/// input order.
pub async fn execute_batch<T, F, Fut>(
    operations: Vec<F>,
    config: &RetryConfig,
    concurrency: usize,
) -> Result<Vec<Result<T, ApiError>>, ValidationError>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send,
{
    if concurrency == 0 {
        return Err(ValidationError::ZeroBatchConcurrency);
    }

    let mut results = Vec::with_capacity(operations.len());
    let mut remaining = operations.into_iter();

    loop {
        let window: Vec<F> = remaining.by_ref().take(concurrency).collect();
        if window.is_empty() {
            break;
        }

        let handles: Vec<_> = window
            .into_iter()
            .map(|mut operation| {
                let config = config.clone();
                tokio::spawn(async move { execute_with_retry(|| operation(), &config).await })
            })
            .collect();

        for handle in handles {
            let result = handle.await.unwrap_or_else(|join_error| {
                Err(ApiError::internal(format!("batch operation panicked: {join_error}")))
            });
            results.push(result);
        }
    }

    Ok(results)
}
