//! Three-state failure-isolation gate for backend calls.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::ApiError;

/// Runtime circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before probing again.
    pub reset_timeout: Duration,
    /// Failure-count decay window: the count resets to zero once this much
    /// time passes without a failure.
    pub monitoring_period: Duration,
    /// Consecutive half-open successes required to close the circuit.
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(10),
            half_open_successes: 3,
        }
    }
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    half_open_successes: u32,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            half_open_successes: 0,
        }
    }
}

/// Thread-safe circuit breaker for wrapped backend operations.
///
/// All transitions are evaluated lazily at call time; there is no background
/// timer. An open circuit flips to half-open on the first call after
/// `reset_timeout`, and the failure count decays on the first call after a
/// quiet `monitoring_period`.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// Performs the lazy open-to-half-open transition and the sliding-window
    /// failure-count decay.
    pub fn allow_request(&self) -> bool {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");

        // Sliding-window decay, independent of the open/half-open logic.
        // Only the counter resets; an open circuit stays open until its
        // reset timeout.
        if let Some(last_failure_at) = inner.last_failure_at {
            if last_failure_at.elapsed() >= self.config.monitoring_period {
                inner.failure_count = 0;
            }
        }

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let can_probe = inner
                    .last_failure_at
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);

                if can_probe {
                    log::debug!("circuit half-open: allowing a probe call");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");

        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_successes = inner.half_open_successes.saturating_add(1);
                if inner.half_open_successes >= self.config.half_open_successes {
                    log::debug!(
                        "circuit closed after {} half-open success(es)",
                        inner.half_open_successes
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.last_failure_at = None;
                    inner.half_open_successes = 0;
                }
            }
            // A closed circuit does not change on success; the failure count
            // only decays through the monitoring window.
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");

        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(Instant::now());

        let reopened = inner.state == CircuitState::HalfOpen;
        if reopened || inner.failure_count >= self.config.failure_threshold {
            if inner.state != CircuitState::Open {
                log::warn!(
                    "circuit opened ({}; {} consecutive failure(s))",
                    if reopened { "half-open probe failed" } else { "failure threshold reached" },
                    inner.failure_count
                );
            }
            inner.state = CircuitState::Open;
            inner.half_open_successes = 0;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .expect("circuit breaker lock is not poisoned")
            .state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner
            .lock()
            .expect("circuit breaker lock is not poisoned")
            .failure_count
    }

    /// Run `operation` through the gate.
    ///
    /// When the circuit is open the operation is not invoked at all and a
    /// distinguishable circuit-open error is returned instead.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        if !self.allow_request() {
            return Err(ApiError::circuit_open());
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(error)
            }
        }
    }
}
