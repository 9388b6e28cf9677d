//! The narrow request-execution surface the rest of the application calls.
//!
//! A [`RequestExecutor`] ties the resiliency pieces together: every request
//! runs through the retry executor (optionally gated by a shared circuit
//! breaker) and registers a loading-tracker entry. Failed reads fall back to
//! the cache; transiently-failed writes are deferred into the offline queue
//! for replay.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::circuit_breaker::CircuitBreaker;
use crate::connectivity::{ConnectivityMonitor, SubscriptionId};
use crate::error::{ApiError, ApiErrorKind};
use crate::loading::{LoadingOptions, LoadingTracker, OperationKind};
use crate::queue::{OfflineQueue, OperationType, DEFAULT_CACHE_MAX_AGE};
use crate::retry::{execute_with_retry, RetryConfig};

/// Where a successful read's value came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// Fetched from the backend on this call.
    Fresh(Value),
    /// Served from the read cache after the backend call failed.
    Cached(Value),
}

impl ReadOutcome {
    pub fn into_value(self) -> Value {
        match self {
            Self::Fresh(value) | Self::Cached(value) => value,
        }
    }

    pub const fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }
}

/// How a write ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The mutation reached the backend; carries its response.
    Completed(Value),
    /// The mutation was deferred into the offline queue; carries the
    /// queued-operation id.
    Queued(String),
}

/// Orchestrates retry, circuit breaking, caching, offline queueing and
/// loading-state tracking for application requests.
///
/// One executor is constructed per application context at startup and handed
/// to the services that need it; there is no global instance.
pub struct RequestExecutor {
    retry: RetryConfig,
    breaker: Option<Arc<CircuitBreaker>>,
    queue: Arc<OfflineQueue>,
    tracker: LoadingTracker,
    cache_max_age: Duration,
    queue_writes: bool,
}

/// Builder for [`RequestExecutor`].
pub struct RequestExecutorBuilder {
    retry: RetryConfig,
    breaker: Option<Arc<CircuitBreaker>>,
    queue: Arc<OfflineQueue>,
    tracker: LoadingTracker,
    cache_max_age: Duration,
    queue_writes: bool,
}

impl RequestExecutorBuilder {
    pub fn new(queue: Arc<OfflineQueue>) -> Self {
        Self {
            retry: RetryConfig::default(),
            breaker: None,
            queue,
            tracker: LoadingTracker::new(),
            cache_max_age: DEFAULT_CACHE_MAX_AGE,
            queue_writes: true,
        }
    }

    /// Default retry policy merged into every request.
    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Gate every request through a shared circuit breaker.
    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Share a loading tracker with the rest of the application.
    pub fn tracker(mut self, tracker: LoadingTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Staleness bound applied to read fallbacks.
    pub fn cache_max_age(mut self, max_age: Duration) -> Self {
        self.cache_max_age = max_age;
        self
    }

    /// Enable or disable deferring failed writes into the offline queue.
    pub fn queue_writes(mut self, enabled: bool) -> Self {
        self.queue_writes = enabled;
        self
    }

    pub fn build(self) -> RequestExecutor {
        RequestExecutor {
            retry: self.retry,
            breaker: self.breaker,
            queue: self.queue,
            tracker: self.tracker,
            cache_max_age: self.cache_max_age,
            queue_writes: self.queue_writes,
        }
    }
}

impl RequestExecutor {
    pub fn builder(queue: Arc<OfflineQueue>) -> RequestExecutorBuilder {
        RequestExecutorBuilder::new(queue)
    }

    pub fn tracker(&self) -> &LoadingTracker {
        &self.tracker
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    /// Replay the offline queue whenever the monitor reports a transition
    /// back online.
    pub fn attach_connectivity(&self, monitor: &ConnectivityMonitor) -> SubscriptionId {
        let queue = Arc::clone(&self.queue);
        monitor.subscribe(Arc::new(move |online| {
            if !online {
                return;
            }
            let queue = Arc::clone(&queue);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(error) = queue.sync_queued_operations().await {
                            log::warn!("queue replay after reconnect failed: {error}");
                        }
                    });
                }
                Err(_) => {
                    log::debug!("no async runtime; reconnect replay not scheduled");
                }
            }
        }))
    }

    /// Execute a read with retry and cache fallback.
    ///
    /// A fresh result refreshes the cache under `cache_key`; a failed call
    /// falls back to a sufficiently fresh cached value before surfacing the
    /// error.
    pub async fn execute_read<F, Fut>(
        &self,
        cache_key: &str,
        description: &str,
        operation: F,
    ) -> Result<ReadOutcome, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, ApiError>>,
    {
        let request_id = uuid::Uuid::new_v4();
        let entry = self
            .tracker
            .start_operation(OperationKind::Api, description, LoadingOptions::default());
        log::debug!("[{request_id}] read '{description}' (cache key '{cache_key}')");

        match self.guarded(operation).await {
            Ok(value) => {
                if let Err(error) = self.queue.store_cached_value(cache_key, value.clone()) {
                    log::warn!("[{request_id}] failed to refresh cache '{cache_key}': {error}");
                }
                self.tracker.finish_operation(&entry, None);
                Ok(ReadOutcome::Fresh(value))
            }
            Err(error) => match self.queue.cached_value(cache_key, self.cache_max_age) {
                Ok(Some(value)) => {
                    log::warn!("[{request_id}] read failed ({error}); serving cached value");
                    self.tracker.finish_operation(&entry, None);
                    Ok(ReadOutcome::Cached(value))
                }
                Ok(None) => {
                    self.tracker.finish_operation(&entry, Some(&error.to_string()));
                    Err(error)
                }
                Err(cache_error) => {
                    log::warn!("[{request_id}] cache fallback failed: {cache_error}");
                    self.tracker.finish_operation(&entry, Some(&error.to_string()));
                    Err(error)
                }
            },
        }
    }

    /// Execute a mutation with retry; defer it into the offline queue when
    /// it fails transiently (or against an open circuit) and queueing is
    /// enabled.
    pub async fn execute_write<F, Fut>(
        &self,
        op_type: OperationType,
        table: &str,
        payload: Value,
        description: &str,
        operation: F,
    ) -> Result<WriteOutcome, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, ApiError>>,
    {
        let request_id = uuid::Uuid::new_v4();
        let entry = self
            .tracker
            .start_operation(OperationKind::Api, description, LoadingOptions::default());
        log::debug!("[{request_id}] {op_type} on '{table}'");

        match self.guarded(operation).await {
            Ok(value) => {
                self.tracker.finish_operation(&entry, None);
                Ok(WriteOutcome::Completed(value))
            }
            Err(error) => {
                if self.queue_writes && should_defer(&error) {
                    match self.queue.queue_operation(op_type, table, payload).await {
                        Ok(id) => {
                            log::info!(
                                "[{request_id}] {op_type} on '{table}' deferred to offline queue as '{id}' ({error})"
                            );
                            self.tracker.finish_operation(&entry, None);
                            return Ok(WriteOutcome::Queued(id));
                        }
                        Err(queue_error) => {
                            log::warn!("[{request_id}] failed to defer write: {queue_error}");
                        }
                    }
                }

                self.tracker.finish_operation(&entry, Some(&error.to_string()));
                Err(error)
            }
        }
    }

    async fn guarded<T, F, Fut>(&self, operation: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        match &self.breaker {
            Some(breaker) => {
                breaker
                    .call(|| execute_with_retry(operation, &self.retry))
                    .await
            }
            None => execute_with_retry(operation, &self.retry).await,
        }
    }
}

/// A failure worth replaying later: transient by classification, or rejected
/// by an open circuit without reaching the backend at all.
fn should_defer(error: &ApiError) -> bool {
    error.is_retryable() || error.kind() == ApiErrorKind::CircuitOpen
}
