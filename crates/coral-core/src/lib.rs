//! # Coral Core
//!
//! Client resiliency core for the Coral CRM front end.
//!
//! ## Overview
//!
//! This crate provides the machinery a browser-style CRM client needs to
//! stay usable over an unreliable network:
//!
//! - **Retry execution** with capped exponential backoff and additive jitter
//! - **Circuit breaking** to stop hammering a failing backend
//! - **Offline queue** of deferred mutations, persisted locally and replayed
//!   when connectivity returns
//! - **Connectivity monitoring** with subscriber notification
//! - **Loading-state registry** the presentation layer subscribes to
//! - **Transport and backend helpers** translating HTTP semantics into
//!   structured, retry-classifiable errors
//!
//! Everything above the narrow request-execution interface (pages, forms,
//! routing, rendering) lives outside this crate and calls in through
//! [`RequestExecutor`].
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`backend`] | Hosted-backend request helpers and `{data, error}` shapes |
//! | [`circuit_breaker`] | Three-state failure-isolation gate |
//! | [`connectivity`] | Online/offline tracking and probing |
//! | [`error`] | Structured error surface |
//! | [`executor`] | Request orchestration: retry + breaker + cache + queue |
//! | [`http`] | HTTP transport seam |
//! | [`loading`] | In-flight operation registry for the UI |
//! | [`queue`] | Durable offline mutation queue and read cache |
//! | [`retry`] | Retry execution with backoff and jitter |
//! | [`throttle`] | Replay pacing for queue sync passes |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use coral_core::{
//!     ConnectivityMonitor, OfflineQueue, OfflineQueueConfig, RequestExecutor,
//! };
//! use coral_store::OfflineStore;
//!
//! # async fn run(handler: Arc<dyn coral_core::SyncHandler>) -> Result<(), Box<dyn std::error::Error>> {
//! let store = OfflineStore::open_default()?;
//! let monitor = Arc::new(ConnectivityMonitor::new(true));
//! let queue = Arc::new(OfflineQueue::new(
//!     store,
//!     handler,
//!     OfflineQueueConfig::default(),
//!     monitor.online_flag(),
//! )?);
//!
//! let executor = RequestExecutor::builder(queue).build();
//! executor.attach_connectivity(&monitor);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return `Result` types with structured errors:
//!
//! ```rust
//! use coral_core::{ApiError, ApiErrorKind};
//!
//! fn handle_error(error: ApiError) {
//!     match error.kind() {
//!         ApiErrorKind::CircuitOpen => {
//!             // The backend was never called; message accordingly.
//!         }
//!         ApiErrorKind::Http if error.status() == Some(429) => {
//!             // Rate limited; the retry executor already backed off.
//!         }
//!         _ => {}
//!     }
//! }
//! ```
//!
//! ## Concurrency
//!
//! Everything runs on the cooperative tokio event loop; nothing here spawns
//! OS threads. Retry attempts are strictly sequential, queue sync passes
//! drain a snapshot in enqueue order, and batch windows settle fully before
//! the next window starts.

pub mod backend;
pub mod circuit_breaker;
pub mod connectivity;
pub mod error;
pub mod executor;
pub mod http;
pub mod loading;
pub mod queue;
pub mod retry;
pub mod throttle;

// Re-export commonly used types at crate root for convenience

// Backend helpers
pub use backend::{BackendClient, BackendErrorBody, BackendResponse};

// Circuit breaker
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

// Connectivity
pub use connectivity::{
    ConnectivityListener, ConnectivityMonitor, ConnectivityProbe, HttpProbe, StaticProbe,
    SubscriptionId, DEFAULT_POLL_INTERVAL,
};

// Error types
pub use error::{ApiError, ApiErrorKind, QueueError, ValidationError};

// Request executor
pub use executor::{ReadOutcome, RequestExecutor, RequestExecutorBuilder, WriteOutcome};

// HTTP transport
pub use http::{
    HttpAuth, HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, NoopHttpClient,
    ReqwestHttpClient,
};

// Loading tracker
pub use loading::{
    BatchStep, LoadingEntry, LoadingOperation, LoadingOptions, LoadingState, LoadingTracker,
    OperationKind, Priority, ProgressReporter, TrackerListener, TrackerSubscription,
    DEFAULT_RETENTION, ERROR_GRACE_PERIOD,
};

// Offline queue
pub use queue::{
    OfflineQueue, OfflineQueueConfig, OperationType, QueuedOperation, SyncHandler, SyncReport,
    DEFAULT_CACHE_MAX_AGE, DEFAULT_MAX_QUEUE_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_SYNC_INTERVAL,
};

// Retry execution
pub use retry::{
    execute_backend_call, execute_batch, execute_cancellable, execute_with_retry,
    execute_with_timeout, Backoff, RetryConfig, RetryCondition, RetryHook,
    DEFAULT_BATCH_CONCURRENCY, MAX_JITTER,
};

// Replay throttle
pub use throttle::ReplayThrottle;

// Store (re-exported from coral-store)
pub use coral_store::{CacheRecord, OfflineStore, QueuedOperationRecord, StoreConfig, StoreError};
