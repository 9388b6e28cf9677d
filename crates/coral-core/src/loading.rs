//! Process-wide registry of in-flight operations for the presentation layer.
//!
//! Components register long-running work here so the UI can render spinners
//! and progress bars; the registry never influences retry or queue behavior.
//! Entries are mutated through progress/message updates, removed on
//! success-finish, and retained for a short grace period on error-finish so
//! the failure stays visible before it disappears.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::ApiError;

/// How long an error-finished entry stays visible before removal.
pub const ERROR_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Entries older than this are dropped by the periodic cleanup.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

/// Default period of the cleanup loop.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Category of tracked work, for UI grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Api,
    Database,
    File,
    Computation,
    Navigation,
    Custom,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Database => "database",
            Self::File => "file",
            Self::Computation => "computation",
            Self::Navigation => "navigation",
            Self::Custom => "custom",
        }
    }
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rendering priority of a tracked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// Presentation options for a tracked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadingOptions {
    pub priority: Priority,
    pub show_spinner: bool,
    pub show_progress: bool,
    pub allow_cancel: bool,
    pub timeout: Option<Duration>,
}

impl Default for LoadingOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Medium,
            show_spinner: true,
            show_progress: false,
            allow_cancel: false,
            timeout: None,
        }
    }
}

/// Immutable description of a tracked operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadingOperation {
    pub id: String,
    pub kind: OperationKind,
    pub description: String,
    pub priority: Priority,
    pub show_spinner: bool,
    pub show_progress: bool,
    pub allow_cancel: bool,
    pub timeout: Option<Duration>,
}

/// Mutable state of a tracked operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadingState {
    pub is_loading: bool,
    pub message: Option<String>,
    /// Percent complete, 0–100.
    pub progress: Option<u8>,
    pub error: Option<String>,
    pub started_at: Instant,
}

/// Snapshot handed to subscribers and returned from lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadingEntry {
    pub operation: LoadingOperation,
    pub state: LoadingState,
}

/// Callback receiving the full registry snapshot on every change.
pub type TrackerListener = Arc<dyn Fn(&[LoadingEntry]) + Send + Sync>;

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackerSubscription(u64);

struct TrackerInner {
    entries: Vec<LoadingEntry>,
    global_message: Option<String>,
    listeners: HashMap<u64, TrackerListener>,
    next_subscription: u64,
}

/// Process-wide loading-state registry.
///
/// Cheap to clone; clones share the same registry. Scoped to the process
/// session: there is no persistence, a restart begins empty.
#[derive(Clone)]
pub struct LoadingTracker {
    inner: Arc<Mutex<TrackerInner>>,
}

impl Default for LoadingTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadingTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TrackerInner {
                entries: Vec::new(),
                global_message: None,
                listeners: HashMap::new(),
                next_subscription: 1,
            })),
        }
    }

    /// Register a new in-flight operation and return its id.
    ///
    /// When a timeout is set, the entry automatically error-finishes with
    /// "Operation timed out" unless it finishes earlier.
    pub fn start_operation(
        &self,
        kind: OperationKind,
        description: impl Into<String>,
        options: LoadingOptions,
    ) -> String {
        let id = entry_id();
        let entry = LoadingEntry {
            operation: LoadingOperation {
                id: id.clone(),
                kind,
                description: description.into(),
                priority: options.priority,
                show_spinner: options.show_spinner,
                show_progress: options.show_progress,
                allow_cancel: options.allow_cancel,
                timeout: options.timeout,
            },
            state: LoadingState {
                is_loading: true,
                message: None,
                progress: if options.show_progress { Some(0) } else { None },
                error: None,
                started_at: Instant::now(),
            },
        };

        {
            let mut inner = self.inner.lock().expect("loading tracker lock poisoned");
            inner.entries.push(entry);
        }
        self.notify();

        if let Some(timeout) = options.timeout {
            let tracker = self.clone();
            let timed_out_id = id.clone();
            spawn_if_runtime(&id, async move {
                tokio::time::sleep(timeout).await;
                tracker.finish_operation(&timed_out_id, Some("Operation timed out"));
            });
        }

        id
    }

    /// Update progress (clamped to 0–100) and optionally the message.
    /// Unknown ids are a no-op: the operation already finished or was
    /// cancelled.
    pub fn update_progress(&self, id: &str, progress: u8, message: Option<&str>) {
        let changed = {
            let mut inner = self.inner.lock().expect("loading tracker lock poisoned");
            match inner.entries.iter_mut().find(|entry| entry.operation.id == id) {
                Some(entry) => {
                    entry.state.progress = Some(progress.min(100));
                    if let Some(message) = message {
                        entry.state.message = Some(message.to_owned());
                    }
                    true
                }
                None => false,
            }
        };

        if changed {
            self.notify();
        }
    }

    /// Update the message of a tracked operation. Unknown ids are a no-op.
    pub fn update_message(&self, id: &str, message: &str) {
        let changed = {
            let mut inner = self.inner.lock().expect("loading tracker lock poisoned");
            match inner.entries.iter_mut().find(|entry| entry.operation.id == id) {
                Some(entry) => {
                    entry.state.message = Some(message.to_owned());
                    true
                }
                None => false,
            }
        };

        if changed {
            self.notify();
        }
    }

    /// Finish an operation.
    ///
    /// A success-finish removes the entry immediately. An error-finish marks
    /// the entry failed and keeps it visible for [`ERROR_GRACE_PERIOD`]
    /// before removal. Returns whether the entry existed.
    pub fn finish_operation(&self, id: &str, error: Option<&str>) -> bool {
        match error {
            None => self.remove_entry(id),
            Some(error) => {
                let marked = {
                    let mut inner = self.inner.lock().expect("loading tracker lock poisoned");
                    match inner.entries.iter_mut().find(|entry| entry.operation.id == id) {
                        Some(entry) => {
                            entry.state.is_loading = false;
                            entry.state.error = Some(error.to_owned());
                            true
                        }
                        None => false,
                    }
                };

                if marked {
                    self.notify();
                    let tracker = self.clone();
                    let grace_id = id.to_owned();
                    spawn_if_runtime(id, async move {
                        tokio::time::sleep(ERROR_GRACE_PERIOD).await;
                        tracker.remove_entry(&grace_id);
                    });
                }
                marked
            }
        }
    }

    /// Remove an entry immediately regardless of state. Returns whether it
    /// existed. The underlying asynchronous work, if any, keeps running;
    /// only the tracking record goes away.
    pub fn cancel_operation(&self, id: &str) -> bool {
        self.remove_entry(id)
    }

    /// Snapshot of every tracked entry.
    pub fn loading_operations(&self) -> Vec<LoadingEntry> {
        self.inner
            .lock()
            .expect("loading tracker lock poisoned")
            .entries
            .clone()
    }

    /// Lookup of a single entry.
    pub fn operation(&self, id: &str) -> Option<LoadingEntry> {
        self.inner
            .lock()
            .expect("loading tracker lock poisoned")
            .entries
            .iter()
            .find(|entry| entry.operation.id == id)
            .cloned()
    }

    /// Whether anything is tracked right now, derived from registry
    /// non-emptiness.
    pub fn is_any_loading(&self) -> bool {
        !self
            .inner
            .lock()
            .expect("loading tracker lock poisoned")
            .entries
            .is_empty()
    }

    /// Message shown independently of any individual operation.
    pub fn global_message(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("loading tracker lock poisoned")
            .global_message
            .clone()
    }

    pub fn set_global_message(&self, message: Option<String>) {
        {
            let mut inner = self.inner.lock().expect("loading tracker lock poisoned");
            inner.global_message = message;
        }
        self.notify();
    }

    /// Subscribe to registry changes. The listener receives a snapshot of
    /// every entry after each mutation.
    pub fn subscribe(&self, listener: TrackerListener) -> TrackerSubscription {
        let mut inner = self.inner.lock().expect("loading tracker lock poisoned");
        let id = inner.next_subscription;
        inner.next_subscription += 1;
        inner.listeners.insert(id, listener);
        TrackerSubscription(id)
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, subscription: TrackerSubscription) -> bool {
        self.inner
            .lock()
            .expect("loading tracker lock poisoned")
            .listeners
            .remove(&subscription.0)
            .is_some()
    }

    /// Track `operation` for its full lifetime: start, await, finish.
    /// Errors are recorded on the entry and rethrown.
    pub async fn with_loading<T, Fut>(
        &self,
        kind: OperationKind,
        description: impl Into<String>,
        operation: Fut,
    ) -> Result<T, ApiError>
    where
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let id = self.start_operation(kind, description, LoadingOptions::default());
        match operation.await {
            Ok(value) => {
                self.finish_operation(&id, None);
                Ok(value)
            }
            Err(error) => {
                self.finish_operation(&id, Some(&error.to_string()));
                Err(error)
            }
        }
    }

    /// Like [`with_loading`](Self::with_loading), handing the operation a
    /// progress reporter wired to its entry.
    pub async fn with_progress_tracking<T, F, Fut>(
        &self,
        kind: OperationKind,
        description: impl Into<String>,
        operation: F,
    ) -> Result<T, ApiError>
    where
        F: FnOnce(ProgressReporter) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let id = self.start_operation(
            kind,
            description,
            LoadingOptions {
                show_progress: true,
                ..LoadingOptions::default()
            },
        );
        let reporter = ProgressReporter {
            tracker: self.clone(),
            id: id.clone(),
        };

        match operation(reporter).await {
            Ok(value) => {
                self.finish_operation(&id, None);
                Ok(value)
            }
            Err(error) => {
                self.finish_operation(&id, Some(&error.to_string()));
                Err(error)
            }
        }
    }

    /// Run a weighted sequence of sub-operations under one entry, advancing
    /// aggregate progress proportionally to each step's declared weight as it
    /// completes. Zero-weight sequences progress in equal shares.
    pub async fn with_batch_loading<T>(
        &self,
        kind: OperationKind,
        description: impl Into<String>,
        steps: Vec<BatchStep<T>>,
    ) -> Result<Vec<T>, ApiError> {
        let id = self.start_operation(
            kind,
            description,
            LoadingOptions {
                show_progress: true,
                ..LoadingOptions::default()
            },
        );

        let uniform = steps.iter().map(|step| u64::from(step.weight)).sum::<u64>() == 0;
        let total: u64 = if uniform {
            steps.len() as u64
        } else {
            steps.iter().map(|step| u64::from(step.weight)).sum()
        };

        let mut completed: u64 = 0;
        let mut results = Vec::with_capacity(steps.len());

        for step in steps {
            match step.operation.await {
                Ok(value) => {
                    completed += if uniform { 1 } else { u64::from(step.weight) };
                    let progress = if total == 0 {
                        100
                    } else {
                        ((completed * 100) / total) as u8
                    };
                    self.update_progress(&id, progress, step.label.as_deref());
                    results.push(value);
                }
                Err(error) => {
                    self.finish_operation(&id, Some(&error.to_string()));
                    return Err(error);
                }
            }
        }

        self.finish_operation(&id, None);
        Ok(results)
    }

    /// Drop entries started longer ago than `retention`. Returns how many
    /// were removed.
    pub fn cleanup_stale(&self, retention: Duration) -> usize {
        let removed = {
            let mut inner = self.inner.lock().expect("loading tracker lock poisoned");
            let before = inner.entries.len();
            inner.entries.retain(|entry| {
                let stale = entry.state.started_at.elapsed() >= retention;
                if stale && entry.state.is_loading {
                    log::warn!(
                        "dropping stale loading entry '{}' ({}) still marked in flight",
                        entry.operation.id,
                        entry.operation.description
                    );
                }
                !stale
            });
            before - inner.entries.len()
        };

        if removed > 0 {
            self.notify();
        }
        removed
    }

    /// Run [`cleanup_stale`](Self::cleanup_stale) every `interval`.
    pub fn spawn_cleanup(
        &self,
        interval: Duration,
        retention: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracker.cleanup_stale(retention);
            }
        })
    }

    fn remove_entry(&self, id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().expect("loading tracker lock poisoned");
            let before = inner.entries.len();
            inner.entries.retain(|entry| entry.operation.id != id);
            before != inner.entries.len()
        };

        if removed {
            self.notify();
        }
        removed
    }

    fn notify(&self) {
        let (snapshot, listeners) = {
            let inner = self.inner.lock().expect("loading tracker lock poisoned");
            (
                inner.entries.clone(),
                inner.listeners.values().cloned().collect::<Vec<_>>(),
            )
        };

        for listener in listeners {
            listener(&snapshot);
        }
    }
}

/// Progress callback handed to operations run through
/// [`LoadingTracker::with_progress_tracking`].
#[derive(Clone)]
pub struct ProgressReporter {
    tracker: LoadingTracker,
    id: String,
}

impl ProgressReporter {
    pub fn report(&self, progress: u8, message: Option<&str>) {
        self.tracker.update_progress(&self.id, progress, message);
    }
}

/// One weighted sub-operation of a batch.
pub struct BatchStep<T> {
    weight: u32,
    label: Option<String>,
    operation: Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send>>,
}

impl<T> BatchStep<T> {
    pub fn new(
        weight: u32,
        operation: impl Future<Output = Result<T, ApiError>> + Send + 'static,
    ) -> Self {
        Self {
            weight,
            label: None,
            operation: Box::pin(operation),
        }
    }

    /// Message shown when this step completes.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Timers degrade to no-ops outside an async runtime so synchronous callers
/// can still register entries.
fn spawn_if_runtime<F>(id: &str, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => {
            log::debug!("no async runtime; timer for loading entry '{id}' not armed");
        }
    }
}

fn entry_id() -> String {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64);
    format!("{now_ms}-{:08x}", fastrand::u32(..))
}
