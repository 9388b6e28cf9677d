//! Durable offline queue for failed mutations, with replay bookkeeping and a
//! read-fallback cache.
//!
//! The queue owns its operations exclusively: callers enqueue through
//! [`OfflineQueue::queue_operation`] and everything else (trimming,
//! persistence, retry counting, dropping exhausted items) happens inside a
//! sync pass. The actual transport call per item is an external collaborator
//! behind the [`SyncHandler`] seam; the queue never speaks HTTP itself.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use coral_store::{CacheRecord, OfflineStore, QueuedOperationRecord};

use crate::error::{ApiError, QueueError, ValidationError};
use crate::throttle::ReplayThrottle;

/// Oldest entries are dropped beyond this many queued operations.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1_000;

/// Default replay attempts before an operation is dropped as failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default staleness bound for the read-fallback cache.
pub const DEFAULT_CACHE_MAX_AGE: Duration = Duration::from_secs(3_600);

/// Default period of the background sync loop.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Kind of mutation deferred for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deferred mutation waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: String,
    pub op_type: OperationType,
    pub table: String,
    pub payload: Value,
    pub enqueued_at_ms: i64,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl QueuedOperation {
    fn to_record(&self) -> QueuedOperationRecord {
        QueuedOperationRecord {
            id: self.id.clone(),
            op_type: self.op_type.as_str().to_owned(),
            target_table: self.table.clone(),
            payload: self.payload.clone(),
            enqueued_at_ms: self.enqueued_at_ms,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
        }
    }

    fn from_record(record: QueuedOperationRecord) -> Option<Self> {
        let Some(op_type) = OperationType::parse(&record.op_type) else {
            log::warn!(
                "dropping queued operation '{}' with unknown type '{}'",
                record.id,
                record.op_type
            );
            return None;
        };

        Some(Self {
            id: record.id,
            op_type,
            table: record.target_table,
            payload: record.payload,
            enqueued_at_ms: record.enqueued_at_ms,
            retry_count: record.retry_count,
            max_retries: record.max_retries,
        })
    }
}

/// Per-item transport used to replay a queued operation.
///
/// Supplied by the caller (typically a table-specific service); the queue
/// only manages enqueue/dequeue/retry bookkeeping.
pub trait SyncHandler: Send + Sync {
    fn sync<'a>(
        &'a self,
        operation: &'a QueuedOperation,
    ) -> Pin<Box<dyn Future<Output = Result<(), ApiError>> + Send + 'a>>;
}

/// Aggregate outcome of one sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// True when nothing in the pass failed.
    pub success: bool,
    /// Operations replayed and removed from the queue.
    pub processed: u32,
    /// Operations dropped after exhausting their retry budget.
    pub failed: u32,
    /// Per-item failure messages observed during the pass.
    pub errors: Vec<String>,
}

impl SyncReport {
    fn noop() -> Self {
        Self {
            success: true,
            processed: 0,
            failed: 0,
            errors: Vec::new(),
        }
    }
}

/// Queue sizing and retry budget.
#[derive(Debug, Clone, Copy)]
pub struct OfflineQueueConfig {
    pub max_queue_size: usize,
    pub max_retries: u32,
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Durable FIFO-ish queue of pending mutations plus the read-fallback cache.
pub struct OfflineQueue {
    config: OfflineQueueConfig,
    store: OfflineStore,
    handler: Arc<dyn SyncHandler>,
    online: Arc<AtomicBool>,
    pending: Mutex<VecDeque<QueuedOperation>>,
    sync_lock: tokio::sync::Mutex<()>,
    throttle: Option<ReplayThrottle>,
}

impl OfflineQueue {
    /// Build a queue over the given store, hydrating any persisted backlog.
    pub fn new(
        store: OfflineStore,
        handler: Arc<dyn SyncHandler>,
        config: OfflineQueueConfig,
        online: Arc<AtomicBool>,
    ) -> Result<Self, QueueError> {
        let pending = store
            .load_queue()?
            .into_iter()
            .filter_map(QueuedOperation::from_record)
            .collect::<VecDeque<_>>();

        if !pending.is_empty() {
            log::info!("hydrated {} queued operation(s) from the offline store", pending.len());
        }

        Ok(Self {
            config,
            store,
            handler,
            online,
            pending: Mutex::new(pending),
            sync_lock: tokio::sync::Mutex::new(()),
            throttle: None,
        })
    }

    /// Pace replay through the given throttle.
    pub fn with_throttle(mut self, throttle: ReplayThrottle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Append a failed mutation for later replay.
    ///
    /// Trims the oldest entries beyond the configured maximum, persists the
    /// full queue, and — when currently online — immediately attempts a sync
    /// pass. The pass outcome does not affect the returned id.
    pub async fn queue_operation(
        &self,
        op_type: OperationType,
        table: &str,
        payload: Value,
    ) -> Result<String, QueueError> {
        if table.trim().is_empty() {
            return Err(ValidationError::EmptyTableName.into());
        }

        let operation = QueuedOperation {
            id: operation_id(),
            op_type,
            table: table.to_owned(),
            payload,
            enqueued_at_ms: now_ms(),
            retry_count: 0,
            max_retries: self.config.max_retries,
        };
        let id = operation.id.clone();

        let snapshot = {
            let mut pending = self.pending.lock().expect("pending queue lock poisoned");
            pending.push_back(operation);
            while pending.len() > self.config.max_queue_size {
                if let Some(dropped) = pending.pop_front() {
                    log::warn!("offline queue full; dropping oldest operation '{}'", dropped.id);
                }
            }
            records_of(&pending)
        };
        self.store.replace_queue(&snapshot)?;

        log::debug!("queued {} on '{}' as '{}'", op_type, table, id);

        if self.is_online() {
            if let Err(error) = self.sync_queued_operations().await {
                log::warn!("sync pass after enqueue failed: {error}");
            }
        }

        Ok(id)
    }

    /// Replay the queued operations in enqueue order.
    ///
    /// A no-op success while offline or with an empty queue. Per-item
    /// failures are counted, never thrown: an item that fails keeps its place
    /// for the next pass until its retry budget runs out, at which point it
    /// is dropped and tallied as failed.
    pub async fn sync_queued_operations(&self) -> Result<SyncReport, QueueError> {
        let _pass = self.sync_lock.lock().await;

        if !self.is_online() {
            return Ok(SyncReport::noop());
        }

        let snapshot: Vec<QueuedOperation> = {
            let pending = self.pending.lock().expect("pending queue lock poisoned");
            pending.iter().cloned().collect()
        };
        if snapshot.is_empty() {
            return Ok(SyncReport::noop());
        }

        let mut report = SyncReport::noop();

        for operation in &snapshot {
            if let Some(throttle) = &self.throttle {
                while let Err(delay) = throttle.acquire() {
                    tokio::time::sleep(delay).await;
                }
            }

            match self.handler.sync(operation).await {
                Ok(()) => {
                    self.remove_pending(&operation.id);
                    report.processed += 1;
                }
                Err(error) => {
                    report.errors.push(format!("{}: {error}", operation.id));
                    if self.record_failed_attempt(&operation.id) {
                        report.failed += 1;
                        log::warn!(
                            "dropping operation '{}' after {} failed sync attempt(s): {error}",
                            operation.id,
                            operation.retry_count + 1
                        );
                    }
                }
            }
        }

        let remaining = {
            let pending = self.pending.lock().expect("pending queue lock poisoned");
            records_of(&pending)
        };
        self.store.replace_queue(&remaining)?;

        report.success = report.errors.is_empty();
        log::debug!(
            "sync pass finished: {} processed, {} dropped, {} still queued",
            report.processed,
            report.failed,
            remaining.len()
        );

        Ok(report)
    }

    /// Run [`sync_queued_operations`](Self::sync_queued_operations)
    /// periodically while online and the queue is non-empty.
    pub fn spawn_background_sync(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let queue = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if queue.is_online() && queue.queued_operations_count() > 0 {
                    if let Err(error) = queue.sync_queued_operations().await {
                        log::warn!("background sync pass failed: {error}");
                    }
                }
            }
        })
    }

    /// Snapshot of the queued operations in replay order.
    pub fn queued_operations(&self) -> Vec<QueuedOperation> {
        self.pending
            .lock()
            .expect("pending queue lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn queued_operations_count(&self) -> usize {
        self.pending.lock().expect("pending queue lock poisoned").len()
    }

    /// Drop every queued operation, in memory and in the store.
    pub fn clear_queue(&self) -> Result<(), QueueError> {
        self.pending.lock().expect("pending queue lock poisoned").clear();
        self.store.replace_queue(&[])?;
        Ok(())
    }

    /// Read-fallback lookup. An entry older than `max_age` is evicted and
    /// reported as a miss.
    pub fn cached_value(&self, key: &str, max_age: Duration) -> Result<Option<Value>, QueueError> {
        if key.trim().is_empty() {
            return Err(ValidationError::EmptyCacheKey.into());
        }

        let Some(record) = self.store.cache_get(key)? else {
            return Ok(None);
        };

        let age_ms = now_ms().saturating_sub(record.cached_at_ms);
        if age_ms > max_age.as_millis() as i64 {
            log::debug!("cache entry '{key}' is {age_ms}ms old; evicting");
            self.store.cache_delete(key)?;
            return Ok(None);
        }

        Ok(Some(record.data))
    }

    /// Store an opaque payload for later read fallback.
    pub fn store_cached_value(&self, key: &str, value: Value) -> Result<(), QueueError> {
        if key.trim().is_empty() {
            return Err(ValidationError::EmptyCacheKey.into());
        }

        self.store.cache_put(&CacheRecord {
            cache_key: key.to_owned(),
            data: value,
            cached_at_ms: now_ms(),
        })?;
        Ok(())
    }

    fn remove_pending(&self, id: &str) {
        let mut pending = self.pending.lock().expect("pending queue lock poisoned");
        pending.retain(|operation| operation.id != id);
    }

    /// Count a failed replay attempt. Returns true when the operation
    /// exhausted its budget and was dropped.
    fn record_failed_attempt(&self, id: &str) -> bool {
        let mut pending = self.pending.lock().expect("pending queue lock poisoned");
        let Some(index) = pending.iter().position(|operation| operation.id == id) else {
            return false;
        };

        let operation = &mut pending[index];
        operation.retry_count = operation.retry_count.saturating_add(1);
        if operation.retry_count >= operation.max_retries {
            pending.remove(index);
            true
        } else {
            false
        }
    }
}

fn records_of(pending: &VecDeque<QueuedOperation>) -> Vec<QueuedOperationRecord> {
    pending.iter().map(QueuedOperation::to_record).collect()
}

fn operation_id() -> String {
    format!("{}-{:08x}", now_ms(), fastrand::u32(..))
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coral_store::StoreConfig;
    use serde_json::json;
    use tempfile::tempdir;

    /// Scripted per-item transport: fails each item a configured number of
    /// times before succeeding, recording call order.
    struct ScriptedHandler {
        failures_per_item: usize,
        attempts: Mutex<std::collections::HashMap<String, usize>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedHandler {
        fn succeeding() -> Self {
            Self::failing_first(0)
        }

        fn failing_first(failures_per_item: usize) -> Self {
            Self {
                failures_per_item,
                attempts: Mutex::new(std::collections::HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_order(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    impl SyncHandler for ScriptedHandler {
        fn sync<'a>(
            &'a self,
            operation: &'a QueuedOperation,
        ) -> Pin<Box<dyn Future<Output = Result<(), ApiError>> + Send + 'a>> {
            let seen = {
                let mut attempts = self.attempts.lock().expect("attempts lock");
                let seen = attempts.entry(operation.id.clone()).or_insert(0);
                *seen += 1;
                *seen
            };
            self.calls
                .lock()
                .expect("calls lock")
                .push(format!("{}:{}", operation.table, operation.op_type));

            let fail = seen <= self.failures_per_item;
            Box::pin(async move {
                if fail {
                    Err(ApiError::network("backend unreachable"))
                } else {
                    Ok(())
                }
            })
        }
    }

    fn temp_store(dir: &tempfile::TempDir) -> OfflineStore {
        OfflineStore::open(StoreConfig {
            coral_home: dir.path().to_path_buf(),
            db_path: dir.path().join("coral.duckdb"),
            max_pool_size: 2,
        })
        .expect("store should open")
    }

    fn queue_with(
        store: OfflineStore,
        handler: Arc<dyn SyncHandler>,
        online: bool,
        config: OfflineQueueConfig,
    ) -> OfflineQueue {
        OfflineQueue::new(store, handler, config, Arc::new(AtomicBool::new(online)))
            .expect("queue should build")
    }

    #[tokio::test]
    async fn enqueue_while_offline_grows_the_queue() {
        let dir = tempdir().expect("tempdir");
        let queue = queue_with(
            temp_store(&dir),
            Arc::new(ScriptedHandler::succeeding()),
            false,
            OfflineQueueConfig::default(),
        );

        queue
            .queue_operation(OperationType::Create, "customers", json!({"name": "Acme"}))
            .await
            .expect("enqueue");

        assert_eq!(queue.queued_operations_count(), 1);
    }

    #[tokio::test]
    async fn successful_sync_drains_the_queue_in_order() {
        let dir = tempdir().expect("tempdir");
        let handler = Arc::new(ScriptedHandler::succeeding());
        let online = Arc::new(AtomicBool::new(false));
        let queue = OfflineQueue::new(
            temp_store(&dir),
            handler.clone(),
            OfflineQueueConfig::default(),
            online.clone(),
        )
        .expect("queue should build");

        queue
            .queue_operation(OperationType::Create, "customers", json!({"n": 1}))
            .await
            .expect("enqueue");
        queue
            .queue_operation(OperationType::Update, "deals", json!({"n": 2}))
            .await
            .expect("enqueue");
        queue
            .queue_operation(OperationType::Delete, "leads", json!({"n": 3}))
            .await
            .expect("enqueue");

        online.store(true, Ordering::SeqCst);
        let report = queue.sync_queued_operations().await.expect("sync");

        assert!(report.success);
        assert_eq!(report.processed, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(queue.queued_operations_count(), 0);
        assert_eq!(
            handler.call_order(),
            vec!["customers:create", "deals:update", "leads:delete"]
        );
    }

    #[tokio::test]
    async fn sync_while_offline_is_a_noop_success() {
        let dir = tempdir().expect("tempdir");
        let queue = queue_with(
            temp_store(&dir),
            Arc::new(ScriptedHandler::succeeding()),
            false,
            OfflineQueueConfig::default(),
        );

        queue
            .queue_operation(OperationType::Create, "customers", json!({}))
            .await
            .expect("enqueue");

        let report = queue.sync_queued_operations().await.expect("sync");
        assert!(report.success);
        assert_eq!(report.processed, 0);
        assert_eq!(queue.queued_operations_count(), 1);
    }

    #[tokio::test]
    async fn failing_item_is_dropped_after_exhausting_its_retry_budget() {
        let dir = tempdir().expect("tempdir");
        let handler = Arc::new(ScriptedHandler::failing_first(usize::MAX));
        let online = Arc::new(AtomicBool::new(false));
        let queue = OfflineQueue::new(
            temp_store(&dir),
            handler,
            OfflineQueueConfig {
                max_queue_size: 10,
                max_retries: 3,
            },
            online.clone(),
        )
        .expect("queue should build");

        queue
            .queue_operation(OperationType::Create, "customers", json!({}))
            .await
            .expect("enqueue");
        online.store(true, Ordering::SeqCst);

        let first = queue.sync_queued_operations().await.expect("sync");
        assert_eq!((first.processed, first.failed), (0, 0));
        assert_eq!(queue.queued_operations_count(), 1);

        let second = queue.sync_queued_operations().await.expect("sync");
        assert_eq!((second.processed, second.failed), (0, 0));
        assert_eq!(queue.queued_operations_count(), 1);

        // Third failed pass exhausts max_retries = 3.
        let third = queue.sync_queued_operations().await.expect("sync");
        assert_eq!((third.processed, third.failed), (0, 1));
        assert!(!third.success);
        assert_eq!(third.errors.len(), 1);
        assert_eq!(queue.queued_operations_count(), 0);
    }

    #[tokio::test]
    async fn transiently_failing_item_survives_for_the_next_pass() {
        let dir = tempdir().expect("tempdir");
        let handler = Arc::new(ScriptedHandler::failing_first(1));
        let online = Arc::new(AtomicBool::new(false));
        let queue = OfflineQueue::new(
            temp_store(&dir),
            handler,
            OfflineQueueConfig::default(),
            online.clone(),
        )
        .expect("queue should build");

        queue
            .queue_operation(OperationType::Update, "deals", json!({"stage": "won"}))
            .await
            .expect("enqueue");
        online.store(true, Ordering::SeqCst);

        let first = queue.sync_queued_operations().await.expect("sync");
        assert!(!first.success);
        assert_eq!(queue.queued_operations_count(), 1);
        assert_eq!(queue.queued_operations()[0].retry_count, 1);

        let second = queue.sync_queued_operations().await.expect("sync");
        assert!(second.success);
        assert_eq!(second.processed, 1);
        assert_eq!(queue.queued_operations_count(), 0);
    }

    #[tokio::test]
    async fn queue_trims_oldest_beyond_max_size() {
        let dir = tempdir().expect("tempdir");
        let queue = queue_with(
            temp_store(&dir),
            Arc::new(ScriptedHandler::succeeding()),
            false,
            OfflineQueueConfig {
                max_queue_size: 2,
                max_retries: 3,
            },
        );

        for index in 0..3 {
            queue
                .queue_operation(OperationType::Create, "customers", json!({"index": index}))
                .await
                .expect("enqueue");
        }

        let snapshot = queue.queued_operations();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].payload, json!({"index": 1}));
        assert_eq!(snapshot[1].payload, json!({"index": 2}));
    }

    #[tokio::test]
    async fn queue_hydrates_from_a_fresh_store_instance() {
        let dir = tempdir().expect("tempdir");
        let store = temp_store(&dir);

        let queue = queue_with(
            store.clone(),
            Arc::new(ScriptedHandler::succeeding()),
            false,
            OfflineQueueConfig::default(),
        );
        queue
            .queue_operation(OperationType::Create, "customers", json!({"name": "Acme"}))
            .await
            .expect("enqueue");
        queue
            .queue_operation(OperationType::Delete, "leads", json!({"id": "l-1"}))
            .await
            .expect("enqueue");
        let before = queue.queued_operations();
        drop(queue);

        let revived = queue_with(
            store,
            Arc::new(ScriptedHandler::succeeding()),
            false,
            OfflineQueueConfig::default(),
        );
        assert_eq!(revived.queued_operations(), before);
    }

    #[tokio::test]
    async fn cached_values_expire_by_max_age() {
        let dir = tempdir().expect("tempdir");
        let store = temp_store(&dir);
        let queue = queue_with(
            store.clone(),
            Arc::new(ScriptedHandler::succeeding()),
            true,
            OfflineQueueConfig::default(),
        );

        queue
            .store_cached_value("customers:list", json!([{"id": "c-1"}]))
            .expect("cache write");
        let hit = queue
            .cached_value("customers:list", DEFAULT_CACHE_MAX_AGE)
            .expect("lookup");
        assert_eq!(hit, Some(json!([{"id": "c-1"}])));

        // Backdate the entry behind the queue's back, then observe the miss
        // and the eviction.
        store
            .cache_put(&CacheRecord {
                cache_key: "customers:list".to_owned(),
                data: json!([{"id": "c-1"}]),
                cached_at_ms: now_ms() - 10_000,
            })
            .expect("backdate");

        let miss = queue
            .cached_value("customers:list", Duration::from_secs(5))
            .expect("lookup");
        assert_eq!(miss, None);
        assert!(store.cache_get("customers:list").expect("get").is_none());
    }

    #[tokio::test]
    async fn clear_queue_empties_memory_and_store() {
        let dir = tempdir().expect("tempdir");
        let store = temp_store(&dir);
        let queue = queue_with(
            store.clone(),
            Arc::new(ScriptedHandler::succeeding()),
            false,
            OfflineQueueConfig::default(),
        );

        queue
            .queue_operation(OperationType::Create, "customers", json!({}))
            .await
            .expect("enqueue");
        queue.clear_queue().expect("clear");

        assert_eq!(queue.queued_operations_count(), 0);
        assert_eq!(store.load_queue().expect("load").len(), 0);
    }

    #[tokio::test]
    async fn empty_table_name_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let queue = queue_with(
            temp_store(&dir),
            Arc::new(ScriptedHandler::succeeding()),
            false,
            OfflineQueueConfig::default(),
        );

        let error = queue
            .queue_operation(OperationType::Create, "", json!({}))
            .await
            .expect_err("must reject");
        assert!(matches!(error, QueueError::Validation(ValidationError::EmptyTableName)));
    }
}
