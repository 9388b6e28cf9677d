use serde::{Deserialize, Serialize};

/// Persisted form of a pending mutation awaiting replay.
///
/// The operation type is kept as its wire string here; `coral-core` owns the
/// typed enum and converts on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperationRecord {
    pub id: String,
    pub op_type: String,
    pub target_table: String,
    pub payload: serde_json::Value,
    pub enqueued_at_ms: i64,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// Persisted read-cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub cache_key: String,
    pub data: serde_json::Value,
    pub cached_at_ms: i64,
}
