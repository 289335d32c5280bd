//! Capability traits implemented by every backing store.
//!
//! The executor and the result cache only see these traits, so a store can be
//! swapped (durable libSQL file, in-process ordered map, test doubles) without
//! touching pipeline code.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use helpdesk_shared::{Checkpoint, CheckpointMetadata, CheckpointTuple, ListFilter, Result, RunConfig};

/// Persistence of pipeline snapshots and their uncommitted writes.
///
/// Keys are `(checkpoint_ns, thread_id, checkpoint_id)`; unrelated threads never
/// share keys, so concurrent runs on different threads do not interfere.
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Store `checkpoint` with its metadata and move the thread's latest
    /// pointer to it. Both become visible together or not at all.
    ///
    /// Returns `run` re-addressed at the stored checkpoint.
    async fn put(
        &self,
        run: &RunConfig,
        checkpoint: &Checkpoint,
        metadata: &CheckpointMetadata,
        new_versions: &BTreeMap<String, u64>,
    ) -> Result<RunConfig>;

    /// Record `writes` as task `task_id`'s batch against `run.pending_id()`.
    ///
    /// Batches from different tasks never overwrite each other; a repeated
    /// call for the same task replaces that task's batch.
    async fn put_writes(
        &self,
        run: &RunConfig,
        writes: &[(String, Value)],
        task_id: &str,
    ) -> Result<()>;

    /// Load the checkpoint `run` points at, with its pending writes.
    ///
    /// `Ok(None)` when `run.checkpoint_id` is unset or unknown.
    async fn get_tuple(&self, run: &RunConfig) -> Result<Option<CheckpointTuple>>;

    /// Load whatever the thread's latest pointer references.
    async fn get_latest(&self, run: &RunConfig) -> Result<Option<CheckpointTuple>>;

    /// List the thread's checkpoints, newest first.
    ///
    /// Reflects the store at scan time; concurrent writers may or may not be
    /// visible. Restart a listing by passing the last seen id as `before`.
    async fn list(&self, run: &RunConfig, filter: &ListFilter) -> Result<Vec<CheckpointTuple>>;

    /// Delete all but the newest `keep` checkpoints of the thread, along with
    /// their pending writes. The latest checkpoint is always kept.
    ///
    /// Returns the number of checkpoints removed.
    async fn prune(&self, run: &RunConfig, keep: usize) -> Result<usize>;

    /// Next version for `channel`: 1 when absent, otherwise `current + 1`.
    fn next_version(&self, current: Option<u64>, _channel: &str) -> u64 {
        current.map_or(1, |v| v + 1)
    }
}

/// String key-value storage with per-entry expiry, backing the result cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a live entry. Expired entries read as absent.
    async fn cache_get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key` for `ttl`.
    async fn cache_set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
}

/// Milliseconds since the Unix epoch at which an entry written now with `ttl` expires.
pub(crate) fn expiry_millis(ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    chrono::Utc::now().timestamp_millis().saturating_add(ttl_ms)
}

/// Whether an entry with `expires_at` is still live.
pub(crate) fn is_live(expires_at: i64) -> bool {
    chrono::Utc::now().timestamp_millis() < expires_at
}
