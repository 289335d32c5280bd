//! In-process store over an ordered string map.
//!
//! Keys mirror the layout used by key-value deployments:
//!
//! ```text
//! {prefix}{ns}:{thread}:{checkpoint_id}         checkpoint + metadata
//! {prefix}{ns}:{thread}:latest                  latest checkpoint id
//! {prefix}version:{ns}:{thread}                 channel version markers
//! {prefix}writes:{ns}:{thread}:{checkpoint}:{task}  pending write batch
//! ```
//!
//! Namespaces `version` and `writes` and the checkpoint id `latest` are
//! reserved so control keys can never be mistaken for checkpoints.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use helpdesk_shared::{
    Checkpoint, CheckpointMetadata, CheckpointTuple, HelpdeskError, ListFilter, PendingWrite,
    Result, RunConfig, sort_pending_writes,
};

use crate::saver::{CacheStore, CheckpointSaver, expiry_millis, is_live};

/// Key prefix for checkpoint entries.
pub const DEFAULT_KEY_PREFIX: &str = "helpdesk:checkpoint:";

const LATEST: &str = "latest";
const RESERVED_NAMESPACES: [&str; 2] = ["version", "writes"];

#[derive(Serialize, Deserialize)]
struct StoredCheckpoint {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
}

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    value: String,
    expires_at: i64,
}

/// Ordered in-memory implementation of [`CheckpointSaver`] and [`CacheStore`].
///
/// Every operation holds the map lock for its whole duration, so each call is
/// atomic with respect to the others.
pub struct MemoryStore {
    prefix: String,
    entries: Mutex<BTreeMap<String, String>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn entries(&self) -> Result<MutexGuard<'_, BTreeMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| HelpdeskError::Storage("memory store lock poisoned".into()))
    }

    // -- Key layout ---------------------------------------------------------

    fn thread_prefix(&self, run: &RunConfig) -> String {
        format!("{}{}:{}:", self.prefix, run.checkpoint_ns, run.thread_id)
    }

    fn checkpoint_key(&self, run: &RunConfig, checkpoint_id: &str) -> String {
        format!("{}{checkpoint_id}", self.thread_prefix(run))
    }

    fn latest_key(&self, run: &RunConfig) -> String {
        format!("{}{LATEST}", self.thread_prefix(run))
    }

    fn version_key(&self, run: &RunConfig) -> String {
        format!("{}version:{}:{}", self.prefix, run.checkpoint_ns, run.thread_id)
    }

    fn writes_prefix(&self, run: &RunConfig, checkpoint_id: &str) -> String {
        format!(
            "{}writes:{}:{}:{checkpoint_id}:",
            self.prefix, run.checkpoint_ns, run.thread_id
        )
    }

    /// Reject addresses that would collide with control keys.
    fn validate(run: &RunConfig, checkpoint_id: Option<&str>) -> Result<()> {
        if RESERVED_NAMESPACES.contains(&run.checkpoint_ns.as_str()) {
            return Err(HelpdeskError::validation(format!(
                "checkpoint namespace '{}' is reserved",
                run.checkpoint_ns
            )));
        }
        if checkpoint_id == Some(LATEST) {
            return Err(HelpdeskError::validation("checkpoint id 'latest' is reserved"));
        }
        for (what, part) in [
            ("namespace", Some(run.checkpoint_ns.as_str())),
            ("thread id", Some(run.thread_id.as_str())),
            ("checkpoint id", checkpoint_id),
        ] {
            if part.is_some_and(|p| p.is_empty() || p.contains(':')) {
                return Err(HelpdeskError::validation(format!(
                    "{what} must be non-empty and free of ':'"
                )));
            }
        }
        Ok(())
    }

    // -- Scans --------------------------------------------------------------

    /// Every checkpoint of the thread, newest first. Control keys are skipped.
    fn scan_thread(
        &self,
        entries: &BTreeMap<String, String>,
        run: &RunConfig,
    ) -> Result<Vec<StoredCheckpoint>> {
        let prefix = self.thread_prefix(run);
        let mut found = Vec::new();
        for (key, raw) in entries.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            if rest.is_empty() || rest == LATEST || rest.contains(':') {
                continue;
            }
            found.push(decode_checkpoint(raw)?);
        }
        found.sort_by(|a, b| b.checkpoint.seq.cmp(&a.checkpoint.seq));
        Ok(found)
    }

    fn writes_for(
        &self,
        entries: &BTreeMap<String, String>,
        run: &RunConfig,
        checkpoint_id: &str,
    ) -> Result<Vec<PendingWrite>> {
        let prefix = self.writes_prefix(run, checkpoint_id);
        let mut writes = Vec::new();
        for (key, raw) in entries.range(prefix.clone()..) {
            let Some(task_id) = key.strip_prefix(&prefix) else {
                break;
            };
            let batch: Vec<(String, Value)> = serde_json::from_str(raw)
                .map_err(|e| HelpdeskError::Storage(format!("corrupt pending write: {e}")))?;
            writes.extend(batch.into_iter().map(|(channel, value)| PendingWrite {
                task_id: task_id.to_string(),
                channel,
                value,
            }));
        }
        sort_pending_writes(&mut writes);
        Ok(writes)
    }

    fn tuple(
        &self,
        entries: &BTreeMap<String, String>,
        run: &RunConfig,
        stored: StoredCheckpoint,
    ) -> Result<CheckpointTuple> {
        let config = run.at(stored.checkpoint.id.as_str());
        let pending_writes = self.writes_for(entries, run, &stored.checkpoint.id)?;
        let parent_config = stored.metadata.parent_id.as_deref().map(|p| run.at(p));
        Ok(CheckpointTuple {
            config,
            checkpoint: stored.checkpoint,
            metadata: stored.metadata,
            parent_config,
            pending_writes,
        })
    }

    #[cfg(test)]
    pub(crate) fn raw_keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn decode_checkpoint(raw: &str) -> Result<StoredCheckpoint> {
    serde_json::from_str(raw).map_err(|e| HelpdeskError::Storage(format!("corrupt checkpoint: {e}")))
}

#[async_trait]
impl CheckpointSaver for MemoryStore {
    async fn put(
        &self,
        run: &RunConfig,
        checkpoint: &Checkpoint,
        metadata: &CheckpointMetadata,
        new_versions: &BTreeMap<String, u64>,
    ) -> Result<RunConfig> {
        Self::validate(run, Some(&checkpoint.id))?;
        let key = self.checkpoint_key(run, &checkpoint.id);
        let mut entries = self.entries()?;

        let seq = match entries.get(&key) {
            Some(raw) => decode_checkpoint(raw)?.checkpoint.seq,
            None => {
                self.scan_thread(&entries, run)?
                    .first()
                    .map_or(0, |newest| newest.checkpoint.seq)
                    + 1
            }
        };

        let mut stored = StoredCheckpoint {
            checkpoint: checkpoint.clone(),
            metadata: metadata.clone(),
        };
        stored.checkpoint.seq = seq;
        let encoded = serde_json::to_string(&stored)?;

        let version_key = self.version_key(run);
        let mut versions: BTreeMap<String, u64> = match entries.get(&version_key) {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| HelpdeskError::Storage(format!("corrupt version markers: {e}")))?,
            None => BTreeMap::new(),
        };
        for (channel, version) in new_versions {
            let slot = versions.entry(channel.clone()).or_default();
            *slot = (*slot).max(*version);
        }
        let versions = serde_json::to_string(&versions)?;

        let latest_key = self.latest_key(run);
        let move_latest = match entries.get(&latest_key) {
            Some(current) => match entries.get(&self.checkpoint_key(run, current)) {
                Some(raw) => decode_checkpoint(raw)?.checkpoint.seq <= seq,
                None => true,
            },
            None => true,
        };

        entries.insert(key, encoded);
        entries.insert(version_key, versions);
        if move_latest {
            entries.insert(latest_key, checkpoint.id.clone());
        }
        Ok(run.at(checkpoint.id.as_str()))
    }

    async fn put_writes(
        &self,
        run: &RunConfig,
        writes: &[(String, Value)],
        task_id: &str,
    ) -> Result<()> {
        Self::validate(run, Some(run.pending_id()))?;
        if task_id.is_empty() || task_id.contains(':') {
            return Err(HelpdeskError::validation("task id must be non-empty and free of ':'"));
        }
        let key = format!("{}{task_id}", self.writes_prefix(run, run.pending_id()));
        let encoded = serde_json::to_string(writes)?;
        self.entries()?.insert(key, encoded);
        Ok(())
    }

    async fn get_tuple(&self, run: &RunConfig) -> Result<Option<CheckpointTuple>> {
        let Some(checkpoint_id) = run.checkpoint_id.as_deref() else {
            return Ok(None);
        };
        if checkpoint_id == LATEST {
            return Ok(None);
        }
        let entries = self.entries()?;
        match entries.get(&self.checkpoint_key(run, checkpoint_id)) {
            Some(raw) => {
                let stored = decode_checkpoint(raw)?;
                Ok(Some(self.tuple(&entries, run, stored)?))
            }
            None => Ok(None),
        }
    }

    async fn get_latest(&self, run: &RunConfig) -> Result<Option<CheckpointTuple>> {
        let latest = match self.entries()?.get(&self.latest_key(run)) {
            Some(id) => id.clone(),
            None => return Ok(None),
        };
        self.get_tuple(&run.at(latest)).await
    }

    async fn list(&self, run: &RunConfig, filter: &ListFilter) -> Result<Vec<CheckpointTuple>> {
        let entries = self.entries()?;
        let mut scanned = self.scan_thread(&entries, run)?;

        if let Some(before) = filter.before.as_deref() {
            let Some(cutoff) = scanned
                .iter()
                .find(|s| s.checkpoint.id == before)
                .map(|s| s.checkpoint.seq)
            else {
                return Ok(Vec::new());
            };
            scanned.retain(|s| s.checkpoint.seq < cutoff);
        }

        let mut results = Vec::new();
        for stored in scanned {
            if filter.limit.is_some_and(|limit| results.len() >= limit) {
                break;
            }
            if stored.metadata.matches(&filter.metadata) {
                results.push(self.tuple(&entries, run, stored)?);
            }
        }
        Ok(results)
    }

    async fn prune(&self, run: &RunConfig, keep: usize) -> Result<usize> {
        let mut entries = self.entries()?;
        let latest = entries.get(&self.latest_key(run)).cloned();
        let doomed: Vec<String> = self
            .scan_thread(&entries, run)?
            .into_iter()
            .skip(keep.max(1))
            .map(|s| s.checkpoint.id)
            .filter(|id| latest.as_deref() != Some(id.as_str()))
            .collect();

        for id in &doomed {
            entries.remove(&self.checkpoint_key(run, id));
            let writes_prefix = self.writes_prefix(run, id);
            let write_keys: Vec<String> = entries
                .range(writes_prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&writes_prefix))
                .map(|(key, _)| key.clone())
                .collect();
            for key in write_keys {
                entries.remove(&key);
            }
        }
        Ok(doomed.len())
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn cache_get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries()?;
        let Some(raw) = entries.get(key) else {
            return Ok(None);
        };
        let entry: CacheEntry = serde_json::from_str(raw)
            .map_err(|e| HelpdeskError::Storage(format!("corrupt cache entry: {e}")))?;
        Ok(is_live(entry.expires_at).then_some(entry.value))
    }

    async fn cache_set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        if key.starts_with(&self.prefix) {
            return Err(HelpdeskError::validation(format!(
                "cache key '{key}' overlaps the checkpoint key space"
            )));
        }
        let entry = CacheEntry {
            value: value.to_string(),
            expires_at: expiry_millis(ttl),
        };
        let encoded = serde_json::to_string(&entry)?;
        self.entries()?.insert(key.to_string(), encoded);
        Ok(())
    }
}
