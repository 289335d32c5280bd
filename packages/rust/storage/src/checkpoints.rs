//! [`CheckpointSaver`] over libSQL tables.
//!
//! One row per checkpoint in `checkpoints`, ordered per thread by `seq`; the
//! latest pointer lives in `checkpoint_latest` and is moved in the same
//! transaction that inserts the row.

use std::collections::BTreeMap;

use async_trait::async_trait;
use libsql::params;
use serde_json::Value;
use tracing::{debug, instrument};

use helpdesk_shared::{
    Checkpoint, CheckpointMetadata, CheckpointTuple, ListFilter, PendingWrite, Result, RunConfig,
    sort_pending_writes,
};

use crate::saver::CheckpointSaver;
use crate::{Storage, corrupt, unavailable};

#[async_trait]
impl CheckpointSaver for Storage {
    #[instrument(skip_all, fields(thread = %run.thread_id, ns = %run.checkpoint_ns, checkpoint = %checkpoint.id))]
    async fn put(
        &self,
        run: &RunConfig,
        checkpoint: &Checkpoint,
        metadata: &CheckpointMetadata,
        new_versions: &BTreeMap<String, u64>,
    ) -> Result<RunConfig> {
        self.check_writable()?;
        let checkpoint_json = serde_json::to_string(checkpoint)?;
        let metadata_json = serde_json::to_string(metadata)?;
        let versions_json = serde_json::to_string(new_versions)?;
        let thread = run.thread_id.as_str();
        let ns = run.checkpoint_ns.as_str();
        let id = checkpoint.id.as_str();

        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(unavailable)?;

        // Re-putting an id keeps its original position in the thread.
        let existing = {
            let mut rows = tx
                .query(
                    "SELECT seq FROM checkpoints
                     WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3",
                    params![thread, ns, id],
                )
                .await
                .map_err(unavailable)?;
            match rows.next().await.map_err(unavailable)? {
                Some(row) => Some(row.get::<i64>(0).map_err(unavailable)?),
                None => None,
            }
        };
        let seq = match existing {
            Some(seq) => seq,
            None => {
                let mut rows = tx
                    .query(
                        "SELECT COALESCE(MAX(seq), 0) + 1 FROM checkpoints
                         WHERE thread_id = ?1 AND checkpoint_ns = ?2",
                        params![thread, ns],
                    )
                    .await
                    .map_err(unavailable)?;
                match rows.next().await.map_err(unavailable)? {
                    Some(row) => row.get::<i64>(0).map_err(unavailable)?,
                    None => 1,
                }
            }
        };

        tx.execute(
            "INSERT INTO checkpoints
               (thread_id, checkpoint_ns, checkpoint_id, seq, run_id, parent_id,
                checkpoint_json, metadata_json, versions_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(thread_id, checkpoint_ns, checkpoint_id) DO UPDATE SET
               run_id = excluded.run_id,
               parent_id = excluded.parent_id,
               checkpoint_json = excluded.checkpoint_json,
               metadata_json = excluded.metadata_json,
               versions_json = excluded.versions_json",
            params![
                thread,
                ns,
                id,
                seq,
                metadata.run_id.as_str(),
                metadata.parent_id.clone(),
                checkpoint_json,
                metadata_json,
                versions_json,
                checkpoint.created_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(unavailable)?;

        for (channel, version) in new_versions {
            tx.execute(
                "INSERT INTO channel_versions (thread_id, checkpoint_ns, channel, version)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(thread_id, checkpoint_ns, channel) DO UPDATE SET
                   version = MAX(version, excluded.version)",
                params![thread, ns, channel.as_str(), *version as i64],
            )
            .await
            .map_err(unavailable)?;
        }

        tx.execute(
            "INSERT INTO checkpoint_latest (thread_id, checkpoint_ns, checkpoint_id, seq)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(thread_id, checkpoint_ns) DO UPDATE SET
               checkpoint_id = excluded.checkpoint_id,
               seq = excluded.seq
             WHERE excluded.seq >= checkpoint_latest.seq",
            params![thread, ns, id, seq],
        )
        .await
        .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;
        debug!(seq, step = %metadata.step, "checkpoint stored");

        Ok(run.at(id))
    }

    #[instrument(skip_all, fields(thread = %run.thread_id, checkpoint = run.pending_id(), task = task_id))]
    async fn put_writes(
        &self,
        run: &RunConfig,
        writes: &[(String, Value)],
        task_id: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let encoded = writes
            .iter()
            .map(|(channel, value)| Ok((channel.as_str(), serde_json::to_string(value)?)))
            .collect::<Result<Vec<_>>>()?;
        let thread = run.thread_id.as_str();
        let ns = run.checkpoint_ns.as_str();
        let checkpoint_id = run.pending_id();

        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(unavailable)?;

        tx.execute(
            "DELETE FROM pending_writes
             WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3 AND task_id = ?4",
            params![thread, ns, checkpoint_id, task_id],
        )
        .await
        .map_err(unavailable)?;

        for (idx, (channel, value_json)) in encoded.into_iter().enumerate() {
            tx.execute(
                "INSERT INTO pending_writes
                   (thread_id, checkpoint_ns, checkpoint_id, task_id, idx, channel, value_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![thread, ns, checkpoint_id, task_id, idx as i64, channel, value_json],
            )
            .await
            .map_err(unavailable)?;
        }

        tx.commit().await.map_err(unavailable)?;
        Ok(())
    }

    async fn get_tuple(&self, run: &RunConfig) -> Result<Option<CheckpointTuple>> {
        let Some(checkpoint_id) = run.checkpoint_id.as_deref() else {
            return Ok(None);
        };

        let mut rows = self
            .conn
            .query(
                "SELECT seq, checkpoint_json, metadata_json FROM checkpoints
                 WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3",
                params![run.thread_id.as_str(), run.checkpoint_ns.as_str(), checkpoint_id],
            )
            .await
            .map_err(unavailable)?;

        let Some(row) = rows.next().await.map_err(unavailable)? else {
            return Ok(None);
        };
        let stored = StoredRow::from_row(&row)?;
        let pending = self.pending_writes(run, checkpoint_id).await?;
        Ok(Some(stored.into_tuple(run.at(checkpoint_id), pending)?))
    }

    async fn get_latest(&self, run: &RunConfig) -> Result<Option<CheckpointTuple>> {
        let mut rows = self
            .conn
            .query(
                "SELECT checkpoint_id FROM checkpoint_latest
                 WHERE thread_id = ?1 AND checkpoint_ns = ?2",
                params![run.thread_id.as_str(), run.checkpoint_ns.as_str()],
            )
            .await
            .map_err(unavailable)?;

        let latest = match rows.next().await.map_err(unavailable)? {
            Some(row) => row.get::<String>(0).map_err(unavailable)?,
            None => return Ok(None),
        };
        self.get_tuple(&run.at(latest)).await
    }

    async fn list(&self, run: &RunConfig, filter: &ListFilter) -> Result<Vec<CheckpointTuple>> {
        let before_seq = match filter.before.as_deref() {
            Some(before) => match self.seq_of(run, before).await? {
                Some(seq) => seq,
                None => return Ok(Vec::new()),
            },
            None => i64::MAX,
        };

        let mut rows = self
            .conn
            .query(
                "SELECT checkpoint_id, seq, checkpoint_json, metadata_json FROM checkpoints
                 WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND seq < ?3
                 ORDER BY seq DESC",
                params![run.thread_id.as_str(), run.checkpoint_ns.as_str(), before_seq],
            )
            .await
            .map_err(unavailable)?;

        // Materialize the scan before issuing per-checkpoint write lookups.
        let mut scanned = Vec::new();
        while let Some(row) = rows.next().await.map_err(unavailable)? {
            let id = row.get::<String>(0).map_err(unavailable)?;
            let stored = StoredRow {
                seq: row.get::<i64>(1).map_err(unavailable)?,
                checkpoint_json: row.get::<String>(2).map_err(unavailable)?,
                metadata_json: row.get::<String>(3).map_err(unavailable)?,
            };
            scanned.push((id, stored));
        }

        let mut results = Vec::new();
        for (id, stored) in scanned {
            if filter.limit.is_some_and(|limit| results.len() >= limit) {
                break;
            }
            let metadata: CheckpointMetadata = serde_json::from_str(&stored.metadata_json)
                .map_err(|e| corrupt("checkpoint metadata", e))?;
            if !metadata.matches(&filter.metadata) {
                continue;
            }
            let pending = self.pending_writes(run, &id).await?;
            results.push(stored.into_tuple(run.at(id), pending)?);
        }
        Ok(results)
    }

    #[instrument(skip_all, fields(thread = %run.thread_id, ns = %run.checkpoint_ns, keep))]
    async fn prune(&self, run: &RunConfig, keep: usize) -> Result<usize> {
        self.check_writable()?;
        let keep = i64::try_from(keep.max(1)).unwrap_or(i64::MAX);
        let thread = run.thread_id.as_str();
        let ns = run.checkpoint_ns.as_str();

        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(unavailable)?;

        // Checkpoints outside the newest `keep`, never the latest pointer's target.
        let doomed_sql = "SELECT checkpoint_id FROM checkpoints
             WHERE thread_id = ?1 AND checkpoint_ns = ?2
               AND seq NOT IN (
                 SELECT seq FROM checkpoints WHERE thread_id = ?1 AND checkpoint_ns = ?2
                 ORDER BY seq DESC LIMIT ?3)
               AND checkpoint_id NOT IN (
                 SELECT checkpoint_id FROM checkpoint_latest
                 WHERE thread_id = ?1 AND checkpoint_ns = ?2)";

        tx.execute(
            &format!(
                "DELETE FROM pending_writes
                 WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id IN ({doomed_sql})"
            ),
            params![thread, ns, keep],
        )
        .await
        .map_err(unavailable)?;

        let removed = tx
            .execute(
                &format!(
                    "DELETE FROM checkpoints
                     WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id IN ({doomed_sql})"
                ),
                params![thread, ns, keep],
            )
            .await
            .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;
        debug!(removed, "pruned checkpoints");
        Ok(removed as usize)
    }
}

impl Storage {
    /// Pending writes for one checkpoint, ordered by task id then batch position.
    async fn pending_writes(&self, run: &RunConfig, checkpoint_id: &str) -> Result<Vec<PendingWrite>> {
        let mut rows = self
            .conn
            .query(
                "SELECT task_id, channel, value_json FROM pending_writes
                 WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3
                 ORDER BY task_id, idx",
                params![run.thread_id.as_str(), run.checkpoint_ns.as_str(), checkpoint_id],
            )
            .await
            .map_err(unavailable)?;

        let mut writes = Vec::new();
        while let Some(row) = rows.next().await.map_err(unavailable)? {
            let value_json: String = row.get(2).map_err(unavailable)?;
            writes.push(PendingWrite {
                task_id: row.get(0).map_err(unavailable)?,
                channel: row.get(1).map_err(unavailable)?,
                value: serde_json::from_str(&value_json).map_err(|e| corrupt("pending write", e))?,
            });
        }
        sort_pending_writes(&mut writes);
        Ok(writes)
    }

    /// Position of `checkpoint_id` within its thread.
    async fn seq_of(&self, run: &RunConfig, checkpoint_id: &str) -> Result<Option<i64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT seq FROM checkpoints
                 WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3",
                params![run.thread_id.as_str(), run.checkpoint_ns.as_str(), checkpoint_id],
            )
            .await
            .map_err(unavailable)?;

        match rows.next().await.map_err(unavailable)? {
            Some(row) => Ok(Some(row.get::<i64>(0).map_err(unavailable)?)),
            None => Ok(None),
        }
    }
}

/// Raw columns of one `checkpoints` row.
struct StoredRow {
    seq: i64,
    checkpoint_json: String,
    metadata_json: String,
}

impl StoredRow {
    fn from_row(row: &libsql::Row) -> Result<Self> {
        Ok(Self {
            seq: row.get::<i64>(0).map_err(unavailable)?,
            checkpoint_json: row.get::<String>(1).map_err(unavailable)?,
            metadata_json: row.get::<String>(2).map_err(unavailable)?,
        })
    }

    fn into_tuple(self, config: RunConfig, pending_writes: Vec<PendingWrite>) -> Result<CheckpointTuple> {
        let mut checkpoint: Checkpoint =
            serde_json::from_str(&self.checkpoint_json).map_err(|e| corrupt("checkpoint", e))?;
        checkpoint.seq = u64::try_from(self.seq).unwrap_or_default();
        let metadata: CheckpointMetadata =
            serde_json::from_str(&self.metadata_json).map_err(|e| corrupt("checkpoint metadata", e))?;
        let parent_config = metadata.parent_id.as_deref().map(|parent| config.at(parent));

        Ok(CheckpointTuple {
            config,
            checkpoint,
            metadata,
            parent_config,
            pending_writes,
        })
    }
}
