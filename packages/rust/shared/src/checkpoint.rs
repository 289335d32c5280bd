//! Checkpoint records exchanged between the executor and the checkpoint store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{PipelineState, Step};

/// Namespace used when a [`RunConfig`] carries none.
pub const DEFAULT_CHECKPOINT_NS: &str = "default";

/// Checkpoint id under which writes land when no checkpoint is committed yet.
pub const PENDING_CHECKPOINT_ID: &str = "pending";

/// Generate a new time-sortable checkpoint id.
pub fn new_checkpoint_id() -> String {
    Uuid::now_v7().to_string()
}

// ---------------------------------------------------------------------------
// RunConfig
// ---------------------------------------------------------------------------

/// Addresses a pipeline run in the checkpoint store: `(thread, namespace, checkpoint)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunConfig {
    pub thread_id: String,
    pub checkpoint_ns: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
}

impl RunConfig {
    /// Address a thread within a namespace, with no checkpoint selected.
    pub fn new(thread_id: impl Into<String>, checkpoint_ns: impl Into<String>) -> Self {
        let checkpoint_ns = checkpoint_ns.into();
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: if checkpoint_ns.is_empty() {
                DEFAULT_CHECKPOINT_NS.to_string()
            } else {
                checkpoint_ns
            },
            checkpoint_id: None,
        }
    }

    /// Same thread and namespace, pointing at `checkpoint_id`.
    pub fn at(&self, checkpoint_id: impl Into<String>) -> Self {
        Self {
            checkpoint_id: Some(checkpoint_id.into()),
            ..self.clone()
        }
    }

    /// The checkpoint id writes should be attributed to.
    pub fn pending_id(&self) -> &str {
        self.checkpoint_id.as_deref().unwrap_or(PENDING_CHECKPOINT_ID)
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Immutable snapshot of a run's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    /// Creation order within the thread. Assigned by the store on `put`.
    #[serde(default)]
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub state: PipelineState,
    /// Latest version of every channel written so far.
    #[serde(default)]
    pub channel_versions: BTreeMap<String, u64>,
}

impl Checkpoint {
    /// Snapshot `state` under a fresh id.
    pub fn new(state: PipelineState, channel_versions: BTreeMap<String, u64>) -> Self {
        Self::with_id(new_checkpoint_id(), state, channel_versions)
    }

    /// Snapshot `state` under a caller-chosen id.
    pub fn with_id(
        id: impl Into<String>,
        state: PipelineState,
        channel_versions: BTreeMap<String, u64>,
    ) -> Self {
        Self {
            id: id.into(),
            seq: 0,
            created_at: Utc::now(),
            state,
            channel_versions,
        }
    }
}

/// Lifecycle status recorded with each checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed and failed runs are never re-executed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Run bookkeeping stored alongside a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Id shared by every checkpoint of one run.
    pub run_id: String,
    /// Checkpoint this one supersedes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Stage that produced this snapshot.
    pub step: Step,
    /// Stage to run when resuming from this snapshot.
    pub next: Step,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckpointMetadata {
    /// Whether every `key = value` pair in `filter` matches this metadata.
    pub fn matches(&self, filter: &BTreeMap<String, Value>) -> bool {
        if filter.is_empty() {
            return true;
        }
        let Ok(Value::Object(fields)) = serde_json::to_value(self) else {
            return false;
        };
        filter
            .iter()
            .all(|(key, expected)| fields.get(key) == Some(expected))
    }
}

// ---------------------------------------------------------------------------
// Pending writes
// ---------------------------------------------------------------------------

/// An uncommitted channel write attributed to one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub task_id: String,
    pub channel: String,
    pub value: Value,
}

/// What a store hands back for one checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointTuple {
    /// Address of this checkpoint.
    pub config: RunConfig,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    /// Address of the checkpoint this one supersedes.
    pub parent_config: Option<RunConfig>,
    /// Writes recorded against this checkpoint, sorted by task id.
    pub pending_writes: Vec<PendingWrite>,
}

/// Order pending writes deterministically: by task id, keeping each task's
/// batch in its original order.
pub fn sort_pending_writes(writes: &mut [PendingWrite]) {
    writes.sort_by(|a, b| a.task_id.cmp(&b.task_id));
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Options for listing a thread's checkpoints (newest first).
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Metadata fields that must match exactly (e.g. `run_id`, `status`).
    pub metadata: BTreeMap<String, Value>,
    /// Only return checkpoints created before this checkpoint id.
    pub before: Option<String>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl ListFilter {
    /// Restrict the listing to one run.
    pub fn for_run(run_id: &str) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("run_id".to_string(), Value::String(run_id.to_string()));
        Self {
            metadata,
            ..Default::default()
        }
    }

    /// Cap the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
