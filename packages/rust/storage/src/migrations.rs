//! SQL migration definitions for the helpdesk database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: checkpoints, latest pointer, pending writes, channel versions, result cache",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Immutable pipeline snapshots, ordered per thread by seq
CREATE TABLE IF NOT EXISTS checkpoints (
    thread_id       TEXT NOT NULL,
    checkpoint_ns   TEXT NOT NULL,
    checkpoint_id   TEXT NOT NULL,
    seq             INTEGER NOT NULL,
    run_id          TEXT NOT NULL,
    parent_id       TEXT,
    checkpoint_json TEXT NOT NULL,
    metadata_json   TEXT NOT NULL,
    versions_json   TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    PRIMARY KEY (thread_id, checkpoint_ns, checkpoint_id),
    UNIQUE (thread_id, checkpoint_ns, seq)
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_run ON checkpoints(thread_id, checkpoint_ns, run_id);

-- Latest checkpoint per thread
CREATE TABLE IF NOT EXISTS checkpoint_latest (
    thread_id     TEXT NOT NULL,
    checkpoint_ns TEXT NOT NULL,
    checkpoint_id TEXT NOT NULL,
    seq           INTEGER NOT NULL,
    PRIMARY KEY (thread_id, checkpoint_ns)
);

-- Uncommitted per-task writes, one row per (task, position in batch)
CREATE TABLE IF NOT EXISTS pending_writes (
    thread_id     TEXT NOT NULL,
    checkpoint_ns TEXT NOT NULL,
    checkpoint_id TEXT NOT NULL,
    task_id       TEXT NOT NULL,
    idx           INTEGER NOT NULL,
    channel       TEXT NOT NULL,
    value_json    TEXT NOT NULL,
    PRIMARY KEY (thread_id, checkpoint_ns, checkpoint_id, task_id, idx)
);

-- Per-channel version markers
CREATE TABLE IF NOT EXISTS channel_versions (
    thread_id     TEXT NOT NULL,
    checkpoint_ns TEXT NOT NULL,
    channel       TEXT NOT NULL,
    version       INTEGER NOT NULL,
    PRIMARY KEY (thread_id, checkpoint_ns, channel)
);

-- Retrieval result cache, independent of checkpoints
CREATE TABLE IF NOT EXISTS result_cache (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_result_cache_expiry ON result_cache(expires_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
