//! Checkpoint and cache persistence for the helpdesk pipeline.
//!
//! Two backends implement the [`CheckpointSaver`] and [`CacheStore`] traits:
//! - [`Storage`] wraps a libSQL database file (durable across restarts)
//! - [`MemoryStore`] is an in-process ordered key-value map (tests, ephemeral runs)
//!
//! **Access rules:**
//! - The pipeline process: read-write via [`Storage::open`]
//! - Inspection tooling: read-only via [`Storage::open_readonly`]

mod cache;
mod checkpoints;
mod memory;
mod migrations;
mod saver;

use std::path::Path;

use helpdesk_shared::{HelpdeskError, Result};
use libsql::{Connection, Database, params};
use tokio::sync::Mutex;

pub use memory::{DEFAULT_KEY_PREFIX, MemoryStore};
pub use saver::{CacheStore, CheckpointSaver};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    /// Serializes write transactions issued through the shared connection.
    write_lock: Mutex<()>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                HelpdeskError::StorageUnavailable(format!("{}: {e}", parent.display()))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(unavailable)?;

        let conn = db.connect().map_err(unavailable)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        tracing::debug!(path = %path.display(), "checkpoint database ready");
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (for inspection commands).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(HelpdeskError::StorageUnavailable(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(unavailable)?;

        let conn = db.connect().map_err(unavailable)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        HelpdeskError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(HelpdeskError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }
}

/// Map a libSQL failure to the "backing medium unreachable" condition.
pub(crate) fn unavailable(e: libsql::Error) -> HelpdeskError {
    HelpdeskError::StorageUnavailable(e.to_string())
}

/// Map a payload decoding failure.
pub(crate) fn corrupt(what: &str, e: impl std::fmt::Display) -> HelpdeskError {
    HelpdeskError::Storage(format!("corrupt {what}: {e}"))
}
