//! [`CacheStore`] over the `result_cache` table.

use std::time::Duration;

use async_trait::async_trait;
use libsql::params;

use helpdesk_shared::Result;

use crate::saver::{CacheStore, expiry_millis, is_live};
use crate::{Storage, unavailable};

#[async_trait]
impl CacheStore for Storage {
    async fn cache_get(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT value, expires_at FROM result_cache WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(unavailable)?;

        match rows.next().await.map_err(unavailable)? {
            Some(row) => {
                let expires_at: i64 = row.get(1).map_err(unavailable)?;
                if !is_live(expires_at) {
                    return Ok(None);
                }
                Ok(Some(row.get::<String>(0).map_err(unavailable)?))
            }
            None => Ok(None),
        }
    }

    async fn cache_set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO result_cache (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value = excluded.value,
                   expires_at = excluded.expires_at",
                params![key, value, expiry_millis(ttl)],
            )
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

impl Storage {
    /// Delete expired cache entries. Returns the number removed.
    pub async fn prune_expired_cache(&self) -> Result<u64> {
        self.check_writable()?;
        let now = chrono::Utc::now().timestamp_millis();
        let _guard = self.write_lock.lock().await;
        let removed = self
            .conn
            .execute(
                "DELETE FROM result_cache WHERE expires_at <= ?1",
                params![now],
            )
            .await
            .map_err(unavailable)?;
        if removed > 0 {
            tracing::debug!(removed, "pruned expired cache entries");
        }
        Ok(removed)
    }
}
