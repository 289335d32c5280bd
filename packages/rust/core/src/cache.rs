//! Query-keyed cache for retrieval results.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use helpdesk_shared::Document;
use helpdesk_storage::CacheStore;

/// Hex characters of the SHA-256 digest kept in a cache key.
const FINGERPRINT_LEN: usize = 16;

/// Fixed-length fingerprint of the raw query text.
pub fn fingerprint(query: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(query.as_bytes()));
    digest[..FINGERPRINT_LEN].to_string()
}

/// Retrieval results cached by query fingerprint.
///
/// Reads that fail are treated as misses and writes that fail are dropped;
/// neither ever fails a run.
#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn CacheStore>,
    prefix: String,
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Store key for `query`.
    pub fn key(&self, query: &str) -> String {
        format!("{}{}", self.prefix, fingerprint(query))
    }

    pub async fn get(&self, query: &str) -> Option<Vec<Document>> {
        let key = self.key(query);
        let raw = match self.store.cache_get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(%key, error = %e, "cache read failed, treating as miss");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(docs) => {
                debug!(%key, "cache hit");
                Some(docs)
            }
            Err(e) => {
                warn!(%key, error = %e, "undecodable cache entry, treating as miss");
                None
            }
        }
    }

    pub async fn set(&self, query: &str, docs: &[Document], ttl: Duration) {
        let key = self.key(query);
        let encoded = match serde_json::to_string(docs) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(%key, error = %e, "cache encode failed");
                return;
            }
        };
        if let Err(e) = self.store.cache_set(&key, &encoded, ttl).await {
            warn!(%key, error = %e, "cache write failed");
        }
    }
}
