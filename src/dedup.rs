//! Durable "already surfaced" flags for notification keys.
//!
//! The aggregator consults this store to decide whether a notification is new
//! to this client installation (raise an attention cue) or a replay after a
//! restart (insert silently). Both implementations prune least-recently-touched
//! keys once `max_keys` is exceeded.
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::db::{self, Pool};

#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn has(&self, key: &str) -> Result<bool>;

    /// Idempotent: marking a key twice equals marking it once.
    async fn mark_seen(&self, key: &str) -> Result<()>;
}

/// SQLite-backed store; survives process restarts.
#[derive(Debug, Clone)]
pub struct SqliteDedupStore {
    pool: Pool,
    max_keys: usize,
}

impl SqliteDedupStore {
    pub fn new(pool: Pool, max_keys: usize) -> Self {
        Self { pool, max_keys }
    }
}

#[async_trait]
impl DedupStore for SqliteDedupStore {
    async fn has(&self, key: &str) -> Result<bool> {
        db::is_seen(&self.pool, key).await
    }

    async fn mark_seen(&self, key: &str) -> Result<()> {
        if db::mark_seen(&self.pool, key).await? {
            let pruned = db::prune_seen_keys(&self.pool, self.max_keys).await?;
            if pruned > 0 {
                debug!(pruned, max_keys = self.max_keys, "pruned seen keys");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    keys: HashMap<String, u64>,
    clock: u64,
}

/// Process-local store for tests and for running without a data dir.
#[derive(Debug)]
pub struct MemoryDedupStore {
    state: Mutex<MemoryState>,
    max_keys: usize,
}

impl MemoryDedupStore {
    pub fn new(max_keys: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            max_keys,
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.keys.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryDedupStore {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn has(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.clock += 1;
        let now = state.clock;
        Ok(match state.keys.get_mut(key) {
            Some(touched) => {
                *touched = now;
                true
            }
            None => false,
        })
    }

    async fn mark_seen(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.clock += 1;
        let now = state.clock;
        state.keys.insert(key.to_string(), now);
        while state.keys.len() > self.max_keys {
            let oldest = state
                .keys
                .iter()
                .min_by_key(|(_, touched)| **touched)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    state.keys.remove(&k);
                }
                None => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mark_seen_is_idempotent() {
        let store = MemoryDedupStore::default();
        assert!(!store.has("message:1").await.unwrap());
        store.mark_seen("message:1").await.unwrap();
        store.mark_seen("message:1").await.unwrap();
        assert!(store.has("message:1").await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn prunes_least_recently_touched() {
        let store = MemoryDedupStore::new(2);
        store.mark_seen("a").await.unwrap();
        store.mark_seen("b").await.unwrap();
        // Touch "a" so "b" becomes the oldest.
        assert!(store.has("a").await.unwrap());
        store.mark_seen("c").await.unwrap();
        assert!(store.has("a").await.unwrap());
        assert!(!store.has("b").await.unwrap());
        assert!(store.has("c").await.unwrap());
    }
}
