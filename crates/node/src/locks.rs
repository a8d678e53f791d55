//! # Lock Manager
//!
//! Keyed async mutexes for allocation, connection and reader scopes.
//!
//! ```text
//! key ──hash──▶ shard[i] ──▶ HashMap<String, Arc<tokio::Mutex<()>>>
//!                                     │
//!                       KeyGuard ◀────┘  (owned guard, removes the entry
//!                                         when the last holder drops)
//! ```
//!
//! Entries exist only while someone holds or waits for the key, so the map
//! stays bounded under allocation churn. Dropping a guard (including when the
//! request future is cancelled) releases the key.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const SHARDS: usize = 16;

type Shard = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

#[derive(Debug)]
pub struct LockManager {
    shards: Vec<Shard>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self { shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect() }
    }

    fn shard_index(key: &str) -> usize {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        (h.finish() as usize) % SHARDS
    }

    /// Acquire the lock for `key`, waiting if another task holds it.
    pub async fn lock(self: &Arc<Self>, key: impl Into<String>) -> KeyGuard {
        let key = key.into();
        let shard = Self::shard_index(&key);
        let entry = {
            let mut map = self.shards[shard].lock();
            map.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        let guard = entry.lock_owned().await;
        KeyGuard { guard: Some(guard), manager: Arc::clone(self), key, shard }
    }

    /// Exclusive scope for commits and connection-producing operations.
    pub async fn lock_allocation(self: &Arc<Self>, allocation_id: &str) -> KeyGuard {
        self.lock(format!("allocation:{}", allocation_id)).await
    }

    /// Serializes chunk uploads against one connection.
    pub async fn lock_connection(self: &Arc<Self>, connection_id: &str) -> KeyGuard {
        self.lock(format!("connection:{}", connection_id)).await
    }

    /// Serializes read-marker advancement for one client.
    pub async fn lock_reader(self: &Arc<Self>, client_id: &str) -> KeyGuard {
        self.lock(format!("reader:{}", client_id)).await
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    fn release(&self, key: &str, shard: usize) {
        let mut map = self.shards[shard].lock();
        if let Some(entry) = map.get(key) {
            // only the map itself still references the mutex
            if Arc::strong_count(entry) == 1 {
                map.remove(key);
            }
        }
    }
}

/// Held lock on one key. Released on drop.
pub struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    manager: Arc<LockManager>,
    key: String,
    shard: usize,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.manager.release(&self.key, self.shard);
    }
}
