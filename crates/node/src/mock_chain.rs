//! Mock Chain Implementation for Testing
//!
//! Fully in-memory implementation of [`AllocationSource`] and [`PoolSource`].
//! No network calls. Supports failure injection and call counting so tests
//! can assert when the node went back to the chain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::debug;

use crate::chain::{AllocationInfo, AllocationSource, ChainError, PoolBalance, PoolSource};

fn pool_key(client_id: &str, allocation_id: &str, blobber_id: &str) -> String {
    format!("{}:{}:{}", client_id, allocation_id, blobber_id)
}

/// Pools of one (client, allocation, blobber) triple in a seed file.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedPools {
    pub client_id: String,
    pub allocation_id: String,
    pub blobber_id: String,
    pub pools: Vec<PoolBalance>,
}

/// JSON document used to preload a [`MockChain`] for local runs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChainSeed {
    pub allocations: Vec<AllocationInfo>,
    pub read_pools: Vec<SeedPools>,
    pub write_pools: Vec<SeedPools>,
}

// ════════════════════════════════════════════════════════════════════════════
// MOCK CHAIN STRUCT
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct MockChain {
    /// allocation tx -> allocation
    allocations: RwLock<HashMap<String, AllocationInfo>>,
    read_pools: RwLock<HashMap<String, Vec<PoolBalance>>>,
    write_pools: RwLock<HashMap<String, Vec<PoolBalance>>>,
    failing: AtomicBool,
    allocation_calls: AtomicU64,
    pool_calls: AtomicU64,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a chain preloaded from a [`ChainSeed`] JSON document.
    pub fn from_seed_json(json: &str) -> Result<Self, serde_json::Error> {
        let seed: ChainSeed = serde_json::from_str(json)?;
        let chain = Self::new();
        for info in seed.allocations {
            chain.put_allocation(info);
        }
        for p in seed.read_pools {
            chain.set_read_pools(&p.client_id, &p.allocation_id, &p.blobber_id, p.pools);
        }
        for p in seed.write_pools {
            chain.set_write_pools(&p.client_id, &p.allocation_id, &p.blobber_id, p.pools);
        }
        Ok(chain)
    }

    // ────────────────────────────────────────────────────────────────────────
    // TEST HELPERS
    // ────────────────────────────────────────────────────────────────────────

    pub fn put_allocation(&self, info: AllocationInfo) {
        self.allocations.write().insert(info.tx.clone(), info);
    }

    pub fn remove_allocation(&self, allocation_tx: &str) {
        self.allocations.write().remove(allocation_tx);
    }

    pub fn set_read_pools(&self, client_id: &str, allocation_id: &str, blobber_id: &str, pools: Vec<PoolBalance>) {
        self.read_pools.write().insert(pool_key(client_id, allocation_id, blobber_id), pools);
    }

    pub fn set_write_pools(&self, client_id: &str, allocation_id: &str, blobber_id: &str, pools: Vec<PoolBalance>) {
        self.write_pools.write().insert(pool_key(client_id, allocation_id, blobber_id), pools);
    }

    /// Make every subsequent call fail with [`ChainError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn allocation_calls(&self) -> u64 {
        self.allocation_calls.load(Ordering::SeqCst)
    }

    pub fn pool_calls(&self) -> u64 {
        self.pool_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), ChainError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChainError::Unavailable("mock chain failure injected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AllocationSource for MockChain {
    async fn get_allocation(&self, allocation_tx: &str) -> Result<AllocationInfo, ChainError> {
        self.allocation_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let found = self.allocations.read().get(allocation_tx).cloned();
        debug!(tx = allocation_tx, found = found.is_some(), "mock chain allocation lookup");
        found.ok_or_else(|| ChainError::NotFound(format!("allocation {}", allocation_tx)))
    }
}

#[async_trait]
impl PoolSource for MockChain {
    async fn get_read_pools(
        &self,
        client_id: &str,
        allocation_id: &str,
        blobber_id: &str,
    ) -> Result<Vec<PoolBalance>, ChainError> {
        self.pool_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let key = pool_key(client_id, allocation_id, blobber_id);
        Ok(self.read_pools.read().get(&key).cloned().unwrap_or_default())
    }

    async fn get_write_pools(
        &self,
        client_id: &str,
        allocation_id: &str,
        blobber_id: &str,
    ) -> Result<Vec<PoolBalance>, ChainError> {
        self.pool_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let key = pool_key(client_id, allocation_id, blobber_id);
        Ok(self.write_pools.read().get(&key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(tx: &str) -> AllocationInfo {
        AllocationInfo {
            id: format!("id-{}", tx),
            tx: tx.to_string(),
            owner_id: "owner".into(),
            owner_public_key: String::new(),
            payer_id: "owner".into(),
            repairer_id: String::new(),
            total_size: 100,
            blobber_size: 100,
            expiration: u64::MAX,
            read_price: 0,
            write_price: 0,
        }
    }

    #[tokio::test]
    async fn test_lookup_and_not_found() {
        let chain = MockChain::new();
        chain.put_allocation(info("tx1"));
        assert_eq!(chain.get_allocation("tx1").await.expect("found").id, "id-tx1");
        assert!(matches!(chain.get_allocation("tx2").await, Err(ChainError::NotFound(_))));
        assert_eq!(chain.allocation_calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let chain = MockChain::new();
        chain.set_failing(true);
        assert!(matches!(chain.get_read_pools("c", "a", "b").await, Err(ChainError::Unavailable(_))));
        chain.set_failing(false);
        assert!(chain.get_read_pools("c", "a", "b").await.expect("ok").is_empty());
        assert_eq!(chain.pool_calls(), 2);
    }

    #[tokio::test]
    async fn test_from_seed_json() {
        let json = r#"{
            "allocations": [{
                "id": "a1", "tx": "tx1", "owner_id": "o", "owner_public_key": "",
                "payer_id": "o", "repairer_id": "", "total_size": 10, "blobber_size": 10,
                "expiration": 99, "read_price": 1, "write_price": 2
            }],
            "write_pools": [{
                "client_id": "o", "allocation_id": "a1", "blobber_id": "b",
                "pools": [{ "pool_id": "p", "balance": 500, "expire_at": 99 }]
            }]
        }"#;
        let chain = MockChain::from_seed_json(json).expect("seed");
        assert_eq!(chain.get_allocation("tx1").await.expect("alloc").write_price, 2);
        assert_eq!(chain.get_write_pools("o", "a1", "b").await.expect("pools")[0].balance, 500);
        assert!(chain.get_read_pools("o", "a1", "b").await.expect("pools").is_empty());
        assert!(MockChain::from_seed_json("{ not json").is_err());
    }
}
