//! # Chain Collaborators
//!
//! Narrow async views of the blockchain consumed by the node: allocation
//! lookup and token pool snapshots. Implementations perform no retries; a
//! failed call surfaces as [`ChainError`] and the caller decides.
//!
//! ## Implementations
//!
//! - [`crate::mock_chain::MockChain`]: in-memory, for tests and local runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ════════════════════════════════════════════════════════════════════════════════
// ERROR
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    /// The chain answered, and the object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transport-level failure or timeout. May succeed on retry.
    #[error("chain unavailable: {0}")]
    Unavailable(String),

    /// The chain answered with something that could not be decoded.
    #[error("malformed chain response: {0}")]
    Malformed(String),
}

// ════════════════════════════════════════════════════════════════════════════════
// TYPES
// ════════════════════════════════════════════════════════════════════════════════

/// Allocation contract as recorded on chain.
///
/// Only the contract terms live here; ledger fields (root, used sizes,
/// markers) are node-local and owned by [`crate::allocation::Allocation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationInfo {
    pub id: String,
    pub tx: String,
    pub owner_id: String,
    pub owner_public_key: String,
    pub payer_id: String,
    pub repairer_id: String,
    pub total_size: u64,
    /// Capacity this blobber agreed to hold for the allocation.
    pub blobber_size: u64,
    /// Unix seconds.
    pub expiration: u64,
    /// Tokens per GB read.
    pub read_price: u64,
    /// Tokens per GB written.
    pub write_price: u64,
}

/// One token pool earmarked for a (client, allocation, blobber) triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolBalance {
    pub pool_id: String,
    pub balance: u64,
    /// Unix seconds after which the pool can no longer be drawn from.
    pub expire_at: u64,
}

impl PoolBalance {
    pub fn is_live(&self, now: u64) -> bool {
        self.expire_at > now
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// TRAITS
// ════════════════════════════════════════════════════════════════════════════════

/// Allocation lookup by transaction id.
#[async_trait]
pub trait AllocationSource: Send + Sync {
    async fn get_allocation(&self, allocation_tx: &str) -> Result<AllocationInfo, ChainError>;
}

/// Read and write pool lookups.
///
/// Returns every pool of the triple, expired ones included; callers filter.
#[async_trait]
pub trait PoolSource: Send + Sync {
    async fn get_read_pools(
        &self,
        client_id: &str,
        allocation_id: &str,
        blobber_id: &str,
    ) -> Result<Vec<PoolBalance>, ChainError>;

    async fn get_write_pools(
        &self,
        client_id: &str,
        allocation_id: &str,
        blobber_id: &str,
    ) -> Result<Vec<PoolBalance>, ChainError>;
}

/// Sum of balances of pools still live at `now`.
pub fn live_balance(pools: &[PoolBalance], now: u64) -> u64 {
    pools
        .iter()
        .filter(|p| p.is_live(now))
        .fold(0u64, |acc, p| acc.saturating_add(p.balance))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_balance_skips_expired() {
        let pools = vec![
            PoolBalance { pool_id: "a".into(), balance: 10, expire_at: 100 },
            PoolBalance { pool_id: "b".into(), balance: 5, expire_at: 50 },
            PoolBalance { pool_id: "c".into(), balance: u64::MAX, expire_at: 200 },
        ];
        assert_eq!(live_balance(&pools, 60), u64::MAX);
        assert_eq!(live_balance(&pools[..2], 60), 10);
        assert_eq!(live_balance(&pools[..2], 100), 0);
    }
}
