//! # Allocation Registry
//!
//! Node-local view of allocations. Contract terms come from the chain
//! ([`AllocationSource`]); ledger fields are owned by this node and change
//! only inside a commit transaction.
//!
//! ```text
//! verify_allocation(tx)
//!   ├─ allocation_tx[tx] → allocations[id]   (hit: expiry check, done)
//!   └─ miss → chain.get_allocation(tx)        (no txn held across await)
//!            → rw txn: merge terms, keep ledger fields, index tx
//! ```

use std::sync::Arc;

use lmdb::{RwTransaction, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chain::{AllocationInfo, AllocationSource};
use crate::db::{get_value, put_value, BlobberDb, Buckets};
use crate::error::BlobberError;
use crate::now_secs;
use crate::write_marker::WriteMarker;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub tx: String,
    pub owner_id: String,
    pub owner_public_key: String,
    pub payer_id: String,
    pub repairer_id: String,
    pub total_size: u64,
    pub blobber_size: u64,
    pub blobber_size_used: u64,
    pub used_size: u64,
    /// Ledger head. Empty before the first commit.
    pub allocation_root: String,
    pub expiration: u64,
    pub is_redeem_required: bool,
    pub read_price: u64,
    pub write_price: u64,
    pub commit_count: u64,
    pub latest_write_marker: Option<WriteMarker>,
    pub updated_at: u64,
}

impl Allocation {
    pub fn from_info(info: &AllocationInfo) -> Self {
        Self {
            id: info.id.clone(),
            tx: info.tx.clone(),
            owner_id: info.owner_id.clone(),
            owner_public_key: info.owner_public_key.clone(),
            payer_id: info.payer_id.clone(),
            repairer_id: info.repairer_id.clone(),
            total_size: info.total_size,
            blobber_size: info.blobber_size,
            blobber_size_used: 0,
            used_size: 0,
            allocation_root: String::new(),
            expiration: info.expiration,
            is_redeem_required: false,
            read_price: info.read_price,
            write_price: info.write_price,
            commit_count: 0,
            latest_write_marker: None,
            updated_at: now_secs(),
        }
    }

    /// Overwrite contract terms from the chain, keeping ledger fields.
    pub fn refresh_terms(&mut self, info: &AllocationInfo) {
        self.tx = info.tx.clone();
        self.owner_id = info.owner_id.clone();
        self.owner_public_key = info.owner_public_key.clone();
        self.payer_id = info.payer_id.clone();
        self.repairer_id = info.repairer_id.clone();
        self.total_size = info.total_size;
        self.blobber_size = info.blobber_size;
        self.expiration = info.expiration;
        self.read_price = info.read_price;
        self.write_price = info.write_price;
        self.updated_at = now_secs();
    }

    pub fn is_owner(&self, client_id: &str) -> bool {
        !client_id.is_empty() && self.owner_id == client_id
    }

    /// Owner, payer or repairer may mutate the allocation.
    pub fn can_write(&self, client_id: &str) -> bool {
        if client_id.is_empty() {
            return false;
        }
        self.owner_id == client_id || self.payer_id == client_id || self.repairer_id == client_id
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration <= now
    }

    /// Whether `delta` more bytes fit on top of `staged` already pending.
    pub fn fits(&self, staged: i64, delta: i64) -> bool {
        let projected = self.blobber_size_used as i128 + staged as i128 + delta as i128;
        projected <= self.blobber_size as i128
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TRANSACTION HELPERS
// ════════════════════════════════════════════════════════════════════════════

pub fn load_allocation<Tx: Transaction>(
    txn: &Tx,
    b: &Buckets,
    allocation_id: &str,
) -> Result<Option<Allocation>, BlobberError> {
    get_value(txn, b.allocations, allocation_id)
}

pub fn load_allocation_by_tx<Tx: Transaction>(
    txn: &Tx,
    b: &Buckets,
    allocation_tx: &str,
) -> Result<Option<Allocation>, BlobberError> {
    match get_value::<String, _>(txn, b.allocation_tx, allocation_tx)? {
        Some(id) => load_allocation(txn, b, &id),
        None => Ok(None),
    }
}

pub fn save_allocation(txn: &mut RwTransaction<'_>, b: &Buckets, alloc: &Allocation) -> Result<(), BlobberError> {
    put_value(txn, b.allocations, &alloc.id, alloc)?;
    put_value(txn, b.allocation_tx, &alloc.tx, &alloc.id)
}

// ════════════════════════════════════════════════════════════════════════════
// REGISTRY
// ════════════════════════════════════════════════════════════════════════════

pub struct AllocationRegistry {
    db: BlobberDb,
    chain: Arc<dyn AllocationSource>,
}

impl std::fmt::Debug for AllocationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationRegistry").finish_non_exhaustive()
    }
}

impl AllocationRegistry {
    pub fn new(db: BlobberDb, chain: Arc<dyn AllocationSource>) -> Self {
        Self { db, chain }
    }

    /// Resolve an allocation by transaction id, fetching it from the chain on
    /// first reference. Expired allocations are rejected.
    pub async fn verify_allocation(&self, allocation_tx: &str) -> Result<Allocation, BlobberError> {
        if allocation_tx.is_empty() {
            return Err(BlobberError::InvalidParameters("missing allocation".into()));
        }
        let cached = self.db.read(|txn, b| load_allocation_by_tx(txn, b, allocation_tx))?;
        let alloc = match cached {
            Some(a) => a,
            None => self.refresh(allocation_tx).await?,
        };
        if alloc.is_expired(now_secs()) {
            return Err(BlobberError::InvalidParameters(format!("allocation {} is expired", alloc.id)));
        }
        Ok(alloc)
    }

    /// Fetch contract terms from the chain and merge them into the local row.
    pub async fn refresh(&self, allocation_tx: &str) -> Result<Allocation, BlobberError> {
        let info = self.chain.get_allocation(allocation_tx).await?;
        if info.id.is_empty() || info.tx != allocation_tx {
            return Err(BlobberError::RequestError(format!(
                "chain returned inconsistent allocation for tx {}",
                allocation_tx
            )));
        }

        let alloc = self.db.write(|txn, b| {
            let merged = match load_allocation(&*txn, b, &info.id)? {
                Some(mut existing) => {
                    existing.refresh_terms(&info);
                    existing
                }
                None => {
                    info!(allocation = %info.id, tx = allocation_tx, "allocation registered");
                    Allocation::from_info(&info)
                }
            };
            save_allocation(txn, b, &merged)?;
            Ok(merged)
        })?;
        debug!(allocation = %alloc.id, blobber_size = alloc.blobber_size, "allocation refreshed");
        Ok(alloc)
    }

    /// Local row by id, without touching the chain.
    pub fn get(&self, allocation_id: &str) -> Result<Option<Allocation>, BlobberError> {
        self.db.read(|txn, b| load_allocation(txn, b, allocation_id))
    }
}
