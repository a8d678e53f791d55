//! # Pending / Pool Accounting
//!
//! Local pre-redeem bookkeeping against the client's token pools.
//!
//! ```text
//! have = Σ live cached pool balances − pending
//!
//! reserve (async, no txn held)          apply (inside the caller's rw txn)
//!   cached snapshot fresh & have ≥ want    re-read pending, re-check have ≥ want
//!   else refetch pools from chain          persist refreshed snapshot
//!   have < want → NotEnoughTokens          pending += want
//! ```
//!
//! Reservation is split in two so the chain round trip never happens inside
//! an LMDB transaction, while the pending increment lands atomically with the
//! read marker or the commit it pays for.

use std::sync::Arc;
use std::time::Duration;

use lmdb::{Database, RwTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use blobber_storage::BLOCK_SIZE;

use crate::chain::{live_balance, PoolBalance, PoolSource};
use crate::db::{get_value, put_value, BlobberDb, Buckets};
use crate::error::BlobberError;
use crate::now_secs;
use crate::redeem::{record_read, ReadRedeem};

/// Prices are quoted per GiB.
pub const GB: u128 = 1 << 30;

/// Tokens owed for reading `num_blocks` blocks at `read_price` per GB.
pub fn read_cost(read_price: u64, num_blocks: u64) -> u64 {
    let v = read_price as u128 * num_blocks as u128 * BLOCK_SIZE as u128 / GB;
    v.min(u64::MAX as u128) as u64
}

/// Tokens owed for writing `size` bytes at `write_price` per GB. Shrinking
/// writes cost nothing.
pub fn write_cost(write_price: u64, size: i64) -> u64 {
    if size <= 0 {
        return 0;
    }
    let v = write_price as u128 * size as u128 / GB;
    v.min(u64::MAX as u128) as u64
}

pub fn pending_key(client_id: &str, allocation_id: &str, blobber_id: &str) -> String {
    format!("{}:{}:{}", client_id, allocation_id, blobber_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Read,
    Write,
}

impl PoolKind {
    fn bucket(&self, b: &Buckets) -> Database {
        match self {
            PoolKind::Read => b.read_pools,
            PoolKind::Write => b.write_pools,
        }
    }
}

/// Amounts reserved locally and not yet redeemed on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Pending {
    pub client_id: String,
    pub allocation_id: String,
    pub blobber_id: String,
    pub pending_read: u64,
    pub pending_write: u64,
}

impl Pending {
    pub fn amount(&self, kind: PoolKind) -> u64 {
        match kind {
            PoolKind::Read => self.pending_read,
            PoolKind::Write => self.pending_write,
        }
    }

    fn add(&mut self, kind: PoolKind, value: u64) {
        match kind {
            PoolKind::Read => self.pending_read = self.pending_read.saturating_add(value),
            PoolKind::Write => self.pending_write = self.pending_write.saturating_add(value),
        }
    }

    pub(crate) fn release(&mut self, kind: PoolKind, value: u64) {
        match kind {
            PoolKind::Read => self.pending_read = self.pending_read.saturating_sub(value),
            PoolKind::Write => self.pending_write = self.pending_write.saturating_sub(value),
        }
    }
}

/// Cached pools of one (client, allocation, blobber) triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub pools: Vec<PoolBalance>,
    pub fetched_at: u64,
}

impl PoolSnapshot {
    fn is_fresh(&self, now: u64, ttl: Duration) -> bool {
        now < self.fetched_at.saturating_add(ttl.as_secs())
    }
}

/// Outcome of [`PoolAccounting::reserve`], applied later inside a write
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub kind: PoolKind,
    pub client_id: String,
    pub allocation_id: String,
    pub want: u64,
    /// Pools fetched from the chain during reservation, persisted on apply.
    pub refreshed: Option<PoolSnapshot>,
}

impl Reservation {
    pub fn is_free(&self) -> bool {
        self.want == 0
    }
}

pub struct PoolAccounting {
    db: BlobberDb,
    chain: Arc<dyn PoolSource>,
    blobber_id: String,
    cache_ttl: Duration,
}

impl std::fmt::Debug for PoolAccounting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolAccounting")
            .field("blobber_id", &self.blobber_id)
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

impl PoolAccounting {
    pub fn new(db: BlobberDb, chain: Arc<dyn PoolSource>, blobber_id: impl Into<String>, cache_ttl: Duration) -> Self {
        Self { db, chain, blobber_id: blobber_id.into(), cache_ttl }
    }

    pub fn blobber_id(&self) -> &str {
        &self.blobber_id
    }

    pub async fn reserve_read(
        &self,
        client_id: &str,
        allocation_id: &str,
        read_price: u64,
        num_blocks: u64,
    ) -> Result<Reservation, BlobberError> {
        self.reserve(PoolKind::Read, client_id, allocation_id, read_cost(read_price, num_blocks)).await
    }

    pub async fn reserve_write(
        &self,
        client_id: &str,
        allocation_id: &str,
        write_price: u64,
        size: i64,
    ) -> Result<Reservation, BlobberError> {
        self.reserve(PoolKind::Write, client_id, allocation_id, write_cost(write_price, size)).await
    }

    /// Make sure `want` tokens are available, refetching pools when the
    /// cache is stale or short. Mutates nothing.
    pub async fn reserve(
        &self,
        kind: PoolKind,
        client_id: &str,
        allocation_id: &str,
        want: u64,
    ) -> Result<Reservation, BlobberError> {
        let mut reservation = Reservation {
            kind,
            client_id: client_id.to_string(),
            allocation_id: allocation_id.to_string(),
            want,
            refreshed: None,
        };
        if want == 0 {
            return Ok(reservation);
        }

        let now = now_secs();
        let key = pending_key(client_id, allocation_id, &self.blobber_id);
        let (pending, cached) = self.db.read(|txn, b| {
            let pending: Option<Pending> = get_value(txn, b.pending, &key)?;
            let cached: Option<PoolSnapshot> = get_value(txn, kind.bucket(b), &key)?;
            Ok((pending.unwrap_or_default(), cached))
        })?;
        let reserved = pending.amount(kind);

        if let Some(snap) = cached.as_ref().filter(|s| s.is_fresh(now, self.cache_ttl)) {
            if live_balance(&snap.pools, now).saturating_sub(reserved) >= want {
                return Ok(reservation);
            }
        }

        let pools = match kind {
            PoolKind::Read => self.chain.get_read_pools(client_id, allocation_id, &self.blobber_id).await?,
            PoolKind::Write => self.chain.get_write_pools(client_id, allocation_id, &self.blobber_id).await?,
        };
        let have = live_balance(&pools, now).saturating_sub(reserved);
        debug!(client = client_id, allocation = allocation_id, ?kind, want, have, "pools refreshed");
        if have < want {
            return Err(BlobberError::NotEnoughTokens { want, have });
        }
        reservation.refreshed = Some(PoolSnapshot { pools, fetched_at: now });
        Ok(reservation)
    }

    /// Persist a reservation inside the caller's transaction. Balance is
    /// checked again against pending as it stands in this transaction.
    pub fn apply(&self, txn: &mut RwTransaction<'_>, b: &Buckets, r: &Reservation) -> Result<(), BlobberError> {
        if r.is_free() {
            return Ok(());
        }
        let now = now_secs();
        let key = pending_key(&r.client_id, &r.allocation_id, &self.blobber_id);
        let bucket = r.kind.bucket(b);

        let snapshot = match &r.refreshed {
            Some(s) => {
                put_value(txn, bucket, &key, s)?;
                s.clone()
            }
            None => get_value::<PoolSnapshot, _>(&*txn, bucket, &key)?
                .ok_or(BlobberError::NotEnoughTokens { want: r.want, have: 0 })?,
        };
        let mut pending: Pending = get_value(&*txn, b.pending, &key)?.unwrap_or_else(|| Pending {
            client_id: r.client_id.clone(),
            allocation_id: r.allocation_id.clone(),
            blobber_id: self.blobber_id.clone(),
            ..Default::default()
        });

        let have = live_balance(&snapshot.pools, now).saturating_sub(pending.amount(r.kind));
        if have < r.want {
            return Err(BlobberError::NotEnoughTokens { want: r.want, have });
        }
        pending.add(r.kind, r.want);
        put_value(txn, b.pending, &key, &pending)
    }

    /// Standalone read pre-redeem: reserve and persist in one step, with an
    /// audit row keyed by `counter`. Returns the reserved amount.
    pub async fn pre_redeem_read(
        &self,
        client_id: &str,
        allocation_id: &str,
        read_price: u64,
        num_blocks: u64,
        counter: u64,
    ) -> Result<u64, BlobberError> {
        let r = self.reserve_read(client_id, allocation_id, read_price, num_blocks).await?;
        if r.is_free() {
            return Ok(0);
        }
        let row = ReadRedeem::new(client_id, allocation_id, &self.blobber_id, counter, r.want, now_secs());
        self.db.write(|txn, b| {
            self.apply(txn, b, &r)?;
            record_read(txn, b, &row)
        })?;
        info!(client = client_id, allocation = allocation_id, counter, value = r.want, "read pre-redeemed");
        Ok(r.want)
    }

    pub fn pending(&self, client_id: &str, allocation_id: &str) -> Result<Pending, BlobberError> {
        let key = pending_key(client_id, allocation_id, &self.blobber_id);
        Ok(self.db.read(|txn, b| get_value::<Pending, _>(txn, b.pending, &key))?.unwrap_or_default())
    }
}
