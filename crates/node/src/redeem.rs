//! Redemption ledger: audit rows written alongside every paid read or write,
//! and their settlement once the chain has redeemed them.

use lmdb::{RwTransaction, Transaction};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::allocation::{load_allocation, save_allocation};
use crate::db::{get_value, put_value, scan_prefix, BlobberDb, Buckets};
use crate::error::BlobberError;
use crate::pools::{pending_key, Pending, PoolKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRedeem {
    pub client_id: String,
    pub allocation_id: String,
    pub blobber_id: String,
    pub counter: u64,
    pub value: u64,
    pub created_at: u64,
    pub redeemed: bool,
}

impl ReadRedeem {
    pub fn new(client_id: &str, allocation_id: &str, blobber_id: &str, counter: u64, value: u64, now: u64) -> Self {
        Self {
            client_id: client_id.to_string(),
            allocation_id: allocation_id.to_string(),
            blobber_id: blobber_id.to_string(),
            counter,
            value,
            created_at: now,
            redeemed: false,
        }
    }

    fn key(&self) -> String {
        read_key(&self.client_id, &self.allocation_id, self.counter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRedeem {
    /// Signature of the write marker paid for.
    pub signature: String,
    pub client_id: String,
    pub allocation_id: String,
    pub blobber_id: String,
    pub size: i64,
    pub value: u64,
    pub created_at: u64,
    pub redeemed: bool,
}

fn read_key(client_id: &str, allocation_id: &str, counter: u64) -> String {
    format!("{}:{}:{:020}", client_id, allocation_id, counter)
}

pub fn record_read(txn: &mut RwTransaction<'_>, b: &Buckets, row: &ReadRedeem) -> Result<(), BlobberError> {
    put_value(txn, b.read_redeems, &row.key(), row)
}

pub fn record_write(txn: &mut RwTransaction<'_>, b: &Buckets, row: &WriteRedeem) -> Result<(), BlobberError> {
    put_value(txn, b.write_redeems, &row.signature, row)
}

fn release_pending(
    txn: &mut RwTransaction<'_>,
    b: &Buckets,
    kind: PoolKind,
    client_id: &str,
    allocation_id: &str,
    blobber_id: &str,
    value: u64,
) -> Result<(), BlobberError> {
    let key = pending_key(client_id, allocation_id, blobber_id);
    if let Some(mut pending) = get_value::<Pending, _>(&*txn, b.pending, &key)? {
        pending.release(kind, value);
        put_value(txn, b.pending, &key, &pending)?;
    }
    Ok(())
}

fn unredeemed_writes_in<Tx: Transaction>(
    txn: &Tx,
    b: &Buckets,
    allocation_id: &str,
) -> Result<Vec<WriteRedeem>, BlobberError> {
    Ok(scan_prefix::<WriteRedeem, _>(txn, b.write_redeems, "")?
        .into_iter()
        .map(|(_, r)| r)
        .filter(|r| !r.redeemed && r.allocation_id == allocation_id)
        .collect())
}

#[derive(Debug, Clone)]
pub struct RedeemLedger {
    db: BlobberDb,
}

impl RedeemLedger {
    pub fn new(db: BlobberDb) -> Self {
        Self { db }
    }

    /// Mark a read redeemed and release its pending amount. Returns `false`
    /// when it was already settled.
    pub fn settle_read(&self, client_id: &str, allocation_id: &str, counter: u64) -> Result<bool, BlobberError> {
        let key = read_key(client_id, allocation_id, counter);
        let settled = self.db.write(|txn, b| {
            let mut row: ReadRedeem = get_value(&*txn, b.read_redeems, &key)?
                .ok_or_else(|| BlobberError::InvalidParameters(format!("no read redeem for counter {}", counter)))?;
            if row.redeemed {
                return Ok(false);
            }
            row.redeemed = true;
            put_value(txn, b.read_redeems, &key, &row)?;
            release_pending(txn, b, PoolKind::Read, &row.client_id, &row.allocation_id, &row.blobber_id, row.value)?;
            Ok(true)
        })?;
        if settled {
            info!(client = client_id, allocation = allocation_id, counter, "read redeemed");
        }
        Ok(settled)
    }

    /// Mark a write redeemed, release its pending amount, and clear the
    /// allocation's redeem flag when nothing else is outstanding.
    pub fn settle_write(&self, signature: &str) -> Result<bool, BlobberError> {
        let settled = self.db.write(|txn, b| {
            let mut row: WriteRedeem = get_value(&*txn, b.write_redeems, signature)?
                .ok_or_else(|| BlobberError::InvalidParameters("no write redeem for signature".into()))?;
            if row.redeemed {
                return Ok(None);
            }
            row.redeemed = true;
            put_value(txn, b.write_redeems, signature, &row)?;
            release_pending(txn, b, PoolKind::Write, &row.client_id, &row.allocation_id, &row.blobber_id, row.value)?;

            if unredeemed_writes_in(&*txn, b, &row.allocation_id)?.is_empty() {
                if let Some(mut alloc) = load_allocation(&*txn, b, &row.allocation_id)? {
                    alloc.is_redeem_required = false;
                    save_allocation(txn, b, &alloc)?;
                }
            }
            Ok(Some(row.allocation_id))
        })?;
        match settled {
            Some(allocation_id) => {
                info!(allocation = %allocation_id, "write redeemed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn unredeemed_reads(&self, allocation_id: &str) -> Result<Vec<ReadRedeem>, BlobberError> {
        let rows: Vec<(String, ReadRedeem)> = self.db.read(|txn, b| scan_prefix(txn, b.read_redeems, ""))?;
        Ok(rows
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| !r.redeemed && r.allocation_id == allocation_id)
            .collect())
    }

    pub fn unredeemed_writes(&self, allocation_id: &str) -> Result<Vec<WriteRedeem>, BlobberError> {
        self.db.read(|txn, b| unredeemed_writes_in(txn, b, allocation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;

    #[test]
    fn test_settle_read_releases_pending_once() {
        let (_tmp, db) = temp_db();
        db.write(|txn, b| {
            let pending = Pending {
                client_id: "c".into(),
                allocation_id: "a".into(),
                blobber_id: "bl".into(),
                pending_read: 100,
                pending_write: 0,
            };
            put_value(txn, b.pending, &pending_key("c", "a", "bl"), &pending)?;
            record_read(txn, b, &ReadRedeem::new("c", "a", "bl", 3, 60, 1))
        })
        .expect("seed");

        let ledger = RedeemLedger::new(db.clone());
        assert_eq!(ledger.unredeemed_reads("a").expect("list").len(), 1);
        assert!(ledger.settle_read("c", "a", 3).expect("settle"));
        assert!(!ledger.settle_read("c", "a", 3).expect("settle again"));
        assert!(ledger.unredeemed_reads("a").expect("list").is_empty());

        let pending: Pending = db
            .read(|txn, b| get_value(txn, b.pending, &pending_key("c", "a", "bl")))
            .expect("read")
            .expect("row");
        assert_eq!(pending.pending_read, 40);

        assert_eq!(ledger.settle_read("c", "a", 99).unwrap_err().code(), "invalid_parameters");
    }
}
