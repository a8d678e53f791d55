//! # Blobber Metadata Database
//!
//! LMDB environment holding every table of the protocol. Values are bincode
//! encoded; keys are UTF-8 strings.
//!
//! A commit attempt runs inside exactly one read-write transaction
//! ([`BlobberDb::write`]): the closure either returns `Ok` and every write
//! lands, or returns `Err` and the transaction is aborted. Nothing partial is
//! ever visible to readers.
//!
//! LMDB allows one transaction per thread at a time. Callers never open a
//! read transaction while holding a write transaction; everything a commit
//! needs is read through the write transaction itself.

use std::path::Path;
use std::sync::Arc;

use lmdb::{
    Cursor, Database, DatabaseFlags, Environment, EnvironmentFlags, RwTransaction, Transaction,
    WriteFlags,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::BlobberError;

// ════════════════════════════════════════════════════════════════════════════
// BUCKET NAMES
// ════════════════════════════════════════════════════════════════════════════
// Key formats:
//   allocations     {allocation_id}
//   allocation_tx   {allocation_tx}                       -> allocation_id
//   connections     {connection_id}
//   write_markers   {allocation_id}/{seq:020}             (append-only)
//   read_markers    {client_id}                           (overwritten)
//   pending         {client_id}:{allocation_id}:{blobber_id}
//   read_pools      {client_id}:{allocation_id}:{blobber_id}
//   write_pools     {client_id}:{allocation_id}:{blobber_id}
//   read_redeems    {client_id}:{allocation_id}:{counter:020}
//   write_redeems   {signature}
//   refs            {lookup_hash}
//   collaborators   {lookup_hash}:{client_id}
//   share_info      {client_id}:{file_path_hash}
// ════════════════════════════════════════════════════════════════════════════

pub const BUCKET_ALLOCATIONS: &str = "allocations";
pub const BUCKET_ALLOCATION_TX: &str = "allocation_tx";
pub const BUCKET_CONNECTIONS: &str = "connections";
pub const BUCKET_WRITE_MARKERS: &str = "write_markers";
pub const BUCKET_READ_MARKERS: &str = "read_markers";
pub const BUCKET_PENDING: &str = "pending";
pub const BUCKET_READ_POOLS: &str = "read_pools";
pub const BUCKET_WRITE_POOLS: &str = "write_pools";
pub const BUCKET_READ_REDEEMS: &str = "read_redeems";
pub const BUCKET_WRITE_REDEEMS: &str = "write_redeems";
pub const BUCKET_REFS: &str = "refs";
pub const BUCKET_COLLABORATORS: &str = "collaborators";
pub const BUCKET_SHARE_INFO: &str = "share_info";

/// Named database handles. Copyable; valid for the lifetime of the env.
#[derive(Debug, Clone, Copy)]
pub struct Buckets {
    pub allocations: Database,
    pub allocation_tx: Database,
    pub connections: Database,
    pub write_markers: Database,
    pub read_markers: Database,
    pub pending: Database,
    pub read_pools: Database,
    pub write_pools: Database,
    pub read_redeems: Database,
    pub write_redeems: Database,
    pub refs: Database,
    pub collaborators: Database,
    pub share_info: Database,
}

#[derive(Debug, Clone)]
pub struct BlobberDb {
    env: Arc<Environment>,
    buckets: Buckets,
}

impl BlobberDb {
    /// Open LMDB environment at path, create named DBs
    pub fn open(path: impl AsRef<Path>, map_size: usize) -> Result<Self, BlobberError> {
        let p = path.as_ref();
        std::fs::create_dir_all(p)?;

        let env = Environment::new()
            .set_flags(EnvironmentFlags::NO_TLS)
            .set_max_dbs(16)
            .set_map_size(map_size)
            .open(p)?;

        let create = |name: &str| env.create_db(Some(name), DatabaseFlags::empty());
        let buckets = Buckets {
            allocations: create(BUCKET_ALLOCATIONS)?,
            allocation_tx: create(BUCKET_ALLOCATION_TX)?,
            connections: create(BUCKET_CONNECTIONS)?,
            write_markers: create(BUCKET_WRITE_MARKERS)?,
            read_markers: create(BUCKET_READ_MARKERS)?,
            pending: create(BUCKET_PENDING)?,
            read_pools: create(BUCKET_READ_POOLS)?,
            write_pools: create(BUCKET_WRITE_POOLS)?,
            read_redeems: create(BUCKET_READ_REDEEMS)?,
            write_redeems: create(BUCKET_WRITE_REDEEMS)?,
            refs: create(BUCKET_REFS)?,
            collaborators: create(BUCKET_COLLABORATORS)?,
            share_info: create(BUCKET_SHARE_INFO)?,
        };

        debug!(path = %p.display(), map_size, "blobber db opened");
        Ok(Self { env: Arc::new(env), buckets })
    }

    pub fn buckets(&self) -> &Buckets {
        &self.buckets
    }

    /// Run `f` in a read-write transaction. `Ok` commits, `Err` aborts.
    pub fn write<T, F>(&self, f: F) -> Result<T, BlobberError>
    where
        F: FnOnce(&mut RwTransaction<'_>, &Buckets) -> Result<T, BlobberError>,
    {
        let mut txn = self.env.begin_rw_txn()?;
        match f(&mut txn, &self.buckets) {
            Ok(v) => {
                txn.commit()?;
                Ok(v)
            }
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }

    /// Run `f` in a read-write transaction that is always aborted.
    /// Used for dry runs (root previews).
    pub fn dry_run<T, F>(&self, f: F) -> Result<T, BlobberError>
    where
        F: FnOnce(&mut RwTransaction<'_>, &Buckets) -> Result<T, BlobberError>,
    {
        let mut txn = self.env.begin_rw_txn()?;
        let out = f(&mut txn, &self.buckets);
        txn.abort();
        out
    }

    /// Run `f` in a read-only transaction.
    pub fn read<T, F>(&self, f: F) -> Result<T, BlobberError>
    where
        F: FnOnce(&lmdb::RoTransaction<'_>, &Buckets) -> Result<T, BlobberError>,
    {
        let txn = self.env.begin_ro_txn()?;
        let out = f(&txn, &self.buckets);
        txn.abort();
        out
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TYPED HELPERS
// ════════════════════════════════════════════════════════════════════════════

/// Fetch and decode one value.
pub fn get_value<T, Tx>(txn: &Tx, db: Database, key: &str) -> Result<Option<T>, BlobberError>
where
    T: DeserializeOwned,
    Tx: Transaction,
{
    match txn.get(db, &key.as_bytes()) {
        Ok(raw) => Ok(Some(bincode::deserialize(raw)?)),
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Encode and store one value, replacing any previous one.
pub fn put_value<T: Serialize>(
    txn: &mut RwTransaction<'_>,
    db: Database,
    key: &str,
    value: &T,
) -> Result<(), BlobberError> {
    let blob = bincode::serialize(value)?;
    txn.put(db, &key.as_bytes(), &blob, WriteFlags::empty())?;
    Ok(())
}

/// Delete a key. Returns whether it existed.
pub fn delete_key(txn: &mut RwTransaction<'_>, db: Database, key: &str) -> Result<bool, BlobberError> {
    match txn.del(db, &key.as_bytes(), None) {
        Ok(()) => Ok(true),
        Err(lmdb::Error::NotFound) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Decode every entry whose key starts with `prefix`, in key order.
pub fn scan_prefix<T, Tx>(txn: &Tx, db: Database, prefix: &str) -> Result<Vec<(String, T)>, BlobberError>
where
    T: DeserializeOwned,
    Tx: Transaction,
{
    let mut out = Vec::new();
    let mut cursor = txn.open_ro_cursor(db)?;
    for (key, val) in cursor.iter() {
        if key.starts_with(prefix.as_bytes()) {
            let k = String::from_utf8_lossy(key).into_owned();
            out.push((k, bincode::deserialize(val)?));
        }
    }
    Ok(out)
}

/// Delete every entry whose key starts with `prefix`. Returns the count.
pub fn delete_prefix(txn: &mut RwTransaction<'_>, db: Database, prefix: &str) -> Result<usize, BlobberError> {
    let mut del_keys = Vec::new();
    {
        let mut cursor = txn.open_ro_cursor(db)?;
        for (key, _val) in cursor.iter() {
            if key.starts_with(prefix.as_bytes()) {
                del_keys.push(key.to_vec());
            }
        }
    }
    for key in &del_keys {
        txn.del(db, key, None)?;
    }
    Ok(del_keys.len())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// 64 MiB is plenty for tests and keeps the sparse file small.
    pub const TEST_MAP_SIZE: usize = 64 * 1024 * 1024;

    pub fn temp_db() -> (TempDir, BlobberDb) {
        let tmp = TempDir::new().expect("tmpdir");
        let db = BlobberDb::open(tmp.path().join("db"), TEST_MAP_SIZE).expect("open db");
        (tmp, db)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::temp_db;
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let (_tmp, db) = temp_db();
        db.write(|txn, b| put_value(txn, b.pending, "k1", &42u64)).expect("put");
        let v: Option<u64> = db.read(|txn, b| get_value(txn, b.pending, "k1")).expect("get");
        assert_eq!(v, Some(42));

        let existed = db.write(|txn, b| delete_key(txn, b.pending, "k1")).expect("del");
        assert!(existed);
        let existed = db.write(|txn, b| delete_key(txn, b.pending, "k1")).expect("del again");
        assert!(!existed);
    }

    #[test]
    fn test_failed_write_is_rolled_back() {
        let (_tmp, db) = temp_db();
        let res: Result<(), BlobberError> = db.write(|txn, b| {
            put_value(txn, b.pending, "a", &1u64)?;
            Err(BlobberError::Internal("boom".into()))
        });
        assert!(res.is_err());
        let v: Option<u64> = db.read(|txn, b| get_value(txn, b.pending, "a")).expect("get");
        assert_eq!(v, None);
    }

    #[test]
    fn test_dry_run_never_commits() {
        let (_tmp, db) = temp_db();
        let seen = db
            .dry_run(|txn, b| {
                put_value(txn, b.pending, "a", &7u64)?;
                get_value::<u64, _>(txn, b.pending, "a")
            })
            .expect("dry run");
        assert_eq!(seen, Some(7));
        let v: Option<u64> = db.read(|txn, b| get_value(txn, b.pending, "a")).expect("get");
        assert_eq!(v, None);
    }

    #[test]
    fn test_prefix_scan_and_delete() {
        let (_tmp, db) = temp_db();
        db.write(|txn, b| {
            put_value(txn, b.write_markers, "alloc1/00000000000000000002", &2u64)?;
            put_value(txn, b.write_markers, "alloc1/00000000000000000001", &1u64)?;
            put_value(txn, b.write_markers, "alloc2/00000000000000000001", &9u64)
        })
        .expect("seed");

        let rows: Vec<(String, u64)> = db
            .read(|txn, b| scan_prefix(txn, b.write_markers, "alloc1/"))
            .expect("scan");
        assert_eq!(rows.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec![1, 2]);

        let n = db.write(|txn, b| delete_prefix(txn, b.write_markers, "alloc1/")).expect("delete");
        assert_eq!(n, 2);
        let rows: Vec<(String, u64)> = db
            .read(|txn, b| scan_prefix(txn, b.write_markers, ""))
            .expect("scan all");
        assert_eq!(rows.len(), 1);
    }
}
