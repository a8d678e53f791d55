//! # Connection (Change Collector)
//!
//! A connection is a client-scoped staging transaction. Commands upsert one
//! [`AllocationChange`] per `(produced path, operation)`; the commit engine
//! replays them in staging order. A path claimed by one operation cannot be
//! claimed by another in the same connection.
//!
//! ```text
//! New ──stage──▶ InProgress ──commit──▶ Committed
//!  │                 │
//!  └──── sweep ──────┴──────────────▶ Deleted
//! ```

use lmdb::{RwTransaction, Transaction};
use serde::{Deserialize, Serialize};

use crate::db::{get_value, put_value, scan_prefix, Buckets};
use crate::error::BlobberError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    New,
    InProgress,
    Committed,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Rename,
    Copy,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Rename => "rename",
            Operation::Copy => "copy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationChange {
    pub connection_id: String,
    /// Lookup hash of the path this change produces. With `operation`, the
    /// upsert key.
    pub lookup_hash: String,
    pub operation: Operation,
    /// Signed byte delta.
    pub size: i64,
    /// bincode-encoded [`crate::commands::FileChange`].
    pub input: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationConnection {
    pub connection_id: String,
    pub allocation_id: String,
    pub client_id: String,
    /// Σ change sizes.
    pub size: i64,
    pub status: ConnectionStatus,
    pub changes: Vec<AllocationChange>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl AllocationConnection {
    pub fn new(connection_id: &str, allocation_id: &str, client_id: &str, now: u64) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            allocation_id: allocation_id.to_string(),
            client_id: client_id.to_string(),
            size: 0,
            status: ConnectionStatus::New,
            changes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, ConnectionStatus::New | ConnectionStatus::InProgress)
    }

    /// The change that claims `lookup_hash`, whatever its operation.
    pub fn change(&self, lookup_hash: &str) -> Option<&AllocationChange> {
        self.changes.iter().find(|c| c.lookup_hash == lookup_hash)
    }

    /// Replace the change for the same path and operation in place, else
    /// append.
    pub fn upsert_change(&mut self, change: AllocationChange, now: u64) {
        let slot = self
            .changes
            .iter_mut()
            .find(|c| c.lookup_hash == change.lookup_hash && c.operation == change.operation);
        match slot {
            Some(existing) => *existing = change,
            None => self.changes.push(change),
        }
        self.size = self.changes.iter().map(|c| c.size).sum();
        self.status = ConnectionStatus::InProgress;
        self.updated_at = now;
    }

    /// Size staged by everything except the change an upsert of
    /// `(lookup_hash, operation)` would replace.
    pub fn size_excluding(&self, lookup_hash: &str, operation: Operation) -> i64 {
        self.changes
            .iter()
            .filter(|c| !(c.lookup_hash == lookup_hash && c.operation == operation))
            .map(|c| c.size)
            .sum()
    }
}

pub fn load_connection<Tx: Transaction>(
    txn: &Tx,
    b: &Buckets,
    connection_id: &str,
) -> Result<Option<AllocationConnection>, BlobberError> {
    get_value(txn, b.connections, connection_id)
}

pub fn save_connection(
    txn: &mut RwTransaction<'_>,
    b: &Buckets,
    conn: &AllocationConnection,
) -> Result<(), BlobberError> {
    put_value(txn, b.connections, &conn.connection_id, conn)
}

/// Load an active connection bound to `(allocation_id, client_id)`, or start
/// a new one. A connection id bound elsewhere, or already closed, is refused.
pub fn open_connection<Tx: Transaction>(
    txn: &Tx,
    b: &Buckets,
    connection_id: &str,
    allocation_id: &str,
    client_id: &str,
    now: u64,
) -> Result<AllocationConnection, BlobberError> {
    if connection_id.is_empty() {
        return Err(BlobberError::InvalidParameters("missing connection id".into()));
    }
    match load_connection(txn, b, connection_id)? {
        Some(conn) => {
            if conn.allocation_id != allocation_id || conn.client_id != client_id {
                return Err(BlobberError::InvalidParameters(format!(
                    "connection {} belongs to another allocation or client",
                    connection_id
                )));
            }
            if !conn.is_active() {
                return Err(BlobberError::InvalidParameters(format!(
                    "connection {} is already {:?}",
                    connection_id, conn.status
                )));
            }
            Ok(conn)
        }
        None => Ok(AllocationConnection::new(connection_id, allocation_id, client_id, now)),
    }
}

pub fn list_connections<Tx: Transaction>(txn: &Tx, b: &Buckets) -> Result<Vec<AllocationConnection>, BlobberError> {
    Ok(scan_prefix::<AllocationConnection, _>(txn, b.connections, "")?
        .into_iter()
        .map(|(_, c)| c)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;

    fn change(lookup: &str, size: i64) -> AllocationChange {
        change_op(lookup, Operation::Insert, size)
    }

    fn change_op(lookup: &str, operation: Operation, size: i64) -> AllocationChange {
        AllocationChange {
            connection_id: "conn".into(),
            lookup_hash: lookup.into(),
            operation,
            size,
            input: Vec::new(),
        }
    }

    #[test]
    fn test_upsert_replaces_by_path() {
        let mut conn = AllocationConnection::new("conn", "alloc", "client", 1);
        conn.upsert_change(change("p1", 10), 2);
        conn.upsert_change(change("p2", 5), 3);
        conn.upsert_change(change("p1", 12), 4);
        assert_eq!(conn.changes.len(), 2);
        assert_eq!(conn.size, 17);
        assert_eq!(conn.size_excluding("p1", Operation::Insert), 5);
        assert_eq!(conn.status, ConnectionStatus::InProgress);
        assert_eq!(conn.changes[0].size, 12);
    }

    #[test]
    fn test_upsert_keeps_other_operations_on_same_path() {
        let mut conn = AllocationConnection::new("conn", "alloc", "client", 1);
        conn.upsert_change(change_op("p", Operation::Rename, 0), 2);
        conn.upsert_change(change_op("p", Operation::Insert, 7), 3);
        assert_eq!(conn.changes.len(), 2);
        assert_eq!(conn.size, 7);
        assert_eq!(conn.size_excluding("p", Operation::Rename), 7);
        assert_eq!(conn.size_excluding("p", Operation::Insert), 0);
        assert_eq!(conn.change("p").map(|c| c.operation), Some(Operation::Rename));
    }

    #[test]
    fn test_open_connection_binding() {
        let (_tmp, db) = temp_db();
        let mut conn = AllocationConnection::new("conn", "alloc", "client", 1);
        conn.upsert_change(change("p", 1), 1);
        db.write(|txn, b| save_connection(txn, b, &conn)).expect("save");

        db.read(|txn, b| {
            assert_eq!(open_connection(txn, b, "conn", "alloc", "client", 2)?.changes.len(), 1);
            assert!(open_connection(txn, b, "conn", "other", "client", 2).is_err());
            assert!(open_connection(txn, b, "conn", "alloc", "other", 2).is_err());
            assert_eq!(open_connection(txn, b, "fresh", "alloc", "client", 2)?.status, ConnectionStatus::New);
            Ok(())
        })
        .expect("read");

        conn.status = ConnectionStatus::Committed;
        db.write(|txn, b| save_connection(txn, b, &conn)).expect("save");
        let err = db.read(|txn, b| open_connection(txn, b, "conn", "alloc", "client", 3)).unwrap_err();
        assert_eq!(err.code(), "invalid_parameters");
    }
}
