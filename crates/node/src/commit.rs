//! # Write-Marker Commit Engine
//!
//! ```text
//! lock(allocation) → lock(connection)
//!   → load connection        InvalidParameters (missing, foreign, empty, incomplete)
//!   → verify capacity        MaxAllocationSize
//!   → verify marker          AllocationRootMismatch | WriteMarkerVerificationFailed
//!   → reserve write tokens   NotEnoughTokens | RequestError      (async, no txn)
//!   → rw txn {
//!       apply changes (staging order) → recompute root → compare with marker
//!       persist pending, redeem row, marker, allocation, connection
//!       promote staged content
//!     }                       any error aborts the txn; the head stays put
//!   → drop staged temp files
//! ```
//!
//! Every rejection carries the allocation head as it stands after the failed
//! attempt, so the client can rebase and resubmit.

use std::sync::Arc;

use tracing::{debug, info, warn};

use blobber_common::cid::short_hash;
use blobber_common::SignatureVerifier;
use blobber_storage::ContentStore;

use crate::allocation::{load_allocation, save_allocation, Allocation, AllocationRegistry};
use crate::commands::FileChange;
use crate::connection::{load_connection, save_connection, AllocationConnection, ConnectionStatus};
use crate::context::RequestContext;
use crate::db::{get_value, put_value, scan_prefix, BlobberDb};
use crate::error::{BlobberError, CommitRejection};
use crate::locks::LockManager;
use crate::now_secs;
use crate::pools::PoolAccounting;
use crate::redeem::{record_write, WriteRedeem};
use crate::reference::{allocation_root, TreeWriter};
use crate::write_marker::WriteMarker;

/// Successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub allocation_root: String,
    pub write_marker: WriteMarker,
    pub success: bool,
}

fn marker_key(allocation_id: &str, seq: u64) -> String {
    format!("{}/{:020}", allocation_id, seq)
}

fn marker_failed(msg: impl Into<String>) -> BlobberError {
    BlobberError::WriteMarkerVerificationFailed(msg.into())
}

fn apply_change(tree: &mut TreeWriter<'_, '_>, change: &FileChange) -> Result<(), BlobberError> {
    match change {
        FileChange::Upload(u) if u.is_update => tree.update_file(&u.attrs).map(|_| ()),
        FileChange::Upload(u) => tree.insert_file(&u.attrs).map(|_| ()),
        FileChange::Delete { path } => tree.delete(path).map(|_| ()),
        FileChange::Rename { path, new_name } => tree.rename(path, new_name).map(|_| ()),
        FileChange::Copy { path, dest_dir } => tree.copy(path, dest_dir).map(|_| ()),
    }
}

/// Replay a connection onto the tree in staging order.
fn replay(tree: &mut TreeWriter<'_, '_>, conn: &AllocationConnection) -> Result<Vec<FileChange>, BlobberError> {
    let mut decoded = Vec::with_capacity(conn.changes.len());
    for change in &conn.changes {
        let fc = FileChange::decode(&change.input)?;
        apply_change(tree, &fc).map_err(|e| {
            BlobberError::Internal(format!("applying {} change failed: {}", change.operation.as_str(), e))
        })?;
        decoded.push(fc);
    }
    Ok(decoded)
}

pub struct CommitEngine {
    db: BlobberDb,
    registry: Arc<AllocationRegistry>,
    store: Arc<dyn ContentStore>,
    locks: Arc<LockManager>,
    pools: Arc<PoolAccounting>,
    verifier: Arc<dyn SignatureVerifier>,
    blobber_id: String,
    max_timestamp_skew: u64,
}

impl std::fmt::Debug for CommitEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitEngine")
            .field("blobber_id", &self.blobber_id)
            .field("max_timestamp_skew", &self.max_timestamp_skew)
            .finish_non_exhaustive()
    }
}

impl CommitEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: BlobberDb,
        registry: Arc<AllocationRegistry>,
        store: Arc<dyn ContentStore>,
        locks: Arc<LockManager>,
        pools: Arc<PoolAccounting>,
        verifier: Arc<dyn SignatureVerifier>,
        blobber_id: impl Into<String>,
        max_timestamp_skew: u64,
    ) -> Self {
        Self {
            db,
            registry,
            store,
            locks,
            pools,
            verifier,
            blobber_id: blobber_id.into(),
            max_timestamp_skew,
        }
    }

    /// Rejection carrying the current head of `allocation_id`.
    fn reject(&self, error: BlobberError, allocation_id: Option<&str>) -> CommitRejection {
        let head = allocation_id.and_then(|id| self.registry.get(id).ok().flatten());
        CommitRejection {
            error,
            allocation_root: head.as_ref().map(|a| a.allocation_root.clone()).unwrap_or_default(),
            latest_write_marker: head.and_then(|a| a.latest_write_marker),
        }
    }

    pub async fn commit_write(
        &self,
        ctx: &RequestContext,
        connection_id: &str,
        wm: WriteMarker,
    ) -> Result<CommitResult, CommitRejection> {
        let alloc = self
            .registry
            .verify_allocation(&ctx.allocation_tx)
            .await
            .map_err(|e| self.reject(e, None))?;
        let alloc_id = alloc.id.clone();

        let _alloc_guard = self.locks.lock_allocation(&alloc_id).await;
        let _conn_guard = self.locks.lock_connection(connection_id).await;

        match self.commit_locked(ctx, connection_id, &alloc_id, wm).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(
                    allocation = %alloc_id,
                    connection = connection_id,
                    code = e.code(),
                    error = %e,
                    "commit rejected"
                );
                Err(self.reject(e, Some(&alloc_id)))
            }
        }
    }

    async fn commit_locked(
        &self,
        ctx: &RequestContext,
        connection_id: &str,
        alloc_id: &str,
        wm: WriteMarker,
    ) -> Result<CommitResult, BlobberError> {
        // everything below is read under the allocation lock
        let (alloc, conn) = self.db.read(|txn, b| {
            let alloc = load_allocation(txn, b, alloc_id)?
                .ok_or_else(|| BlobberError::InvalidParameters(format!("unknown allocation {}", alloc_id)))?;
            let conn = load_connection(txn, b, connection_id)?;
            Ok((alloc, conn))
        })?;
        let conn = self.check_connection(ctx, &alloc, connection_id, conn)?;

        if !alloc.fits(0, conn.size) {
            return Err(BlobberError::MaxAllocationSize {
                used: alloc.blobber_size_used,
                requested: conn.size,
                capacity: alloc.blobber_size,
            });
        }
        self.verify_marker(ctx, &alloc, &conn, &wm)?;

        let reservation = self
            .pools
            .reserve_write(&ctx.client_id, &alloc.id, alloc.write_price, conn.size)
            .await?;

        let now = now_secs();
        let store = self.store.as_ref();
        let committed = self.db.write(|txn, b| {
            let mut alloc = load_allocation(&*txn, b, alloc_id)?
                .ok_or_else(|| BlobberError::Internal("allocation vanished during commit".into()))?;

            let mut tree = TreeWriter::new(txn, b, alloc_id, now);
            let changes = replay(&mut tree, &conn)?;
            let root = tree.finish()?;
            let computed = allocation_root(&root.hash, wm.timestamp);
            if computed != wm.allocation_root {
                return Err(BlobberError::AllocationRootMismatch { expected: computed, got: wm.allocation_root.clone() });
            }

            self.pools.apply(txn, b, &reservation)?;
            record_write(
                txn,
                b,
                &WriteRedeem {
                    signature: wm.signature.clone(),
                    client_id: ctx.client_id.clone(),
                    allocation_id: alloc.id.clone(),
                    blobber_id: self.blobber_id.clone(),
                    size: wm.size,
                    value: reservation.want,
                    created_at: now,
                    redeemed: false,
                },
            )?;

            alloc.commit_count += 1;
            put_value(txn, b.write_markers, &marker_key(&alloc.id, alloc.commit_count), &wm)?;
            alloc.allocation_root = wm.allocation_root.clone();
            alloc.blobber_size_used = (alloc.blobber_size_used as i64 + conn.size).max(0) as u64;
            alloc.used_size = (alloc.used_size as i64 + conn.size).max(0) as u64;
            alloc.is_redeem_required = true;
            alloc.latest_write_marker = Some(wm.clone());
            alloc.updated_at = now;
            save_allocation(txn, b, &alloc)?;

            let mut closed = conn.clone();
            closed.status = ConnectionStatus::Committed;
            closed.updated_at = now;
            save_connection(txn, b, &closed)?;

            // promotion is idempotent, so a txn that fails after this point
            // leaves nothing but unreferenced objects
            for change in &changes {
                if let FileChange::Upload(u) = change {
                    store.commit_staged(alloc_id, connection_id, &u.attrs.path, false, &u.attrs.content_hash)?;
                    if let Some((_, thumb_hash)) = &u.attrs.thumbnail {
                        store.commit_staged(alloc_id, connection_id, &u.attrs.path, true, thumb_hash)?;
                    }
                }
            }
            Ok(alloc)
        })?;

        if let Err(e) = self.store.delete_staged(alloc_id, connection_id) {
            warn!(allocation = alloc_id, connection = connection_id, error = %e, "failed to drop staged content");
        }

        info!(
            allocation = alloc_id,
            connection = connection_id,
            root = short_hash(&committed.allocation_root),
            size = wm.size,
            commit = committed.commit_count,
            "write marker committed"
        );
        Ok(CommitResult { allocation_root: committed.allocation_root, write_marker: wm, success: true })
    }

    fn check_connection(
        &self,
        ctx: &RequestContext,
        alloc: &Allocation,
        connection_id: &str,
        conn: Option<AllocationConnection>,
    ) -> Result<AllocationConnection, BlobberError> {
        let conn = conn.ok_or_else(|| BlobberError::InvalidParameters(format!("connection {} not found", connection_id)))?;
        if conn.allocation_id != alloc.id || conn.client_id != ctx.client_id {
            return Err(BlobberError::InvalidParameters(format!(
                "connection {} belongs to another allocation or client",
                connection_id
            )));
        }
        if !conn.is_active() {
            return Err(BlobberError::InvalidParameters(format!("connection {} is {:?}", connection_id, conn.status)));
        }
        if conn.changes.is_empty() {
            return Err(BlobberError::InvalidParameters(format!("connection {} has no changes", connection_id)));
        }
        for change in &conn.changes {
            if let FileChange::Upload(u) = FileChange::decode(&change.input)? {
                if !u.complete {
                    return Err(BlobberError::InvalidParameters(format!(
                        "upload of {} is incomplete ({} of {} bytes)",
                        u.attrs.path, u.staged_size, u.attrs.size
                    )));
                }
            }
        }
        Ok(conn)
    }

    fn verify_marker(
        &self,
        ctx: &RequestContext,
        alloc: &Allocation,
        conn: &AllocationConnection,
        wm: &WriteMarker,
    ) -> Result<(), BlobberError> {
        if wm.previous_allocation_root != alloc.allocation_root {
            return Err(BlobberError::AllocationRootMismatch {
                expected: alloc.allocation_root.clone(),
                got: wm.previous_allocation_root.clone(),
            });
        }
        if wm.allocation_id != alloc.id {
            return Err(marker_failed("allocation id does not match"));
        }
        if wm.blobber_id != self.blobber_id {
            return Err(marker_failed("blobber id does not match"));
        }
        if wm.client_id != ctx.client_id {
            return Err(marker_failed("client id does not match the committing client"));
        }
        if wm.size != conn.size {
            return Err(marker_failed(format!("size {} does not match staged size {}", wm.size, conn.size)));
        }
        if !wm.verify_signature(self.verifier.as_ref(), &ctx.client_key) {
            return Err(marker_failed("invalid signature"));
        }
        if let Some(latest) = &alloc.latest_write_marker {
            if wm.timestamp < latest.timestamp {
                return Err(marker_failed(format!(
                    "timestamp {} is older than the latest marker's {}",
                    wm.timestamp, latest.timestamp
                )));
            }
        }
        let now = now_secs();
        if wm.timestamp > now.saturating_add(self.max_timestamp_skew) {
            return Err(marker_failed(format!("timestamp {} is too far in the future", wm.timestamp)));
        }
        debug!(allocation = %alloc.id, marker = short_hash(&wm.hash()), "write marker verified");
        Ok(())
    }

    /// Root the connection would produce if committed with `timestamp`.
    /// Runs in a transaction that is always rolled back.
    pub async fn preview_root(
        &self,
        ctx: &RequestContext,
        connection_id: &str,
        timestamp: u64,
    ) -> Result<String, BlobberError> {
        let alloc = self.registry.verify_allocation(&ctx.allocation_tx).await?;
        let _conn_guard = self.locks.lock_connection(connection_id).await;
        self.db.dry_run(|txn, b| {
            let conn = load_connection(&*txn, b, connection_id)?
                .filter(|c| c.allocation_id == alloc.id && c.client_id == ctx.client_id)
                .ok_or_else(|| BlobberError::InvalidParameters(format!("connection {} not found", connection_id)))?;
            let mut tree = TreeWriter::new(txn, b, &alloc.id, now_secs());
            replay(&mut tree, &conn)?;
            let root = tree.finish()?;
            Ok(allocation_root(&root.hash, timestamp))
        })
    }

    pub fn latest_write_marker(&self, allocation_id: &str) -> Result<Option<WriteMarker>, BlobberError> {
        self.db.read(|txn, b| {
            let alloc: Option<Allocation> = get_value(txn, b.allocations, allocation_id)?;
            Ok(alloc.and_then(|a| a.latest_write_marker))
        })
    }

    /// Every committed marker of the allocation, oldest first.
    pub fn list_write_markers(&self, allocation_id: &str) -> Result<Vec<WriteMarker>, BlobberError> {
        let prefix = format!("{}/", allocation_id);
        let rows: Vec<(String, WriteMarker)> = self.db.read(|txn, b| scan_prefix(txn, b.write_markers, &prefix))?;
        Ok(rows.into_iter().map(|(_, wm)| wm).collect())
    }
}
