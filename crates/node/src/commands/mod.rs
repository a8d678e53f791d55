//! # File Operation Commands
//!
//! Every mutation a client can stage is one [`FileOperation`] variant. Staging
//! follows the same steps for each:
//!
//! ```text
//! authorize ──▶ process content / thumbnail ──▶ update change
//!  (who, what exists)  (uploads only)          (upsert by path + op, persisted)
//! ```
//!
//! Staging and commits both take the allocation lock and then the connection
//! lock. A produced path already claimed by a different staged operation is
//! refused with `DuplicateFile` before any bytes are written.

mod copy;
mod delete;
mod rename;
mod upload;

use std::sync::Arc;

use lmdb::Transaction;
use serde::{Deserialize, Serialize};
use tracing::debug;

use blobber_storage::ContentStore;

use crate::allocation::{load_allocation, Allocation, AllocationRegistry};
use crate::collaborators::is_collaborator;
use crate::connection::{open_connection, save_connection, AllocationChange, AllocationConnection, Operation};
use crate::context::RequestContext;
use crate::db::{BlobberDb, Buckets};
use crate::error::BlobberError;
use crate::locks::LockManager;
use crate::now_secs;
use crate::reference::{base_name, clean_path, get_by_path, join_path, lookup_hash, parent_path, FileAttributes, Ref};

// ════════════════════════════════════════════════════════════════════════════
// REQUEST TYPES
// ════════════════════════════════════════════════════════════════════════════

/// One chunk of file content plus the metadata the client declares for the
/// complete file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UploadPayload {
    pub path: String,
    /// Declared size of the complete file.
    pub size: u64,
    /// Declared SHA-256 of the complete file.
    pub content_hash: String,
    pub merkle_root: String,
    pub actual_file_size: u64,
    pub actual_file_hash: String,
    pub mime_type: String,
    pub encrypted_key: String,
    /// Offset of `data` in the file. Offset 0 restarts the upload.
    pub upload_offset: u64,
    pub is_final: bool,
    pub data: Vec<u8>,
    pub thumbnail: Option<ThumbnailUpload>,
}

/// Thumbnail sent in a single piece.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThumbnailUpload {
    pub size: u64,
    pub content_hash: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOperation {
    Insert(UploadPayload),
    Update(UploadPayload),
    Delete { path: String },
    Rename { path: String, new_name: String },
    /// Copy `path` into the directory `dest_dir`, keeping its name.
    Copy { path: String, dest_dir: String },
}

impl FileOperation {
    pub fn operation(&self) -> Operation {
        match self {
            FileOperation::Insert(_) => Operation::Insert,
            FileOperation::Update(_) => Operation::Update,
            FileOperation::Delete { .. } => Operation::Delete,
            FileOperation::Rename { .. } => Operation::Rename,
            FileOperation::Copy { .. } => Operation::Copy,
        }
    }

    fn source_path(&self) -> &str {
        match self {
            FileOperation::Insert(p) | FileOperation::Update(p) => p.path.as_str(),
            FileOperation::Delete { path } | FileOperation::Rename { path, .. } | FileOperation::Copy { path, .. } => {
                path.as_str()
            }
        }
    }
}

/// Persisted form of a staged operation, replayed by the commit engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileChange {
    Upload(UploadChange),
    Delete { path: String },
    Rename { path: String, new_name: String },
    Copy { path: String, dest_dir: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadChange {
    pub attrs: FileAttributes,
    /// Insert or update.
    pub is_update: bool,
    /// Final chunk received and verified.
    pub complete: bool,
    /// Bytes staged so far.
    pub staged_size: u64,
}

impl FileChange {
    /// Path the staged operation acts on.
    pub fn source_path(&self) -> &str {
        match self {
            FileChange::Upload(u) => u.attrs.path.as_str(),
            FileChange::Delete { path } | FileChange::Rename { path, .. } | FileChange::Copy { path, .. } => {
                path.as_str()
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BlobberError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, BlobberError> {
        bincode::deserialize(raw).map_err(|e| BlobberError::InvalidParameters(format!("undecodable change: {}", e)))
    }
}

/// Outcome of staging one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub connection_id: String,
    pub operation: Operation,
    /// Path the change produces.
    pub path: String,
    pub change_size: i64,
    pub connection_size: i64,
    /// Bytes staged for the file so far (uploads only).
    pub staged_bytes: u64,
    /// Store-computed hash, set once the final chunk lands.
    pub content_hash: String,
    pub chunk_uploaded: bool,
}

// ════════════════════════════════════════════════════════════════════════════
// STAGE VIEW
// ════════════════════════════════════════════════════════════════════════════

/// Read snapshot a command authorizes against.
#[derive(Debug)]
pub(crate) struct StageView {
    pub allocation: Allocation,
    pub client_id: String,
    pub connection: AllocationConnection,
    pub operation: Operation,
    /// Cleaned source path of the operation.
    pub path: String,
    /// Committed ref at `path`.
    pub target: Option<Ref>,
    /// Path the change produces (rename/copy destination, else `path`).
    pub produced_path: String,
    pub produced_exists: bool,
    pub is_collaborator: bool,
    /// Earlier stage of this same operation on the same paths, replaced by
    /// this one (chunked uploads).
    pub prior: Option<FileChange>,
}

impl StageView {
    fn load<Tx: Transaction>(
        txn: &Tx,
        b: &Buckets,
        allocation: Allocation,
        ctx: &RequestContext,
        connection_id: &str,
        op: &FileOperation,
        now: u64,
    ) -> Result<Self, BlobberError> {
        let connection = open_connection(txn, b, connection_id, &allocation.id, &ctx.client_id, now)?;
        let path = clean_path(op.source_path())?;
        let produced_path = match op {
            FileOperation::Rename { new_name, .. } => join_path(&parent_path(&path), new_name),
            FileOperation::Copy { dest_dir, .. } => join_path(&clean_path(dest_dir)?, &base_name(&path)),
            _ => path.clone(),
        };

        let target = get_by_path(txn, b, &allocation.id, &path)?;
        let produced_exists = produced_path != path && get_by_path(txn, b, &allocation.id, &produced_path)?.is_some();
        let lookup = lookup_hash(&allocation.id, &path);
        let is_collaborator = is_collaborator(txn, b, &lookup, &ctx.client_id)?;
        let operation = op.operation();
        let prior = match connection.change(&lookup_hash(&allocation.id, &produced_path)) {
            Some(c) => {
                let staged = FileChange::decode(&c.input)?;
                if c.operation != operation || staged.source_path() != path {
                    return Err(BlobberError::DuplicateFile(produced_path));
                }
                Some(staged)
            }
            None => None,
        };

        Ok(Self {
            allocation,
            client_id: ctx.client_id.clone(),
            connection,
            operation,
            path,
            target,
            produced_path,
            produced_exists,
            is_collaborator,
            prior,
        })
    }

    fn require_writer(&self) -> Result<(), BlobberError> {
        if !self.allocation.can_write(&self.client_id) {
            return Err(BlobberError::InvalidOperation(
                "operation needs to be performed by the owner or the payer of the allocation".into(),
            ));
        }
        Ok(())
    }

    fn require_target(&self) -> Result<&Ref, BlobberError> {
        self.target
            .as_ref()
            .ok_or_else(|| BlobberError::InvalidParameters(format!("{} does not exist", self.path)))
    }

    fn produced_lookup(&self) -> String {
        lookup_hash(&self.allocation.id, &self.produced_path)
    }

    /// Capacity check for a change of `delta` bytes on top of everything
    /// else staged in the connection.
    fn check_capacity(&self, delta: i64) -> Result<(), BlobberError> {
        let staged = self.connection.size_excluding(&self.produced_lookup(), self.operation);
        check_capacity(&self.allocation, staged, delta)
    }
}

fn check_capacity(alloc: &Allocation, staged: i64, delta: i64) -> Result<(), BlobberError> {
    if delta > 0 && !alloc.fits(staged, delta) {
        return Err(BlobberError::MaxAllocationSize {
            used: alloc.blobber_size_used,
            requested: staged.saturating_add(delta),
            capacity: alloc.blobber_size,
        });
    }
    Ok(())
}

/// Output of a command, ready for [`StageEngine::update_change`].
#[derive(Debug)]
pub(crate) struct PreparedChange {
    pub change: FileChange,
    pub size: i64,
    pub staged_bytes: u64,
    pub content_hash: String,
    pub chunk_uploaded: bool,
}

// ════════════════════════════════════════════════════════════════════════════
// STAGE ENGINE
// ════════════════════════════════════════════════════════════════════════════

pub struct StageEngine {
    db: BlobberDb,
    registry: Arc<AllocationRegistry>,
    store: Arc<dyn ContentStore>,
    locks: Arc<LockManager>,
    max_file_size: u64,
}

impl std::fmt::Debug for StageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageEngine").field("max_file_size", &self.max_file_size).finish_non_exhaustive()
    }
}

impl StageEngine {
    pub fn new(
        db: BlobberDb,
        registry: Arc<AllocationRegistry>,
        store: Arc<dyn ContentStore>,
        locks: Arc<LockManager>,
        max_file_size: u64,
    ) -> Self {
        Self { db, registry, store, locks, max_file_size }
    }

    /// Validate `op` and record it in `connection_id`.
    pub async fn stage_change(
        &self,
        ctx: &RequestContext,
        connection_id: &str,
        op: FileOperation,
    ) -> Result<StageResult, BlobberError> {
        let allocation = self.registry.verify_allocation(&ctx.allocation_tx).await?;
        let _alloc_guard = self.locks.lock_allocation(&allocation.id).await;
        let _conn_guard = self.locks.lock_connection(connection_id).await;

        let now = now_secs();
        let operation = op.operation();
        let upload_offset = match &op {
            FileOperation::Insert(p) | FileOperation::Update(p) => Some(p.upload_offset),
            _ => None,
        };
        let view = self.db.read(|txn, b| StageView::load(txn, b, allocation, ctx, connection_id, &op, now))?;

        let prepared = match op {
            FileOperation::Insert(payload) => upload::stage(self, &view, payload, false)?,
            FileOperation::Update(payload) => upload::stage(self, &view, payload, true)?,
            FileOperation::Delete { .. } => delete::stage(&view)?,
            FileOperation::Rename { new_name, .. } => rename::stage(&view, &new_name)?,
            FileOperation::Copy { dest_dir, .. } => copy::stage(&view, &dest_dir)?,
        };

        let connection_size = match self.update_change(&view, operation, &prepared, now) {
            Ok(size) => size,
            Err(e) => {
                // the staged bytes must end where the client's last acknowledged chunk did
                if let (Some(offset), true) = (upload_offset, prepared.chunk_uploaded) {
                    upload::rollback_chunk(self.store(), &view, offset);
                }
                return Err(e);
            }
        };
        debug!(
            allocation = %view.allocation.id,
            connection = connection_id,
            op = operation.as_str(),
            path = %view.produced_path,
            size = prepared.size,
            connection_size,
            "change staged"
        );

        Ok(StageResult {
            connection_id: connection_id.to_string(),
            operation,
            path: view.produced_path.clone(),
            change_size: prepared.size,
            connection_size,
            staged_bytes: prepared.staged_bytes,
            content_hash: prepared.content_hash,
            chunk_uploaded: prepared.chunk_uploaded,
        })
    }

    /// Upsert the change into the connection row. Capacity is checked again
    /// against the allocation as it stands in this transaction.
    fn update_change(
        &self,
        view: &StageView,
        operation: Operation,
        prepared: &PreparedChange,
        now: u64,
    ) -> Result<i64, BlobberError> {
        let input = prepared.change.encode()?;
        let lookup = view.produced_lookup();
        self.db.write(|txn, b| {
            let alloc = load_allocation(&*txn, b, &view.allocation.id)?
                .ok_or_else(|| BlobberError::InvalidParameters("allocation disappeared".into()))?;
            let mut conn = open_connection(&*txn, b, &view.connection.connection_id, &alloc.id, &view.client_id, now)?;
            check_capacity(&alloc, conn.size_excluding(&lookup, operation), prepared.size)?;

            conn.upsert_change(
                AllocationChange {
                    connection_id: conn.connection_id.clone(),
                    lookup_hash: lookup.clone(),
                    operation,
                    size: prepared.size,
                    input: input.clone(),
                },
                now,
            );
            save_connection(txn, b, &conn)?;
            Ok(conn.size)
        })
    }

    pub(crate) fn store(&self) -> &dyn ContentStore {
        self.store.as_ref()
    }

    pub(crate) fn max_file_size(&self) -> u64 {
        self.max_file_size
    }
}
