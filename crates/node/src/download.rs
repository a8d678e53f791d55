//! # Read-Marker Authorization Engine
//!
//! ```text
//! verify marker (signature, key ↔ client id, allocation, blobber, owner)
//!   → lock(reader)
//!   → last counter + num_blocks == marker counter ?   no → Stale { last marker }
//!   → owner, or ticket + share row                     InvalidShare | AuthTicketVerificationFailed
//!   → reserve read tokens                              NotEnoughTokens | RequestError
//!   → read blocks
//!   → rw txn { pending += cost, read marker head, redeem row }
//! ```
//!
//! No allocation lock is taken; reads of one client are serialized by the
//! reader lock and never wait on commits.

use std::sync::Arc;

use tracing::{debug, info};

use blobber_common::SignatureVerifier;
use blobber_storage::{num_blocks, ContentStore};

use crate::allocation::AllocationRegistry;
use crate::auth_ticket::{authorize_share, AuthTicket};
use crate::context::RequestContext;
use crate::db::{get_value, put_value, BlobberDb};
use crate::error::BlobberError;
use crate::locks::LockManager;
use crate::now_secs;
use crate::pools::PoolAccounting;
use crate::read_marker::ReadMarker;
use crate::redeem::{record_read, ReadRedeem};
use crate::reference::{clean_path, get_by_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentKind {
    #[default]
    Content,
    Thumbnail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub path: String,
    /// 1-based first block.
    pub block_num: u64,
    pub num_blocks: u64,
    pub content: ContentKind,
    pub read_marker: ReadMarker,
    pub auth_ticket: Option<AuthTicket>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data { data: Vec<u8>, latest_read_marker: ReadMarker },
    /// The marker does not continue the client's counter. Carries the last
    /// accepted marker so the client can resync.
    Stale { latest_read_marker: Option<ReadMarker> },
}

pub struct ReadEngine {
    db: BlobberDb,
    registry: Arc<AllocationRegistry>,
    store: Arc<dyn ContentStore>,
    locks: Arc<LockManager>,
    pools: Arc<PoolAccounting>,
    verifier: Arc<dyn SignatureVerifier>,
}

impl std::fmt::Debug for ReadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadEngine").finish_non_exhaustive()
    }
}

impl ReadEngine {
    pub fn new(
        db: BlobberDb,
        registry: Arc<AllocationRegistry>,
        store: Arc<dyn ContentStore>,
        locks: Arc<LockManager>,
        pools: Arc<PoolAccounting>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self { db, registry, store, locks, pools, verifier }
    }

    pub async fn authorize_read(&self, ctx: &RequestContext, req: ReadRequest) -> Result<ReadOutcome, BlobberError> {
        let alloc = self.registry.verify_allocation(&ctx.allocation_tx).await?;
        if req.block_num < 1 {
            return Err(BlobberError::InvalidParameters("block number must be at least 1".into()));
        }
        if req.num_blocks < 1 {
            return Err(BlobberError::InvalidParameters("number of blocks must be at least 1".into()));
        }

        let rm = &req.read_marker;
        if rm.client_id != ctx.client_id || rm.client_public_key != ctx.client_key {
            return Err(BlobberError::InvalidParameters("read marker was issued by another client".into()));
        }
        if rm.allocation_id != alloc.id {
            return Err(BlobberError::InvalidParameters("read marker is for another allocation".into()));
        }
        if rm.blobber_id != self.pools.blobber_id() {
            return Err(BlobberError::InvalidParameters("read marker is for another blobber".into()));
        }
        if rm.owner_id != alloc.owner_id {
            return Err(BlobberError::InvalidParameters("read marker names the wrong owner".into()));
        }
        if !rm.verify(self.verifier.as_ref()) {
            return Err(BlobberError::InvalidParameters("invalid read marker signature".into()));
        }

        let _guard = self.locks.lock_reader(&rm.client_id).await;
        let now = now_secs();
        let path = clean_path(&req.path)?;

        let (last, file) = self.db.read(|txn, b| {
            let last: Option<ReadMarker> = get_value(txn, b.read_markers, &rm.client_id)?;
            let file = get_by_path(txn, b, &alloc.id, &path)?
                .filter(|r| r.is_file())
                .ok_or_else(|| BlobberError::InvalidParameters(format!("file {} does not exist", path)))?;
            Ok((last, file))
        })?;

        let (content_hash, total_blocks) = match req.content {
            ContentKind::Content => (file.content_hash.clone(), file.num_blocks),
            ContentKind::Thumbnail => {
                if file.thumbnail_hash.is_empty() {
                    return Err(BlobberError::InvalidParameters(format!("{} has no thumbnail", path)));
                }
                (file.thumbnail_hash.clone(), num_blocks(file.thumbnail_size))
            }
        };
        let last_block = req.block_num.saturating_add(req.num_blocks - 1);
        if last_block > total_blocks {
            return Err(BlobberError::InvalidParameters(format!(
                "blocks {}..={} out of range, file has {}",
                req.block_num, last_block, total_blocks
            )));
        }

        let last_counter = last.as_ref().map(|m| m.read_counter).unwrap_or(0);
        if last_counter.checked_add(req.num_blocks) != Some(rm.read_counter) {
            debug!(
                client = %rm.client_id,
                last = last_counter,
                submitted = rm.read_counter,
                num_blocks = req.num_blocks,
                "stale read marker"
            );
            return Ok(ReadOutcome::Stale { latest_read_marker: last });
        }

        if !alloc.is_owner(&rm.client_id) {
            self.db.read(|txn, b| {
                authorize_share(
                    txn,
                    b,
                    req.auth_ticket.as_ref(),
                    &alloc,
                    &rm.client_id,
                    &file,
                    self.verifier.as_ref(),
                    now,
                )
            })?;
        }

        let reservation = self
            .pools
            .reserve_read(&rm.client_id, &alloc.id, alloc.read_price, req.num_blocks)
            .await?;
        let data = self.store.get_block(&alloc.id, &content_hash, req.block_num, req.num_blocks)?;

        let audit = ReadRedeem::new(
            &rm.client_id,
            &alloc.id,
            self.pools.blobber_id(),
            rm.read_counter,
            reservation.want,
            now,
        );
        self.db.write(|txn, b| {
            self.pools.apply(txn, b, &reservation)?;
            put_value(txn, b.read_markers, &rm.client_id, rm)?;
            if !reservation.is_free() {
                record_read(txn, b, &audit)?;
            }
            Ok(())
        })?;

        info!(
            allocation = %alloc.id,
            client = %rm.client_id,
            counter = rm.read_counter,
            blocks = req.num_blocks,
            cost = reservation.want,
            "read authorized"
        );
        Ok(ReadOutcome::Data { data, latest_read_marker: rm.clone() })
    }

    pub fn latest_read_marker(&self, client_id: &str) -> Result<Option<ReadMarker>, BlobberError> {
        self.db.read(|txn, b| get_value(txn, b.read_markers, client_id))
    }
}
