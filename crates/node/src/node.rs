//! Facade wiring the database, content store, chain collaborators and the
//! protocol engines into one node.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use blobber_common::{BlobberConfig, Ed25519Verifier, SignatureVerifier};
use blobber_storage::{ContentStore, LocalFsStorage};

use crate::allocation::{Allocation, AllocationRegistry};
use crate::auth_ticket::{DbShareStore, ShareInfo, ShareStore};
use crate::chain::{AllocationSource, PoolSource};
use crate::collaborators::{Collaborator, CollaboratorService};
use crate::commands::{FileOperation, StageEngine, StageResult};
use crate::commit::{CommitEngine, CommitResult};
use crate::context::RequestContext;
use crate::db::BlobberDb;
use crate::download::{ReadEngine, ReadOutcome, ReadRequest};
use crate::error::{BlobberError, CommitRejection};
use crate::locks::LockManager;
use crate::now_secs;
use crate::pools::{Pending, PoolAccounting};
use crate::read_marker::ReadMarker;
use crate::redeem::{ReadRedeem, RedeemLedger, WriteRedeem};
use crate::reference::{clean_path, get_by_lookup_hash, list_dir, Ref};
use crate::sweeper::ConnectionSweeper;
use crate::write_marker::WriteMarker;

pub struct BlobberNode {
    blobber_id: String,
    db: BlobberDb,
    registry: Arc<AllocationRegistry>,
    locks: Arc<LockManager>,
    pools: Arc<PoolAccounting>,
    stage: StageEngine,
    commit: CommitEngine,
    reads: ReadEngine,
    collaborators: CollaboratorService,
    shares: DbShareStore,
    redeems: RedeemLedger,
    sweeper: Arc<ConnectionSweeper>,
}

impl std::fmt::Debug for BlobberNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobberNode").field("blobber_id", &self.blobber_id).finish_non_exhaustive()
    }
}

impl BlobberNode {
    /// Open the node's database and content store under `config.data_dir`.
    pub fn open<C>(config: &BlobberConfig, chain: Arc<C>) -> Result<Self, BlobberError>
    where
        C: AllocationSource + PoolSource + 'static,
    {
        Self::open_with(config, chain.clone(), chain, Arc::new(Ed25519Verifier))
    }

    pub fn open_with(
        config: &BlobberConfig,
        allocations: Arc<dyn AllocationSource>,
        pool_source: Arc<dyn PoolSource>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Result<Self, BlobberError> {
        config.validate().map_err(BlobberError::InvalidParameters)?;

        let db = BlobberDb::open(config.db_dir(), config.db_map_size)?;
        let store: Arc<dyn ContentStore> = Arc::new(LocalFsStorage::new(config.files_dir())?);
        let locks = Arc::new(LockManager::new());
        let registry = Arc::new(AllocationRegistry::new(db.clone(), allocations));
        let pools = Arc::new(PoolAccounting::new(
            db.clone(),
            pool_source,
            config.blobber_id.clone(),
            Duration::from_secs(config.pool_cache_ttl_secs),
        ));

        let stage = StageEngine::new(db.clone(), registry.clone(), store.clone(), locks.clone(), config.max_file_size);
        let commit = CommitEngine::new(
            db.clone(),
            registry.clone(),
            store.clone(),
            locks.clone(),
            pools.clone(),
            verifier.clone(),
            config.blobber_id.clone(),
            config.max_timestamp_skew_secs,
        );
        let reads = ReadEngine::new(db.clone(), registry.clone(), store.clone(), locks.clone(), pools.clone(), verifier);
        let sweeper = Arc::new(ConnectionSweeper::new(
            db.clone(),
            store,
            locks.clone(),
            config.connection_stale_secs,
            config.sweep_interval_secs,
        ));

        info!(blobber = %config.blobber_id, data_dir = %config.data_dir.display(), "blobber node opened");
        Ok(Self {
            blobber_id: config.blobber_id.clone(),
            collaborators: CollaboratorService::new(db.clone(), registry.clone()),
            shares: DbShareStore::new(db.clone()),
            redeems: RedeemLedger::new(db.clone()),
            db,
            registry,
            locks,
            pools,
            stage,
            commit,
            reads,
            sweeper,
        })
    }

    pub fn blobber_id(&self) -> &str {
        &self.blobber_id
    }

    pub fn sweeper(&self) -> Arc<ConnectionSweeper> {
        self.sweeper.clone()
    }

    /// Keys currently locked or waited on.
    pub fn active_locks(&self) -> usize {
        self.locks.active_keys()
    }

    // ────────────────────────────────────────────────────────────────────────
    // WRITE PATH
    // ────────────────────────────────────────────────────────────────────────

    pub async fn stage_change(
        &self,
        ctx: &RequestContext,
        connection_id: &str,
        op: FileOperation,
    ) -> Result<StageResult, BlobberError> {
        self.stage.stage_change(ctx, connection_id, op).await
    }

    pub async fn commit_write(
        &self,
        ctx: &RequestContext,
        connection_id: &str,
        wm: WriteMarker,
    ) -> Result<CommitResult, CommitRejection> {
        self.commit.commit_write(ctx, connection_id, wm).await
    }

    pub async fn preview_root(
        &self,
        ctx: &RequestContext,
        connection_id: &str,
        timestamp: u64,
    ) -> Result<String, BlobberError> {
        self.commit.preview_root(ctx, connection_id, timestamp).await
    }

    pub fn latest_write_marker(&self, allocation_id: &str) -> Result<Option<WriteMarker>, BlobberError> {
        self.commit.latest_write_marker(allocation_id)
    }

    pub fn list_write_markers(&self, allocation_id: &str) -> Result<Vec<WriteMarker>, BlobberError> {
        self.commit.list_write_markers(allocation_id)
    }

    // ────────────────────────────────────────────────────────────────────────
    // READ PATH
    // ────────────────────────────────────────────────────────────────────────

    pub async fn authorize_read(&self, ctx: &RequestContext, req: ReadRequest) -> Result<ReadOutcome, BlobberError> {
        self.reads.authorize_read(ctx, req).await
    }

    pub fn latest_read_marker(&self, client_id: &str) -> Result<Option<ReadMarker>, BlobberError> {
        self.reads.latest_read_marker(client_id)
    }

    // ────────────────────────────────────────────────────────────────────────
    // ALLOCATION STATE
    // ────────────────────────────────────────────────────────────────────────

    pub async fn allocation(&self, ctx: &RequestContext) -> Result<Allocation, BlobberError> {
        self.registry.verify_allocation(&ctx.allocation_tx).await
    }

    /// Pull fresh contract terms from the chain.
    pub async fn refresh_allocation(&self, allocation_tx: &str) -> Result<Allocation, BlobberError> {
        self.registry.refresh(allocation_tx).await
    }

    pub async fn list_dir(&self, ctx: &RequestContext, path: &str) -> Result<Vec<Ref>, BlobberError> {
        let alloc = self.registry.verify_allocation(&ctx.allocation_tx).await?;
        let path = clean_path(path)?;
        self.db.read(|txn, b| list_dir(txn, b, &alloc.id, &path))
    }

    pub fn pending(&self, client_id: &str, allocation_id: &str) -> Result<Pending, BlobberError> {
        self.pools.pending(client_id, allocation_id)
    }

    // ────────────────────────────────────────────────────────────────────────
    // COLLABORATORS AND SHARES
    // ────────────────────────────────────────────────────────────────────────

    pub async fn add_collaborator(&self, ctx: &RequestContext, path: &str, client_id: &str) -> Result<(), BlobberError> {
        self.collaborators.add(ctx, path, client_id).await
    }

    pub async fn remove_collaborator(
        &self,
        ctx: &RequestContext,
        path: &str,
        client_id: &str,
    ) -> Result<(), BlobberError> {
        self.collaborators.remove(ctx, path, client_id).await
    }

    pub async fn list_collaborators(&self, ctx: &RequestContext, path: &str) -> Result<Vec<Collaborator>, BlobberError> {
        self.collaborators.list(ctx, path).await
    }

    /// Owner-only. The shared ref must belong to the caller's allocation.
    async fn authorize_share_admin(&self, ctx: &RequestContext, file_path_hash: &str) -> Result<(), BlobberError> {
        let alloc = self.registry.verify_allocation(&ctx.allocation_tx).await?;
        if !alloc.is_owner(&ctx.client_id) {
            return Err(BlobberError::InvalidOperation("only the allocation owner manages shares".into()));
        }
        let target = self.db.read(|txn, b| get_by_lookup_hash(txn, b, file_path_hash))?;
        match target {
            Some(r) if r.allocation_id == alloc.id => Ok(()),
            _ => Err(BlobberError::InvalidParameters("shared path does not exist".into())),
        }
    }

    /// Grant `info.client_id` (empty for public tickets) read access to the
    /// ref at `info.file_path_hash`.
    pub async fn put_share_info(&self, ctx: &RequestContext, mut info: ShareInfo) -> Result<(), BlobberError> {
        self.authorize_share_admin(ctx, &info.file_path_hash).await?;
        info.owner_id = ctx.client_id.clone();
        if info.created_at == 0 {
            info.created_at = now_secs();
        }
        self.shares.put_share_info(&info)?;
        info!(owner = %info.owner_id, client = %info.client_id, "share granted");
        Ok(())
    }

    pub async fn revoke_share_info(
        &self,
        ctx: &RequestContext,
        client_id: &str,
        file_path_hash: &str,
    ) -> Result<bool, BlobberError> {
        self.authorize_share_admin(ctx, file_path_hash).await?;
        let revoked = self.shares.revoke_share_info(client_id, file_path_hash)?;
        if revoked {
            info!(client = client_id, "share revoked");
        }
        Ok(revoked)
    }

    // ────────────────────────────────────────────────────────────────────────
    // REDEMPTION
    // ────────────────────────────────────────────────────────────────────────

    pub async fn pre_redeem_read(
        &self,
        ctx: &RequestContext,
        num_blocks: u64,
        counter: u64,
    ) -> Result<u64, BlobberError> {
        let alloc = self.registry.verify_allocation(&ctx.allocation_tx).await?;
        self.pools
            .pre_redeem_read(&ctx.client_id, &alloc.id, alloc.read_price, num_blocks, counter)
            .await
    }

    pub fn settle_read(&self, client_id: &str, allocation_id: &str, counter: u64) -> Result<bool, BlobberError> {
        self.redeems.settle_read(client_id, allocation_id, counter)
    }

    pub fn settle_write(&self, signature: &str) -> Result<bool, BlobberError> {
        self.redeems.settle_write(signature)
    }

    pub fn unredeemed_reads(&self, allocation_id: &str) -> Result<Vec<ReadRedeem>, BlobberError> {
        self.redeems.unredeemed_reads(allocation_id)
    }

    pub fn unredeemed_writes(&self, allocation_id: &str) -> Result<Vec<WriteRedeem>, BlobberError> {
        self.redeems.unredeemed_writes(allocation_id)
    }
}
