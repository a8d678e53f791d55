//! Shared harness for the node integration tests: a node over a temp data
//! dir, an in-memory chain, and signing clients.

#![allow(dead_code)]

use std::sync::Arc;

use rand::RngCore;
use tempfile::TempDir;

use blobber_common::cid::sha256_hex;
use blobber_common::crypto::{client_id_from_public_key, generate_keypair_bytes, public_key_hex_from_keypair};
use blobber_common::BlobberConfig;
use blobber_node::{
    now_secs, AllocationInfo, BlobberNode, CommitRejection, CommitResult, FileOperation, MockChain, PoolBalance,
    ReadMarker, RequestContext, StageResult, UploadPayload, WriteMarker,
};

pub const BLOBBER_ID: &str = "blobber-1";
pub const ALLOC_ID: &str = "alloc-1";
pub const ALLOC_TX: &str = "alloc-tx-1";

// ════════════════════════════════════════════════════════════════════════════
// CLIENTS
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct Client {
    pub keypair: Vec<u8>,
    pub public_key: String,
    pub id: String,
}

impl Client {
    pub fn generate() -> Self {
        let keypair = generate_keypair_bytes();
        let public_key = public_key_hex_from_keypair(&keypair).expect("public key");
        let id = client_id_from_public_key(&public_key).expect("client id");
        Self { keypair, public_key, id }
    }

    pub fn ctx(&self) -> RequestContext {
        RequestContext::new(self.id.clone(), self.public_key.clone(), ALLOC_TX).expect("context")
    }

    pub fn write_marker(&self, previous: &str, root: &str, size: i64, timestamp: u64) -> WriteMarker {
        let mut wm = WriteMarker {
            allocation_root: root.to_string(),
            previous_allocation_root: previous.to_string(),
            allocation_id: ALLOC_ID.to_string(),
            size,
            blobber_id: BLOBBER_ID.to_string(),
            timestamp,
            client_id: self.id.clone(),
            signature: String::new(),
        };
        wm.sign(&self.keypair).expect("sign write marker");
        wm
    }

    pub fn read_marker(&self, owner_id: &str, counter: u64) -> ReadMarker {
        let mut rm = ReadMarker {
            client_id: self.id.clone(),
            client_public_key: self.public_key.clone(),
            blobber_id: BLOBBER_ID.to_string(),
            allocation_id: ALLOC_ID.to_string(),
            owner_id: owner_id.to_string(),
            timestamp: now_secs(),
            read_counter: counter,
            signature: String::new(),
        };
        rm.sign(&self.keypair).expect("sign read marker");
        rm
    }
}

// ════════════════════════════════════════════════════════════════════════════
// PAYLOADS
// ════════════════════════════════════════════════════════════════════════════

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Whole file in one final chunk.
pub fn upload(path: &str, data: &[u8]) -> UploadPayload {
    UploadPayload {
        path: path.to_string(),
        size: data.len() as u64,
        content_hash: sha256_hex(data),
        merkle_root: format!("merkle-{}", sha256_hex(data)),
        actual_file_size: data.len() as u64,
        actual_file_hash: sha256_hex(data),
        mime_type: "application/octet-stream".to_string(),
        upload_offset: 0,
        is_final: true,
        data: data.to_vec(),
        ..Default::default()
    }
}

/// One chunk `data[offset..end]` of a file whose full content is `full`.
pub fn chunk(path: &str, full: &[u8], offset: usize, end: usize) -> UploadPayload {
    UploadPayload {
        upload_offset: offset as u64,
        is_final: end == full.len(),
        data: full[offset..end].to_vec(),
        ..upload(path, full)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// HARNESS
// ════════════════════════════════════════════════════════════════════════════

pub struct Harness {
    pub tmp: TempDir,
    pub config: BlobberConfig,
    pub chain: Arc<MockChain>,
    pub node: BlobberNode,
    pub owner: Client,
}

pub fn allocation_info(owner: &Client, blobber_size: u64, read_price: u64, write_price: u64) -> AllocationInfo {
    AllocationInfo {
        id: ALLOC_ID.to_string(),
        tx: ALLOC_TX.to_string(),
        owner_id: owner.id.clone(),
        owner_public_key: owner.public_key.clone(),
        payer_id: owner.id.clone(),
        repairer_id: String::new(),
        total_size: blobber_size * 4,
        blobber_size,
        expiration: now_secs() + 86_400,
        read_price,
        write_price,
    }
}

pub fn pool(balance: u64) -> Vec<PoolBalance> {
    vec![PoolBalance { pool_id: "pool-1".to_string(), balance, expire_at: now_secs() + 86_400 }]
}

impl Harness {
    /// Free reads and writes.
    pub fn new(blobber_size: u64) -> Self {
        Self::with_prices(blobber_size, 0, 0)
    }

    pub fn with_prices(blobber_size: u64, read_price: u64, write_price: u64) -> Self {
        Self::build(blobber_size, read_price, write_price, |_| {})
    }

    pub fn build(blobber_size: u64, read_price: u64, write_price: u64, tune: impl FnOnce(&mut BlobberConfig)) -> Self {
        let tmp = TempDir::new().expect("temp dir");
        let mut config = BlobberConfig {
            blobber_id: BLOBBER_ID.to_string(),
            data_dir: tmp.path().to_path_buf(),
            db_map_size: 64 * 1024 * 1024,
            ..Default::default()
        };
        tune(&mut config);
        let owner = Client::generate();
        let chain = Arc::new(MockChain::new());
        chain.put_allocation(allocation_info(&owner, blobber_size, read_price, write_price));
        let node = BlobberNode::open(&config, chain.clone()).expect("open node");
        Self { tmp, config, chain, node, owner }
    }

    pub async fn stage(&self, client: &Client, conn: &str, op: FileOperation) -> StageResult {
        self.node.stage_change(&client.ctx(), conn, op).await.expect("stage change")
    }

    pub async fn current_root(&self) -> String {
        self.node.allocation(&self.owner.ctx()).await.expect("allocation").allocation_root
    }

    /// Sign a marker for whatever `conn` produces on top of the current head.
    pub async fn marker_for(&self, client: &Client, conn: &str, size: i64) -> WriteMarker {
        let ts = now_secs();
        let previous = self.current_root().await;
        let root = self.node.preview_root(&client.ctx(), conn, ts).await.expect("preview root");
        client.write_marker(&previous, &root, size, ts)
    }

    pub async fn commit(&self, client: &Client, conn: &str, size: i64) -> Result<CommitResult, CommitRejection> {
        let wm = self.marker_for(client, conn, size).await;
        self.node.commit_write(&client.ctx(), conn, wm).await
    }

    /// Commit with a marker whose new root is not previewed.
    pub async fn commit_unchecked(
        &self,
        client: &Client,
        conn: &str,
        size: i64,
    ) -> Result<CommitResult, CommitRejection> {
        let previous = self.current_root().await;
        let wm = client.write_marker(&previous, "unpreviewed", size, now_secs());
        self.node.commit_write(&client.ctx(), conn, wm).await
    }

    /// Stage and commit one whole-file insert as the owner.
    pub async fn put_file(&self, conn: &str, path: &str, data: &[u8]) -> CommitResult {
        let staged = self.stage(&self.owner, conn, FileOperation::Insert(upload(path, data))).await;
        self.commit(&self.owner, conn, staged.connection_size).await.expect("commit")
    }
}
