use std::fmt::Debug;
use std::io::Read;

use thiserror::Error;

/// Errors surfaced by a content store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The chunk does not continue where the staged bytes end.
    #[error("upload offset mismatch: expected {expected}, got {got}")]
    OffsetMismatch { expected: u64, got: u64 },

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("content not found: {0}")]
    NotFound(String),

    #[error("staged content not found for {0}")]
    StagedNotFound(String),
}

/// Describes one chunk of a staged upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInput {
    /// Logical file path inside the allocation.
    pub path: String,
    /// Byte offset of this chunk in the whole file.
    pub upload_offset: u64,
    /// Last chunk of the file; the store finalizes the content hash.
    pub is_final: bool,
    /// Stage into the thumbnail slot instead of the main content.
    pub is_thumbnail: bool,
}

/// Result of writing one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteChunkResult {
    /// SHA-256 of the whole staged file. Empty until the final chunk.
    pub content_hash: String,
    /// Total staged bytes for this path after the chunk.
    pub size: u64,
    /// Whether this call appended any bytes.
    pub chunk_uploaded: bool,
}

/// Content store contract consumed by the file operation commands and the
/// read path. Bytes are staged per `(allocation, connection, path)` and
/// promoted to content-addressed permanent storage on commit.
pub trait ContentStore: Debug + Send + Sync + 'static {
    fn write_chunk(
        &self,
        allocation_id: &str,
        connection_id: &str,
        input: &ChunkInput,
        reader: &mut dyn Read,
    ) -> Result<WriteChunkResult, StoreError>;

    /// Move a finalized staged file into permanent storage under `content_hash`.
    fn commit_staged(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
        is_thumbnail: bool,
        content_hash: &str,
    ) -> Result<(), StoreError>;

    /// Drop one staged file so its upload can restart from offset 0.
    fn discard_staged_file(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
        is_thumbnail: bool,
    ) -> Result<(), StoreError>;

    /// Cut one staged file back to its first `len` bytes, undoing chunks
    /// appended after that point.
    fn truncate_staged_file(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
        is_thumbnail: bool,
        len: u64,
    ) -> Result<(), StoreError>;

    /// Drop everything staged under a connection.
    fn delete_staged(&self, allocation_id: &str, connection_id: &str) -> Result<(), StoreError>;

    /// Read `num_blocks` blocks starting at 1-based `block_num`.
    fn get_block(
        &self,
        allocation_id: &str,
        content_hash: &str,
        block_num: u64,
        num_blocks: u64,
    ) -> Result<Vec<u8>, StoreError>;

    fn has_content(&self, allocation_id: &str, content_hash: &str) -> Result<bool, StoreError>;
}
