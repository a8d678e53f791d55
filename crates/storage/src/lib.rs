//! blobber-storage
//!
//! Content store of the blobber node: staged (per connection) chunked
//! uploads with resumable hashing, content-addressed permanent objects, and
//! block-granular reads.

pub mod chunker;
pub mod store;
pub mod localfs;

pub use crate::chunker::{num_blocks, BLOCK_SIZE};
pub use crate::localfs::LocalFsStorage;
pub use crate::store::{ChunkInput, ContentStore, StoreError, WriteChunkResult};
