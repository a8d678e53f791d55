//! # Blobber Node Crate
//!
//! Allocation commit and read-authorization protocol of a blobber storage
//! node. Clients stage file operations into a connection, then commit the
//! connection with a signed write marker that moves the allocation root
//! forward. Reads are paid block by block with signed read markers whose
//! counter only ever increases.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            BlobberNode                                │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                       │
//! │   stage_change ──▶ StageEngine ──▶ connections (LMDB) + staged files  │
//! │                                                                       │
//! │   commit_write ──▶ CommitEngine ──▶ TreeWriter ──▶ refs / root        │
//! │                         │                                             │
//! │                         └──▶ PoolAccounting ──▶ pending, redeems      │
//! │                                                                       │
//! │   authorize_read ─▶ ReadEngine ──▶ auth tickets, pools, ContentStore  │
//! │                                                                       │
//! │   ConnectionSweeper (tokio task) ──▶ stale connections                │
//! │                                                                       │
//! │   AllocationSource / PoolSource (chain, async) ◀── MockChain          │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Locking
//!
//! | Operation        | Locks taken (in order)        |
//! |------------------|-------------------------------|
//! | `stage_change`   | allocation, then connection   |
//! | `commit_write`   | allocation, then connection   |
//! | `preview_root`   | connection                    |
//! | `authorize_read` | reader (per client)           |
//!
//! No LMDB transaction is ever held across an `.await`.
//!
//! # Modules
//!
//! - `db`: LMDB environment and the named tables
//! - `allocation`: allocation rows and the chain-backed registry
//! - `reference`: the reference tree and root hashing
//! - `connection`: staged change collector
//! - `commands`: per-operation validation and staging
//! - `commit`: write-marker commit engine
//! - `download`: read-marker authorization engine
//! - `pools`: pending / pool pre-redeem accounting
//! - `redeem`: redemption ledger
//! - `auth_ticket`: share tickets for non-owner reads
//! - `collaborators`: per-file update rights
//! - `sweeper`: background reclamation of abandoned connections
//! - `node`: the facade wiring all of the above

pub mod allocation;
pub mod auth_ticket;
pub mod chain;
pub mod collaborators;
pub mod commands;
pub mod commit;
pub mod connection;
pub mod context;
pub mod db;
pub mod download;
pub mod error;
pub mod locks;
pub mod mock_chain;
pub mod node;
pub mod pools;
pub mod read_marker;
pub mod redeem;
pub mod reference;
pub mod sweeper;
pub mod write_marker;

use std::time::{SystemTime, UNIX_EPOCH};

pub use crate::allocation::Allocation;
pub use crate::auth_ticket::{AuthTicket, ShareInfo};
pub use crate::chain::{AllocationInfo, AllocationSource, ChainError, PoolBalance, PoolSource};
pub use crate::commands::{FileOperation, StageResult, ThumbnailUpload, UploadPayload};
pub use crate::commit::CommitResult;
pub use crate::context::RequestContext;
pub use crate::download::{ContentKind, ReadOutcome, ReadRequest};
pub use crate::error::{BlobberError, CommitRejection};
pub use crate::mock_chain::MockChain;
pub use crate::node::BlobberNode;
pub use crate::read_marker::ReadMarker;
pub use crate::write_marker::WriteMarker;

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
