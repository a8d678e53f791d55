//! Error taxonomy of the commit and read-authorization protocol.
//!
//! ```text
//! client input      InvalidParameters, InvalidOperation, DuplicateFile, InvalidFileUpdate
//! capacity / quota  MaxAllocationSize, NotEnoughTokens
//! ordering          AllocationRootMismatch        (stale ReadMarker is not an error)
//! integrity         ContentHashMismatch, WriteMarkerVerificationFailed,
//!                   InvalidShare, AuthTicketVerificationFailed
//! collaborators     RequestError (chain round-trip failed)
//! internal          Internal (transaction rolled back)
//! ```
//!
//! Every variant maps to a stable snake_case code via [`BlobberError::code`].

use thiserror::Error;

use blobber_storage::StoreError;

use crate::chain::ChainError;
use crate::write_marker::WriteMarker;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BlobberError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("duplicate file: {0}")]
    DuplicateFile(String),

    #[error("invalid file update: {0}")]
    InvalidFileUpdate(String),

    #[error("max allocation size reached: used {used} + requested {requested} exceeds capacity {capacity}")]
    MaxAllocationSize { used: u64, requested: i64, capacity: u64 },

    #[error("not enough tokens: want {want}, have {have}")]
    NotEnoughTokens { want: u64, have: u64 },

    #[error("allocation root mismatch: expected {expected}, got {got}")]
    AllocationRootMismatch { expected: String, got: String },

    #[error("content hash mismatch: {0}")]
    ContentHashMismatch(String),

    #[error("write marker verification failed: {0}")]
    WriteMarkerVerificationFailed(String),

    #[error("invalid share: {0}")]
    InvalidShare(String),

    #[error("auth ticket verification failed: {0}")]
    AuthTicketVerificationFailed(String),

    #[error("request error: {0}")]
    RequestError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BlobberError {
    /// Stable error code surfaced to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParameters(_) => "invalid_parameters",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::DuplicateFile(_) => "duplicate_file",
            Self::InvalidFileUpdate(_) => "invalid_file_update",
            Self::MaxAllocationSize { .. } => "max_allocation_size",
            Self::NotEnoughTokens { .. } => "not_enough_tokens",
            Self::AllocationRootMismatch { .. } => "allocation_root_mismatch",
            Self::ContentHashMismatch(_) => "content_hash_mismatch",
            Self::WriteMarkerVerificationFailed(_) => "write_marker_verification_failed",
            Self::InvalidShare(_) => "invalid_share",
            Self::AuthTicketVerificationFailed(_) => "auth_ticket_verification_failed",
            Self::RequestError(_) => "request_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the same request may succeed later without the client
    /// changing it (only transient collaborator failures qualify).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RequestError(_))
    }
}

impl From<lmdb::Error> for BlobberError {
    fn from(e: lmdb::Error) -> Self {
        BlobberError::Internal(format!("lmdb: {}", e))
    }
}

impl From<bincode::Error> for BlobberError {
    fn from(e: bincode::Error) -> Self {
        BlobberError::Internal(format!("codec: {}", e))
    }
}

impl From<std::io::Error> for BlobberError {
    fn from(e: std::io::Error) -> Self {
        BlobberError::Internal(format!("io: {}", e))
    }
}

impl From<StoreError> for BlobberError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::OffsetMismatch { expected, got } => BlobberError::InvalidParameters(format!(
                "upload offset {} does not continue staged content, expected {}",
                got, expected
            )),
            other => BlobberError::Internal(format!("content store: {}", other)),
        }
    }
}

impl From<ChainError> for BlobberError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::NotFound(what) => BlobberError::InvalidParameters(format!("not found on chain: {}", what)),
            other => BlobberError::RequestError(other.to_string()),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// COMMIT REJECTION
// ════════════════════════════════════════════════════════════════════════════

/// Failed commit. Always carries the authoritative ledger head so the client
/// can resynchronize and resubmit against it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{error}")]
pub struct CommitRejection {
    pub error: BlobberError,
    /// Current allocation root (empty when the allocation is unknown).
    pub allocation_root: String,
    /// Last committed write marker, `None` before the first commit.
    pub latest_write_marker: Option<WriteMarker>,
}

impl CommitRejection {
    pub fn code(&self) -> &'static str {
        self.error.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(BlobberError::InvalidParameters("x".into()).code(), "invalid_parameters");
        assert_eq!(
            BlobberError::MaxAllocationSize { used: 1, requested: 2, capacity: 2 }.code(),
            "max_allocation_size"
        );
        assert_eq!(BlobberError::Internal("x".into()).code(), "internal_error");
    }

    #[test]
    fn test_offset_mismatch_is_client_error() {
        let e: BlobberError = StoreError::OffsetMismatch { expected: 10, got: 4 }.into();
        assert_eq!(e.code(), "invalid_parameters");
        assert!(e.to_string().contains("expected 10"));
    }

    #[test]
    fn test_chain_errors_are_transient() {
        let e: BlobberError = ChainError::Unavailable("timeout".into()).into();
        assert!(e.is_transient());
        let e: BlobberError = ChainError::NotFound("alloc".into()).into();
        assert!(!e.is_transient());
    }
}
