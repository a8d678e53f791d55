//! Request-scoped identity, built once at the transport boundary.

use blobber_common::crypto::client_id_from_public_key;

use crate::error::BlobberError;

/// Who is calling, and on which allocation.
///
/// Construction checks that `client_id` is the hash of `client_key`, so
/// everything downstream can trust the pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub client_id: String,
    pub client_key: String,
    /// Allocation transaction id as known on chain.
    pub allocation_tx: String,
}

impl RequestContext {
    pub fn new(
        client_id: impl Into<String>,
        client_key: impl Into<String>,
        allocation_tx: impl Into<String>,
    ) -> Result<Self, BlobberError> {
        let client_id = client_id.into();
        let client_key = client_key.into();
        let allocation_tx = allocation_tx.into();

        if client_id.is_empty() {
            return Err(BlobberError::InvalidOperation("operation needs to be performed by a client".into()));
        }
        if allocation_tx.is_empty() {
            return Err(BlobberError::InvalidParameters("missing allocation".into()));
        }
        let derived = client_id_from_public_key(&client_key)
            .map_err(|e| BlobberError::InvalidParameters(format!("invalid client key: {}", e)))?;
        if derived != client_id {
            return Err(BlobberError::InvalidParameters("client id does not match client key".into()));
        }

        Ok(Self { client_id, client_key, allocation_tx })
    }
}
