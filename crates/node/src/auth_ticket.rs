//! # Auth Tickets & Share Info
//!
//! A non-owner reads a file with an owner-signed [`AuthTicket`] naming the
//! file (or an enclosing directory), plus a [`ShareInfo`] row the owner
//! registered on this node for the reader.
//!
//! ```text
//! ticket missing / share row missing / revoked / not yet available → InvalidShare
//! bad signature / expired / wrong allocation, client, owner / out of scope
//!                                                   → AuthTicketVerificationFailed
//! ```
//!
//! A ticket with an empty `client_id` is public; its share row is the one
//! registered for the empty client id.

use lmdb::Transaction;
use serde::{Deserialize, Serialize};

use blobber_common::cid::sha3_256_hex;
use blobber_common::crypto::{sign_hex, CryptoError};
use blobber_common::SignatureVerifier;

use crate::allocation::Allocation;
use crate::db::{get_value, put_value, BlobberDb, Buckets};
use crate::error::BlobberError;
use crate::reference::{get_by_lookup_hash, Ref, RefType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTicket {
    /// Reader the ticket was issued to. Empty for public tickets.
    pub client_id: String,
    pub owner_id: String,
    pub allocation_id: String,
    /// Lookup hash of the shared file or directory.
    pub file_path_hash: String,
    pub file_name: String,
    pub ref_type: RefType,
    /// Unix seconds; 0 never expires.
    pub expiration: u64,
    pub timestamp: u64,
    pub re_encryption_key: String,
    pub signature: String,
}

impl AuthTicket {
    pub fn hash_data(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}",
            self.allocation_id,
            self.client_id,
            self.owner_id,
            self.file_path_hash,
            self.file_name,
            self.ref_type.as_str(),
            self.re_encryption_key,
            self.expiration,
            self.timestamp
        )
    }

    pub fn hash(&self) -> String {
        sha3_256_hex(self.hash_data().as_bytes())
    }

    /// Sign with the owner's 64-byte keypair.
    pub fn sign(&mut self, owner_keypair: &[u8]) -> Result<(), CryptoError> {
        self.signature = sign_hex(owner_keypair, self.hash().as_bytes())?;
        Ok(())
    }

    pub fn is_public(&self) -> bool {
        self.client_id.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareInfo {
    pub owner_id: String,
    pub client_id: String,
    pub file_path_hash: String,
    pub re_encryption_key: String,
    pub revoked: bool,
    /// Unix seconds before which the share cannot be used.
    pub available_at: u64,
    pub created_at: u64,
}

// ════════════════════════════════════════════════════════════════════════════
// SHARE STORE
// ════════════════════════════════════════════════════════════════════════════

pub trait ShareStore: Send + Sync {
    fn get_share_info(&self, client_id: &str, file_path_hash: &str) -> Result<Option<ShareInfo>, BlobberError>;

    fn put_share_info(&self, info: &ShareInfo) -> Result<(), BlobberError>;

    /// Returns `false` when no such share exists.
    fn revoke_share_info(&self, client_id: &str, file_path_hash: &str) -> Result<bool, BlobberError>;
}

fn share_key(client_id: &str, file_path_hash: &str) -> String {
    format!("{}:{}", client_id, file_path_hash)
}

pub fn load_share_info<Tx: Transaction>(
    txn: &Tx,
    b: &Buckets,
    client_id: &str,
    file_path_hash: &str,
) -> Result<Option<ShareInfo>, BlobberError> {
    get_value(txn, b.share_info, &share_key(client_id, file_path_hash))
}

/// [`ShareStore`] over the `share_info` table.
#[derive(Debug, Clone)]
pub struct DbShareStore {
    db: BlobberDb,
}

impl DbShareStore {
    pub fn new(db: BlobberDb) -> Self {
        Self { db }
    }
}

impl ShareStore for DbShareStore {
    fn get_share_info(&self, client_id: &str, file_path_hash: &str) -> Result<Option<ShareInfo>, BlobberError> {
        self.db.read(|txn, b| load_share_info(txn, b, client_id, file_path_hash))
    }

    fn put_share_info(&self, info: &ShareInfo) -> Result<(), BlobberError> {
        let key = share_key(&info.client_id, &info.file_path_hash);
        self.db.write(|txn, b| put_value(txn, b.share_info, &key, info))
    }

    fn revoke_share_info(&self, client_id: &str, file_path_hash: &str) -> Result<bool, BlobberError> {
        let key = share_key(client_id, file_path_hash);
        self.db.write(|txn, b| match get_value::<ShareInfo, _>(&*txn, b.share_info, &key)? {
            Some(mut info) => {
                info.revoked = true;
                put_value(txn, b.share_info, &key, &info)?;
                Ok(true)
            }
            None => Ok(false),
        })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// VERIFICATION
// ════════════════════════════════════════════════════════════════════════════

fn ticket_failed(msg: impl Into<String>) -> BlobberError {
    BlobberError::AuthTicketVerificationFailed(msg.into())
}

/// Check the ticket against the allocation, the reader and the target file.
/// `shared` is the ref the ticket's `file_path_hash` resolves to.
pub fn verify_auth_ticket(
    ticket: &AuthTicket,
    allocation: &Allocation,
    reader_id: &str,
    target: &Ref,
    shared: Option<&Ref>,
    verifier: &dyn SignatureVerifier,
    now: u64,
) -> Result<(), BlobberError> {
    if ticket.allocation_id != allocation.id {
        return Err(ticket_failed("ticket was issued for another allocation"));
    }
    if ticket.owner_id != allocation.owner_id {
        return Err(ticket_failed("ticket was not issued by the allocation owner"));
    }
    if !ticket.is_public() && ticket.client_id != reader_id {
        return Err(ticket_failed("ticket was issued to another client"));
    }
    if ticket.expiration > 0 && ticket.expiration <= now {
        return Err(ticket_failed("ticket expired"));
    }
    if !verifier.verify(&allocation.owner_public_key, ticket.hash().as_bytes(), &ticket.signature) {
        return Err(ticket_failed("invalid ticket signature"));
    }

    let shared = shared.ok_or_else(|| ticket_failed("shared path no longer exists"))?;
    let in_scope = match ticket.ref_type {
        RefType::File => shared.is_file() && shared.lookup_hash == target.lookup_hash,
        RefType::Directory => {
            shared.is_dir() && (shared.path == "/" || target.path.starts_with(&format!("{}/", shared.path)))
        }
    };
    if !in_scope {
        return Err(ticket_failed("file is outside the ticket's scope"));
    }
    Ok(())
}

/// Share row the reader needs next to a verified ticket.
pub fn check_share_info(info: Option<&ShareInfo>, now: u64) -> Result<(), BlobberError> {
    let info = info.ok_or_else(|| BlobberError::InvalidShare("client has no share for this file".into()))?;
    if info.revoked {
        return Err(BlobberError::InvalidShare("share was revoked".into()));
    }
    if info.available_at > now {
        return Err(BlobberError::InvalidShare(format!("share is not available until {}", info.available_at)));
    }
    Ok(())
}

/// Full non-owner authorization used by the read path.
pub fn authorize_share<Tx: Transaction>(
    txn: &Tx,
    b: &Buckets,
    ticket: Option<&AuthTicket>,
    allocation: &Allocation,
    reader_id: &str,
    target: &Ref,
    verifier: &dyn SignatureVerifier,
    now: u64,
) -> Result<(), BlobberError> {
    let ticket = ticket.ok_or_else(|| BlobberError::InvalidShare("missing auth ticket".into()))?;
    let shared = get_by_lookup_hash(txn, b, &ticket.file_path_hash)?;
    verify_auth_ticket(ticket, allocation, reader_id, target, shared.as_ref(), verifier, now)?;

    let share_client = if ticket.is_public() { "" } else { reader_id };
    let info = load_share_info(txn, b, share_client, &ticket.file_path_hash)?;
    check_share_info(info.as_ref(), now)
}
