//! Per-file collaborator list. A collaborator may stage `Update` changes for
//! the file without owning the allocation. Rows live under
//! `{lookup_hash}:{client_id}` and follow the file through renames.

use std::sync::Arc;

use lmdb::{RwTransaction, Transaction};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::allocation::AllocationRegistry;
use crate::context::RequestContext;
use crate::db::{delete_key, delete_prefix, get_value, put_value, scan_prefix, BlobberDb, Buckets};
use crate::error::BlobberError;
use crate::now_secs;
use crate::reference::{clean_path, get_by_path, lookup_hash};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub client_id: String,
    pub created_at: u64,
}

fn row_key(lookup: &str, client_id: &str) -> String {
    format!("{}:{}", lookup, client_id)
}

fn row_prefix(lookup: &str) -> String {
    format!("{}:", lookup)
}

pub fn is_collaborator<Tx: Transaction>(
    txn: &Tx,
    b: &Buckets,
    lookup: &str,
    client_id: &str,
) -> Result<bool, BlobberError> {
    Ok(get_value::<Collaborator, _>(txn, b.collaborators, &row_key(lookup, client_id))?.is_some())
}

pub(crate) fn clear_collaborators(txn: &mut RwTransaction<'_>, b: &Buckets, lookup: &str) -> Result<(), BlobberError> {
    delete_prefix(txn, b.collaborators, &row_prefix(lookup))?;
    Ok(())
}

pub(crate) fn move_collaborators(
    txn: &mut RwTransaction<'_>,
    b: &Buckets,
    from: &str,
    to: &str,
) -> Result<(), BlobberError> {
    let rows: Vec<(String, Collaborator)> = scan_prefix(&*txn, b.collaborators, &row_prefix(from))?;
    for (key, row) in rows {
        delete_key(txn, b.collaborators, &key)?;
        put_value(txn, b.collaborators, &row_key(to, &row.client_id), &row)?;
    }
    Ok(())
}

pub struct CollaboratorService {
    db: BlobberDb,
    registry: Arc<AllocationRegistry>,
}

impl CollaboratorService {
    pub fn new(db: BlobberDb, registry: Arc<AllocationRegistry>) -> Self {
        Self { db, registry }
    }

    /// Owner check plus existence of the target file; returns its lookup hash.
    async fn authorize(&self, ctx: &RequestContext, path: &str) -> Result<(String, String), BlobberError> {
        let alloc = self.registry.verify_allocation(&ctx.allocation_tx).await?;
        if !alloc.is_owner(&ctx.client_id) {
            return Err(BlobberError::InvalidOperation("only the allocation owner manages collaborators".into()));
        }
        let path = clean_path(path)?;
        let exists = self.db.read(|txn, b| get_by_path(txn, b, &alloc.id, &path))?;
        match exists {
            Some(r) if r.is_file() => Ok((alloc.id.clone(), lookup_hash(&alloc.id, &path))),
            Some(_) => Err(BlobberError::InvalidParameters(format!("{} is a directory", path))),
            None => Err(BlobberError::InvalidParameters(format!("file {} does not exist", path))),
        }
    }

    pub async fn add(&self, ctx: &RequestContext, path: &str, collaborator_id: &str) -> Result<(), BlobberError> {
        if collaborator_id.is_empty() {
            return Err(BlobberError::InvalidParameters("missing collaborator id".into()));
        }
        let (allocation_id, lookup) = self.authorize(ctx, path).await?;
        let row = Collaborator { client_id: collaborator_id.to_string(), created_at: now_secs() };
        self.db.write(|txn, b| put_value(txn, b.collaborators, &row_key(&lookup, collaborator_id), &row))?;
        info!(allocation = %allocation_id, path, collaborator = collaborator_id, "collaborator added");
        Ok(())
    }

    pub async fn remove(&self, ctx: &RequestContext, path: &str, collaborator_id: &str) -> Result<(), BlobberError> {
        let (allocation_id, lookup) = self.authorize(ctx, path).await?;
        let existed = self.db.write(|txn, b| delete_key(txn, b.collaborators, &row_key(&lookup, collaborator_id)))?;
        if !existed {
            return Err(BlobberError::InvalidParameters(format!("{} is not a collaborator", collaborator_id)));
        }
        info!(allocation = %allocation_id, path, collaborator = collaborator_id, "collaborator removed");
        Ok(())
    }

    pub async fn list(&self, ctx: &RequestContext, path: &str) -> Result<Vec<Collaborator>, BlobberError> {
        let (_, lookup) = self.authorize(ctx, path).await?;
        let rows: Vec<(String, Collaborator)> =
            self.db.read(|txn, b| scan_prefix(txn, b.collaborators, &row_prefix(&lookup)))?;
        Ok(rows.into_iter().map(|(_, c)| c).collect())
    }
}
