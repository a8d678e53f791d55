//! Insert and update: the only commands that move bytes.

use blobber_storage::{ChunkInput, ContentStore, WriteChunkResult};
use tracing::warn;

use crate::error::BlobberError;
use crate::reference::FileAttributes;

use super::{FileChange, PreparedChange, StageEngine, StageView, ThumbnailUpload, UploadChange, UploadPayload};

pub(super) fn stage(
    engine: &StageEngine,
    view: &StageView,
    payload: UploadPayload,
    is_update: bool,
) -> Result<PreparedChange, BlobberError> {
    let delta = authorize(engine, view, &payload, is_update)?;
    view.check_capacity(delta)?;

    let chunk = process_content(engine, view, &payload)?;
    let thumbnail = match &payload.thumbnail {
        Some(thumb) => Some(process_thumbnail(engine, view, thumb)?),
        None => prior_thumbnail(view),
    };

    let attrs = FileAttributes {
        path: view.path.clone(),
        size: payload.size,
        content_hash: payload.content_hash.clone(),
        merkle_root: payload.merkle_root,
        actual_file_size: payload.actual_file_size,
        actual_file_hash: payload.actual_file_hash,
        mime_type: payload.mime_type,
        encrypted_key: payload.encrypted_key,
        thumbnail,
    };
    let change = FileChange::Upload(UploadChange {
        attrs,
        is_update,
        complete: payload.is_final,
        staged_size: chunk.size,
    });

    Ok(PreparedChange {
        change,
        size: delta,
        staged_bytes: chunk.size,
        content_hash: chunk.content_hash,
        chunk_uploaded: chunk.chunk_uploaded,
    })
}

/// Who may write, and whether the path is in the required state. Returns the
/// byte delta the change will apply.
fn authorize(
    engine: &StageEngine,
    view: &StageView,
    payload: &UploadPayload,
    is_update: bool,
) -> Result<i64, BlobberError> {
    if payload.content_hash.is_empty() {
        return Err(BlobberError::InvalidParameters("missing content hash".into()));
    }
    if payload.size > engine.max_file_size() {
        return Err(BlobberError::InvalidParameters(format!(
            "file size {} exceeds the maximum of {}",
            payload.size,
            engine.max_file_size()
        )));
    }
    if view.path == crate::reference::ROOT_PATH {
        return Err(BlobberError::InvalidParameters("cannot upload to the root directory".into()));
    }

    if !is_update {
        view.require_writer()?;
        if view.target.is_some() {
            return Err(BlobberError::DuplicateFile(view.path.clone()));
        }
        return Ok(payload.size as i64);
    }

    if !view.allocation.can_write(&view.client_id) && !view.is_collaborator {
        return Err(BlobberError::InvalidOperation(
            "operation needs to be performed by the owner, the payer or a collaborator".into(),
        ));
    }
    let existing = view.require_target()?;
    if existing.is_dir() {
        return Err(BlobberError::InvalidFileUpdate(format!("{} is a directory", view.path)));
    }
    Ok(payload.size as i64 - existing.size as i64)
}

fn process_content(
    engine: &StageEngine,
    view: &StageView,
    payload: &UploadPayload,
) -> Result<WriteChunkResult, BlobberError> {
    let store = engine.store();
    let alloc_id = view.allocation.id.as_str();
    let conn_id = view.connection.connection_id.as_str();

    if payload.upload_offset == 0 {
        store.discard_staged_file(alloc_id, conn_id, &view.path, false)?;
    }
    let input = ChunkInput {
        path: view.path.clone(),
        upload_offset: payload.upload_offset,
        is_final: payload.is_final,
        is_thumbnail: false,
    };
    let result = store.write_chunk(alloc_id, conn_id, &input, &mut payload.data.as_slice())?;

    if result.size > payload.size {
        store.discard_staged_file(alloc_id, conn_id, &view.path, false)?;
        return Err(BlobberError::ContentHashMismatch(format!(
            "staged {} bytes, more than the declared {}",
            result.size, payload.size
        )));
    }
    if payload.is_final && (result.size != payload.size || result.content_hash != payload.content_hash) {
        warn!(
            allocation = alloc_id,
            connection = conn_id,
            path = %view.path,
            declared = %payload.content_hash,
            computed = %result.content_hash,
            "uploaded content does not match declaration"
        );
        store.discard_staged_file(alloc_id, conn_id, &view.path, false)?;
        return Err(BlobberError::ContentHashMismatch(format!(
            "declared {} ({} bytes), received {} ({} bytes)",
            payload.content_hash, payload.size, result.content_hash, result.size
        )));
    }
    Ok(result)
}

fn process_thumbnail(
    engine: &StageEngine,
    view: &StageView,
    thumb: &ThumbnailUpload,
) -> Result<(u64, String), BlobberError> {
    let store = engine.store();
    let alloc_id = view.allocation.id.as_str();
    let conn_id = view.connection.connection_id.as_str();

    store.discard_staged_file(alloc_id, conn_id, &view.path, true)?;
    let input = ChunkInput { path: view.path.clone(), upload_offset: 0, is_final: true, is_thumbnail: true };
    let result = store.write_chunk(alloc_id, conn_id, &input, &mut thumb.data.as_slice())?;

    if result.size != thumb.size || result.content_hash != thumb.content_hash {
        store.discard_staged_file(alloc_id, conn_id, &view.path, true)?;
        return Err(BlobberError::ContentHashMismatch(format!(
            "thumbnail declared {} ({} bytes), received {} ({} bytes)",
            thumb.content_hash, thumb.size, result.content_hash, result.size
        )));
    }
    Ok((result.size, result.content_hash))
}

/// Undo the chunk appended at `offset` after the change carrying it failed
/// to persist.
pub(super) fn rollback_chunk(store: &dyn ContentStore, view: &StageView, offset: u64) {
    let alloc_id = view.allocation.id.as_str();
    let conn_id = view.connection.connection_id.as_str();
    if let Err(e) = store.truncate_staged_file(alloc_id, conn_id, &view.path, false, offset) {
        warn!(
            allocation = alloc_id,
            connection = conn_id,
            path = %view.path,
            error = %e,
            "failed to roll back staged chunk"
        );
    }
}

/// A thumbnail staged with an earlier chunk of the same upload.
fn prior_thumbnail(view: &StageView) -> Option<(u64, String)> {
    match &view.prior {
        Some(FileChange::Upload(prev)) => prev.attrs.thumbnail.clone(),
        _ => None,
    }
}
