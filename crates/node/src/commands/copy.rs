use crate::error::BlobberError;
use crate::reference::{clean_path, ROOT_PATH};

use super::{FileChange, PreparedChange, StageView};

/// A copy occupies as much space again as its source.
pub(super) fn stage(view: &StageView, dest_dir: &str) -> Result<PreparedChange, BlobberError> {
    view.require_writer()?;
    if view.path == ROOT_PATH {
        return Err(BlobberError::InvalidParameters("cannot copy the root directory".into()));
    }
    let dest_dir = clean_path(dest_dir)?;
    if dest_dir == view.path || dest_dir.starts_with(&format!("{}/", view.path)) {
        return Err(BlobberError::InvalidParameters("cannot copy a directory into itself".into()));
    }
    let target = view.require_target()?;
    if view.produced_exists || view.produced_path == view.path {
        return Err(BlobberError::DuplicateFile(view.produced_path.clone()));
    }
    let size = target.size as i64;
    view.check_capacity(size)?;

    Ok(PreparedChange {
        change: FileChange::Copy { path: view.path.clone(), dest_dir },
        size,
        staged_bytes: 0,
        content_hash: String::new(),
        chunk_uploaded: false,
    })
}
