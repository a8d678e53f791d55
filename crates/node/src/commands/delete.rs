use crate::error::BlobberError;
use crate::reference::ROOT_PATH;

use super::{FileChange, PreparedChange, StageView};

/// Removing a file or directory frees its whole size.
pub(super) fn stage(view: &StageView) -> Result<PreparedChange, BlobberError> {
    view.require_writer()?;
    if view.path == ROOT_PATH {
        return Err(BlobberError::InvalidParameters("cannot delete the root directory".into()));
    }
    let target = view.require_target()?;

    Ok(PreparedChange {
        change: FileChange::Delete { path: view.path.clone() },
        size: -(target.size as i64),
        staged_bytes: 0,
        content_hash: String::new(),
        chunk_uploaded: false,
    })
}
