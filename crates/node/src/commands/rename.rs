use crate::error::BlobberError;
use crate::reference::ROOT_PATH;

use super::{FileChange, PreparedChange, StageView};

pub(super) fn stage(view: &StageView, new_name: &str) -> Result<PreparedChange, BlobberError> {
    view.require_writer()?;
    if view.path == ROOT_PATH {
        return Err(BlobberError::InvalidParameters("cannot rename the root directory".into()));
    }
    if new_name.is_empty() || new_name == "." || new_name == ".." || new_name.contains('/') {
        return Err(BlobberError::InvalidParameters(format!("invalid name {:?}", new_name)));
    }
    view.require_target()?;
    if view.produced_exists {
        return Err(BlobberError::DuplicateFile(view.produced_path.clone()));
    }

    Ok(PreparedChange {
        change: FileChange::Rename { path: view.path.clone(), new_name: new_name.to_string() },
        size: 0,
        staged_bytes: 0,
        content_hash: String::new(),
        chunk_uploaded: false,
    })
}
