use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

use blobber_common::cid::sha3_256_hex;

use crate::chunker::block_range;
use crate::store::{ChunkInput, ContentStore, StoreError, WriteChunkResult};

const COPY_BUF: usize = 64 * 1024;

/// Hash state of one staged file. Kept in memory between chunks; rebuilt by
/// replaying the staged bytes when missing (e.g. after a restart).
#[derive(Clone)]
struct StagedState {
    hasher: Sha256,
    written: u64,
}

/// Local filesystem backend
///
/// ```text
/// <root>/temp/<allocation>/<connection>/<sha3(path)>[.thumb]   staged
/// <root>/objects/<allocation>/<hash[0..2]>/<hash>              permanent
/// ```
#[derive(Debug)]
pub struct LocalFsStorage {
    temp_dir: PathBuf,
    objects_dir: PathBuf,
    staged: Mutex<HashMap<PathBuf, StagedState>>,
}

impl std::fmt::Debug for StagedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedState").field("written", &self.written).finish()
    }
}

impl LocalFsStorage {
    /// Create new localfs backend rooted at base_dir.
    /// It will create base_dir/temp and base_dir/objects if missing.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base = base_dir.as_ref();
        let temp_dir = base.join("temp");
        let objects_dir = base.join("objects");
        fs::create_dir_all(&temp_dir)?;
        fs::create_dir_all(&objects_dir)?;
        Ok(LocalFsStorage {
            temp_dir,
            objects_dir,
            staged: Mutex::new(HashMap::new()),
        })
    }

    fn connection_dir(&self, allocation_id: &str, connection_id: &str) -> PathBuf {
        self.temp_dir.join(allocation_id).join(connection_id)
    }

    fn staged_path(&self, allocation_id: &str, connection_id: &str, path: &str, thumb: bool) -> PathBuf {
        let mut name = sha3_256_hex(path.as_bytes());
        if thumb {
            name.push_str(".thumb");
        }
        self.connection_dir(allocation_id, connection_id).join(name)
    }

    /// Compute object path for a given hash: objects/<allocation>/<first2>/<hash>
    fn object_path(&self, allocation_id: &str, hash: &str) -> Result<PathBuf, StoreError> {
        if hash.len() < 2 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StoreError::InvalidHash(hash.to_string()));
        }
        Ok(self.objects_dir.join(allocation_id).join(&hash[0..2]).join(hash))
    }

    /// Replay the staged bytes on disk into a fresh hasher.
    fn replay(file: &Path) -> Result<StagedState, StoreError> {
        let mut state = StagedState { hasher: Sha256::new(), written: 0 };
        if !file.exists() {
            return Ok(state);
        }
        let mut f = File::open(file)?;
        let mut buf = vec![0u8; COPY_BUF];
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            state.hasher.update(&buf[..n]);
            state.written += n as u64;
        }
        Ok(state)
    }
}

impl ContentStore for LocalFsStorage {
    fn write_chunk(
        &self,
        allocation_id: &str,
        connection_id: &str,
        input: &ChunkInput,
        reader: &mut dyn Read,
    ) -> Result<WriteChunkResult, StoreError> {
        let file = self.staged_path(allocation_id, connection_id, &input.path, input.is_thumbnail);

        // take the state out so disk IO runs without holding the map lock
        let cached = self.staged.lock().remove(&file);
        let mut state = match cached {
            Some(s) => s,
            None => Self::replay(&file)?,
        };

        if input.upload_offset != state.written {
            let expected = state.written;
            self.staged.lock().insert(file, state);
            return Err(StoreError::OffsetMismatch { expected, got: input.upload_offset });
        }

        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = OpenOptions::new().create(true).append(true).open(&file)?;
        let mut buf = vec![0u8; COPY_BUF];
        let mut appended = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            state.hasher.update(&buf[..n]);
            appended += n as u64;
        }
        out.sync_all()?;
        state.written += appended;

        let content_hash = if input.is_final {
            hex::encode(state.hasher.clone().finalize())
        } else {
            String::new()
        };
        let size = state.written;
        self.staged.lock().insert(file, state);

        debug!(
            allocation = allocation_id,
            connection = connection_id,
            path = %input.path,
            appended,
            size,
            "chunk staged"
        );

        Ok(WriteChunkResult { content_hash, size, chunk_uploaded: appended > 0 })
    }

    fn commit_staged(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
        is_thumbnail: bool,
        content_hash: &str,
    ) -> Result<(), StoreError> {
        let staged = self.staged_path(allocation_id, connection_id, path, is_thumbnail);
        let dest = self.object_path(allocation_id, content_hash)?;

        if !staged.exists() {
            // promoted by an earlier attempt, or deduplicated content
            if dest.exists() {
                return Ok(());
            }
            return Err(StoreError::StagedNotFound(path.to_string()));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if dest.exists() {
            // same content already stored; keep the existing object
            fs::remove_file(&staged)?;
        } else {
            fs::rename(&staged, &dest)?;
        }
        self.staged.lock().remove(&staged);
        Ok(())
    }

    fn discard_staged_file(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
        is_thumbnail: bool,
    ) -> Result<(), StoreError> {
        let file = self.staged_path(allocation_id, connection_id, path, is_thumbnail);
        self.staged.lock().remove(&file);
        match fs::remove_file(&file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn truncate_staged_file(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
        is_thumbnail: bool,
        len: u64,
    ) -> Result<(), StoreError> {
        let file = self.staged_path(allocation_id, connection_id, path, is_thumbnail);
        // hash state is rebuilt from disk on the next chunk
        self.staged.lock().remove(&file);
        let f = match OpenOptions::new().write(true).open(&file) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if f.metadata()?.len() > len {
            f.set_len(len)?;
            f.sync_all()?;
        }
        Ok(())
    }

    fn delete_staged(&self, allocation_id: &str, connection_id: &str) -> Result<(), StoreError> {
        let dir = self.connection_dir(allocation_id, connection_id);
        self.staged.lock().retain(|k, _| !k.starts_with(&dir));
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn get_block(
        &self,
        allocation_id: &str,
        content_hash: &str,
        block_num: u64,
        num_blocks: u64,
    ) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(allocation_id, content_hash)?;
        if !path.exists() {
            return Err(StoreError::NotFound(content_hash.to_string()));
        }
        let mut f = File::open(&path)?;
        let len = f.metadata()?.len();
        let (start, end) = match block_range(block_num, num_blocks, len) {
            Some(r) => r,
            None => return Ok(Vec::new()),
        };
        f.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; (end - start) as usize];
        f.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn has_content(&self, allocation_id: &str, content_hash: &str) -> Result<bool, StoreError> {
        Ok(self.object_path(allocation_id, content_hash)?.exists())
    }
}
