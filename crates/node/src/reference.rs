//! # Reference Tree
//!
//! Persisted namespace of an allocation. Every node is a [`Ref`] stored under
//! its lookup hash, `sha3(allocation_id:path)`; directories list their
//! children by name, sorted.
//!
//! ## Hashing
//!
//! ```text
//! file  hash = sha3(allocation_id:f:name:path:size:content_hash:merkle_root:actual_size:actual_hash)
//! dir   hash = sha3(child_hash_1:child_hash_2:...)      (child name order)
//! dir   size = Σ child size
//! root       = sha3(root_hash:timestamp)                (allocation root)
//! ```
//!
//! Mutations go through [`TreeWriter`], which borrows the commit transaction.
//! Directories touched by a mutation are marked dirty and recomputed deepest
//! first in [`TreeWriter::finish`], so a batch of changes costs one pass over
//! the affected spine.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use lmdb::{RwTransaction, Transaction};
use serde::{Deserialize, Serialize};

use blobber_common::cid::{sha3_256_hex, sha3_joined};
use blobber_storage::num_blocks;

use crate::collaborators::{clear_collaborators, move_collaborators};
use crate::db::{delete_key, get_value, put_value, Buckets};
use crate::error::BlobberError;

pub const ROOT_PATH: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefType {
    File,
    Directory,
}

impl RefType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefType::File => "f",
            RefType::Directory => "d",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ref {
    pub allocation_id: String,
    pub lookup_hash: String,
    pub path: String,
    pub name: String,
    pub ref_type: RefType,
    pub parent_path: String,
    pub size: u64,
    pub content_hash: String,
    pub merkle_root: String,
    pub actual_file_size: u64,
    pub actual_file_hash: String,
    pub thumbnail_size: u64,
    pub thumbnail_hash: String,
    pub mime_type: String,
    pub num_blocks: u64,
    pub encrypted_key: String,
    pub hash: String,
    /// Sorted child names (directories only).
    pub children: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Ref {
    pub fn is_file(&self) -> bool {
        self.ref_type == RefType::File
    }

    pub fn is_dir(&self) -> bool {
        self.ref_type == RefType::Directory
    }

    fn new_dir(allocation_id: &str, path: &str, now: u64) -> Self {
        Self {
            allocation_id: allocation_id.to_string(),
            lookup_hash: lookup_hash(allocation_id, path),
            path: path.to_string(),
            name: base_name(path),
            ref_type: RefType::Directory,
            parent_path: parent_path(path),
            size: 0,
            content_hash: String::new(),
            merkle_root: String::new(),
            actual_file_size: 0,
            actual_file_hash: String::new(),
            thumbnail_size: 0,
            thumbnail_hash: String::new(),
            mime_type: String::new(),
            num_blocks: 0,
            encrypted_key: String::new(),
            hash: empty_dir_hash(),
            children: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn file_hash(&self) -> String {
        sha3_joined(&[
            self.allocation_id.clone(),
            self.ref_type.as_str().to_string(),
            self.name.clone(),
            self.path.clone(),
            self.size.to_string(),
            self.content_hash.clone(),
            self.merkle_root.clone(),
            self.actual_file_size.to_string(),
            self.actual_file_hash.clone(),
        ])
    }

    fn apply_attributes(&mut self, attrs: &FileAttributes) {
        self.size = attrs.size;
        self.content_hash = attrs.content_hash.clone();
        self.merkle_root = attrs.merkle_root.clone();
        self.actual_file_size = attrs.actual_file_size;
        self.actual_file_hash = attrs.actual_file_hash.clone();
        self.mime_type = attrs.mime_type.clone();
        self.encrypted_key = attrs.encrypted_key.clone();
        self.num_blocks = num_blocks(attrs.size);
        if let Some((size, hash)) = &attrs.thumbnail {
            self.thumbnail_size = *size;
            self.thumbnail_hash = hash.clone();
        }
        self.hash = self.file_hash();
    }
}

/// Metadata of a committed file version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FileAttributes {
    pub path: String,
    pub size: u64,
    pub content_hash: String,
    pub merkle_root: String,
    pub actual_file_size: u64,
    pub actual_file_hash: String,
    pub mime_type: String,
    pub encrypted_key: String,
    /// `(size, hash)` of a thumbnail uploaded with this version.
    pub thumbnail: Option<(u64, String)>,
}

// ════════════════════════════════════════════════════════════════════════════
// PATHS & HASHES
// ════════════════════════════════════════════════════════════════════════════

/// Normalize an absolute path: collapse separators, resolve `.` and `..`.
pub fn clean_path(raw: &str) -> Result<String, BlobberError> {
    if !raw.starts_with('/') {
        return Err(BlobberError::InvalidParameters(format!("path must be absolute: {:?}", raw)));
    }
    let mut parts: Vec<&str> = Vec::new();
    for seg in raw.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(BlobberError::InvalidParameters(format!("path escapes root: {:?}", raw)));
                }
            }
            s => parts.push(s),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

pub fn parent_path(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => ROOT_PATH.to_string(),
        Some(i) => path[..i].to_string(),
    }
}

pub fn base_name(path: &str) -> String {
    if path == ROOT_PATH {
        return ROOT_PATH.to_string();
    }
    path.rsplit('/').next().unwrap_or_default().to_string()
}

pub fn join_path(dir: &str, name: &str) -> String {
    if dir == ROOT_PATH {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

fn depth(path: &str) -> usize {
    path.split('/').filter(|s| !s.is_empty()).count()
}

pub fn lookup_hash(allocation_id: &str, path: &str) -> String {
    sha3_joined(&[allocation_id, path])
}

pub fn empty_dir_hash() -> String {
    sha3_256_hex(b"")
}

/// Ledger head derived from the root directory hash and the marker time.
pub fn allocation_root(root_hash: &str, timestamp: u64) -> String {
    sha3_joined(&[root_hash.to_string(), timestamp.to_string()])
}

// ════════════════════════════════════════════════════════════════════════════
// READ ACCESS
// ════════════════════════════════════════════════════════════════════════════

pub fn get_by_lookup_hash<Tx: Transaction>(txn: &Tx, b: &Buckets, hash: &str) -> Result<Option<Ref>, BlobberError> {
    get_value(txn, b.refs, hash)
}

pub fn get_by_path<Tx: Transaction>(
    txn: &Tx,
    b: &Buckets,
    allocation_id: &str,
    path: &str,
) -> Result<Option<Ref>, BlobberError> {
    get_by_lookup_hash(txn, b, &lookup_hash(allocation_id, path))
}

/// Hash of the root directory; the empty-directory hash before any commit.
pub fn root_hash<Tx: Transaction>(txn: &Tx, b: &Buckets, allocation_id: &str) -> Result<String, BlobberError> {
    Ok(get_by_path(txn, b, allocation_id, ROOT_PATH)?
        .map(|r| r.hash)
        .unwrap_or_else(empty_dir_hash))
}

/// Direct children of a directory, in name order.
pub fn list_dir<Tx: Transaction>(
    txn: &Tx,
    b: &Buckets,
    allocation_id: &str,
    path: &str,
) -> Result<Vec<Ref>, BlobberError> {
    let dir = match get_by_path(txn, b, allocation_id, path)? {
        Some(d) if d.is_dir() => d,
        Some(_) => return Err(BlobberError::InvalidParameters(format!("{} is not a directory", path))),
        None => return Ok(Vec::new()),
    };
    let mut out = Vec::with_capacity(dir.children.len());
    for name in &dir.children {
        if let Some(child) = get_by_path(txn, b, allocation_id, &join_path(path, name))? {
            out.push(child);
        }
    }
    Ok(out)
}

// ════════════════════════════════════════════════════════════════════════════
// TREE WRITER
// ════════════════════════════════════════════════════════════════════════════

pub struct TreeWriter<'a, 'env> {
    txn: &'a mut RwTransaction<'env>,
    b: &'a Buckets,
    allocation_id: &'a str,
    now: u64,
    dirty: BTreeSet<String>,
}

impl<'a, 'env> TreeWriter<'a, 'env> {
    pub fn new(txn: &'a mut RwTransaction<'env>, b: &'a Buckets, allocation_id: &'a str, now: u64) -> Self {
        Self { txn, b, allocation_id, now, dirty: BTreeSet::new() }
    }

    pub fn get(&self, path: &str) -> Result<Option<Ref>, BlobberError> {
        get_by_path(&*self.txn, self.b, self.allocation_id, path)
    }

    fn put(&mut self, r: &Ref) -> Result<(), BlobberError> {
        put_value(self.txn, self.b.refs, &r.lookup_hash, r)
    }

    fn mark_ancestors(&mut self, path: &str) {
        let mut p = path.to_string();
        while p != ROOT_PATH {
            p = parent_path(&p);
            self.dirty.insert(p.clone());
        }
    }

    /// Create `path` and any missing ancestors as directories.
    fn ensure_dir(&mut self, path: &str) -> Result<(), BlobberError> {
        match self.get(path)? {
            Some(r) if r.is_dir() => return Ok(()),
            Some(_) => {
                return Err(BlobberError::InvalidParameters(format!("{} is a file, not a directory", path)))
            }
            None => {}
        }
        if path != ROOT_PATH {
            let parent = parent_path(path);
            self.ensure_dir(&parent)?;
            self.add_child(&parent, &base_name(path))?;
        }
        let dir = Ref::new_dir(self.allocation_id, path, self.now);
        self.put(&dir)?;
        self.dirty.insert(path.to_string());
        self.mark_ancestors(path);
        Ok(())
    }

    fn add_child(&mut self, dir_path: &str, name: &str) -> Result<(), BlobberError> {
        let mut dir = self
            .get(dir_path)?
            .ok_or_else(|| BlobberError::Internal(format!("missing directory {}", dir_path)))?;
        if let Err(pos) = dir.children.binary_search_by(|c| c.as_str().cmp(name)) {
            dir.children.insert(pos, name.to_string());
        }
        dir.updated_at = self.now;
        self.put(&dir)?;
        self.dirty.insert(dir_path.to_string());
        Ok(())
    }

    fn remove_child(&mut self, dir_path: &str, name: &str) -> Result<(), BlobberError> {
        if let Some(mut dir) = self.get(dir_path)? {
            dir.children.retain(|c| c != name);
            dir.updated_at = self.now;
            self.put(&dir)?;
            self.dirty.insert(dir_path.to_string());
        }
        Ok(())
    }

    /// Add a new file. Fails with `DuplicateFile` when the path is taken.
    pub fn insert_file(&mut self, attrs: &FileAttributes) -> Result<Ref, BlobberError> {
        let path = clean_path(&attrs.path)?;
        if path == ROOT_PATH {
            return Err(BlobberError::InvalidParameters("cannot write to the root directory".into()));
        }
        if self.get(&path)?.is_some() {
            return Err(BlobberError::DuplicateFile(path));
        }
        let parent = parent_path(&path);
        self.ensure_dir(&parent)?;

        let mut file = Ref::new_dir(self.allocation_id, &path, self.now);
        file.ref_type = RefType::File;
        file.apply_attributes(attrs);
        self.put(&file)?;
        self.add_child(&parent, &file.name)?;
        self.mark_ancestors(&path);
        Ok(file)
    }

    /// Replace the content of an existing file. Returns `(old, new)`.
    pub fn update_file(&mut self, attrs: &FileAttributes) -> Result<(Ref, Ref), BlobberError> {
        let path = clean_path(&attrs.path)?;
        let old = self
            .get(&path)?
            .ok_or_else(|| BlobberError::InvalidParameters(format!("file {} does not exist", path)))?;
        if !old.is_file() {
            return Err(BlobberError::InvalidFileUpdate(format!("{} is a directory", path)));
        }
        let mut new = old.clone();
        new.apply_attributes(attrs);
        new.updated_at = self.now;
        self.put(&new)?;
        self.mark_ancestors(&path);
        Ok((old, new))
    }

    /// Remove a file or a whole directory subtree. Returns the removed ref.
    pub fn delete(&mut self, raw_path: &str) -> Result<Ref, BlobberError> {
        let path = clean_path(raw_path)?;
        if path == ROOT_PATH {
            return Err(BlobberError::InvalidParameters("cannot delete the root directory".into()));
        }
        let node = self
            .get(&path)?
            .ok_or_else(|| BlobberError::InvalidParameters(format!("{} does not exist", path)))?;
        self.drop_subtree(&node)?;
        self.remove_child(&node.parent_path, &node.name)?;
        self.mark_ancestors(&path);
        Ok(node)
    }

    fn drop_subtree(&mut self, node: &Ref) -> Result<(), BlobberError> {
        for child in &node.children {
            if let Some(c) = self.get(&join_path(&node.path, child))? {
                self.drop_subtree(&c)?;
            }
        }
        delete_key(self.txn, self.b.refs, &node.lookup_hash)?;
        clear_collaborators(self.txn, self.b, &node.lookup_hash)?;
        self.dirty.remove(&node.path);
        Ok(())
    }

    /// Rename within the same directory. Returns the new path.
    pub fn rename(&mut self, raw_path: &str, new_name: &str) -> Result<String, BlobberError> {
        let path = clean_path(raw_path)?;
        if path == ROOT_PATH {
            return Err(BlobberError::InvalidParameters("cannot rename the root directory".into()));
        }
        validate_name(new_name)?;
        let node = self
            .get(&path)?
            .ok_or_else(|| BlobberError::InvalidParameters(format!("{} does not exist", path)))?;
        let new_path = join_path(&node.parent_path, new_name);
        if new_path == path {
            return Ok(new_path);
        }
        if self.get(&new_path)?.is_some() {
            return Err(BlobberError::DuplicateFile(new_path));
        }
        self.clone_subtree(&node, &new_path, true)?;
        self.remove_child(&node.parent_path, &node.name)?;
        self.add_child(&node.parent_path, new_name)?;
        self.mark_ancestors(&new_path);
        Ok(new_path)
    }

    /// Copy a file or directory into `dest_dir`. Returns `(source, new path)`.
    pub fn copy(&mut self, raw_path: &str, raw_dest_dir: &str) -> Result<(Ref, String), BlobberError> {
        let path = clean_path(raw_path)?;
        let dest_dir = clean_path(raw_dest_dir)?;
        if path == ROOT_PATH {
            return Err(BlobberError::InvalidParameters("cannot copy the root directory".into()));
        }
        let node = self
            .get(&path)?
            .ok_or_else(|| BlobberError::InvalidParameters(format!("{} does not exist", path)))?;
        if dest_dir == path || dest_dir.starts_with(&format!("{}/", path)) {
            return Err(BlobberError::InvalidParameters("cannot copy a directory into itself".into()));
        }
        let new_path = join_path(&dest_dir, &node.name);
        if self.get(&new_path)?.is_some() {
            return Err(BlobberError::DuplicateFile(new_path));
        }
        self.ensure_dir(&dest_dir)?;
        self.clone_subtree(&node, &new_path, false)?;
        self.add_child(&dest_dir, &node.name)?;
        self.mark_ancestors(&new_path);
        Ok((node, new_path))
    }

    fn clone_subtree(&mut self, node: &Ref, dst: &str, moving: bool) -> Result<(), BlobberError> {
        let mut copy = node.clone();
        copy.path = dst.to_string();
        copy.name = base_name(dst);
        copy.parent_path = parent_path(dst);
        copy.lookup_hash = lookup_hash(self.allocation_id, dst);
        copy.updated_at = self.now;
        if !moving {
            copy.created_at = self.now;
        }
        if copy.is_file() {
            copy.hash = copy.file_hash();
        } else {
            self.dirty.insert(dst.to_string());
        }
        self.put(&copy)?;

        for child in &node.children {
            if let Some(c) = self.get(&join_path(&node.path, child))? {
                self.clone_subtree(&c, &join_path(dst, child), moving)?;
            }
        }
        if moving {
            delete_key(self.txn, self.b.refs, &node.lookup_hash)?;
            move_collaborators(self.txn, self.b, &node.lookup_hash, &copy.lookup_hash)?;
            self.dirty.remove(&node.path);
        }
        Ok(())
    }

    fn recompute_dir(&mut self, path: &str) -> Result<(), BlobberError> {
        let mut dir = match self.get(path)? {
            Some(d) if d.is_dir() => d,
            _ => return Ok(()),
        };
        let mut hashes = Vec::with_capacity(dir.children.len());
        let mut size = 0u64;
        for name in &dir.children {
            let child = self
                .get(&join_path(path, name))?
                .ok_or_else(|| BlobberError::Internal(format!("dangling child {} in {}", name, path)))?;
            size = size.saturating_add(child.size);
            hashes.push(child.hash);
        }
        dir.hash = sha3_joined(&hashes);
        dir.size = size;
        self.put(&dir)
    }

    /// Recompute every dirty directory, deepest first, and return the root.
    pub fn finish(mut self) -> Result<Ref, BlobberError> {
        self.ensure_dir(ROOT_PATH)?;
        let mut dirs: Vec<String> = std::mem::take(&mut self.dirty).into_iter().collect();
        dirs.sort_by_key(|p| Reverse(depth(p)));
        for d in &dirs {
            self.recompute_dir(d)?;
        }
        self.get(ROOT_PATH)?
            .ok_or_else(|| BlobberError::Internal("root directory missing after recompute".into()))
    }
}

fn validate_name(name: &str) -> Result<(), BlobberError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(BlobberError::InvalidParameters(format!("invalid name {:?}", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;

    fn attrs(path: &str, size: u64, hash: &str) -> FileAttributes {
        FileAttributes {
            path: path.into(),
            size,
            content_hash: hash.into(),
            actual_file_size: size,
            actual_file_hash: hash.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/a//b/./c/").expect("clean"), "/a/b/c");
        assert_eq!(clean_path("/a/../b").expect("clean"), "/b");
        assert_eq!(clean_path("/").expect("clean"), "/");
        assert!(clean_path("a/b").is_err());
        assert!(clean_path("/../x").is_err());
        assert_eq!(parent_path("/a/b"), "/a");
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(base_name("/a/b"), "b");
    }

    #[test]
    fn test_insert_creates_parents_and_sums_sizes() {
        let (_tmp, db) = temp_db();
        let root = db
            .write(|txn, b| {
                let mut w = TreeWriter::new(txn, b, "alloc", 1);
                w.insert_file(&attrs("/docs/a.txt", 10, "h1"))?;
                w.insert_file(&attrs("/docs/b.txt", 5, "h2"))?;
                w.finish()
            })
            .expect("commit");
        assert_eq!(root.size, 15);
        assert_eq!(root.children, vec!["docs".to_string()]);

        let docs = db.read(|txn, b| get_by_path(txn, b, "alloc", "/docs")).expect("read").expect("docs");
        assert_eq!(docs.children, vec!["a.txt".to_string(), "b.txt".to_string()]);
        assert_eq!(root.hash, sha3_joined(&[docs.hash]));
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let (_tmp, db) = temp_db();
        let err = db
            .write(|txn, b| {
                let mut w = TreeWriter::new(txn, b, "alloc", 1);
                w.insert_file(&attrs("/a", 1, "h"))?;
                w.insert_file(&attrs("/a", 1, "h"))?;
                w.finish()
            })
            .unwrap_err();
        assert_eq!(err.code(), "duplicate_file");
    }

    #[test]
    fn test_update_directory_is_invalid() {
        let (_tmp, db) = temp_db();
        let err = db
            .write(|txn, b| {
                let mut w = TreeWriter::new(txn, b, "alloc", 1);
                w.insert_file(&attrs("/d/a", 1, "h"))?;
                w.update_file(&attrs("/d", 1, "h"))?;
                w.finish()
            })
            .unwrap_err();
        assert_eq!(err.code(), "invalid_file_update");
    }

    #[test]
    fn test_rename_and_copy_move_subtrees() {
        let (_tmp, db) = temp_db();
        let root = db
            .write(|txn, b| {
                let mut w = TreeWriter::new(txn, b, "alloc", 1);
                w.insert_file(&attrs("/d/a", 3, "h1"))?;
                w.insert_file(&attrs("/d/sub/b", 4, "h2"))?;
                w.rename("/d", "e")?;
                w.copy("/e/sub", "/backup")?;
                w.finish()
            })
            .expect("commit");
        assert_eq!(root.size, 11);

        db.read(|txn, b| {
            assert!(get_by_path(txn, b, "alloc", "/d")?.is_none());
            assert!(get_by_path(txn, b, "alloc", "/e/sub/b")?.is_some());
            let copied = get_by_path(txn, b, "alloc", "/backup/sub/b")?.expect("copied");
            assert_eq!(copied.content_hash, "h2");
            assert_eq!(copied.lookup_hash, lookup_hash("alloc", "/backup/sub/b"));
            Ok(())
        })
        .expect("read");
    }

    #[test]
    fn test_delete_subtree_and_root_hash() {
        let (_tmp, db) = temp_db();
        let root = db
            .write(|txn, b| {
                let mut w = TreeWriter::new(txn, b, "alloc", 1);
                w.insert_file(&attrs("/d/a", 3, "h1"))?;
                w.insert_file(&attrs("/d/b", 4, "h2"))?;
                w.finish()
            })
            .expect("seed");
        assert_eq!(root.size, 7);

        let root = db
            .write(|txn, b| {
                let mut w = TreeWriter::new(txn, b, "alloc", 2);
                let removed = w.delete("/d")?;
                assert_eq!(removed.size, 7);
                w.finish()
            })
            .expect("delete");
        assert_eq!(root.size, 0);
        assert_eq!(root.hash, sha3_joined::<String>(&[]));
        assert_eq!(root.hash, empty_dir_hash());
        assert!(db.read(|txn, b| get_by_path(txn, b, "alloc", "/d/a")).expect("read").is_none());
    }

    #[test]
    fn test_same_changes_same_hash() {
        let build = |order: &[&str]| {
            let (_tmp, db) = temp_db();
            db.write(|txn, b| {
                let mut w = TreeWriter::new(txn, b, "alloc", 9);
                for p in order {
                    w.insert_file(&attrs(p, 1, p))?;
                }
                w.finish()
            })
            .expect("commit")
            .hash
        };
        // children are hashed in name order, not insertion order
        assert_eq!(build(&["/x", "/y/z", "/a"]), build(&["/a", "/y/z", "/x"]));
        assert_eq!(allocation_root("h", 5), sha3_joined(&["h", "5"]));
    }
}
