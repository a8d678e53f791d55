//! Hash helpers.
//!
//! Content bytes are addressed with SHA-256; everything that feeds the
//! allocation ledger (refs, roots, marker payloads, client ids) uses SHA3-256.
//! Both return lowercase hex.

use sha2::Sha256;
use sha3::{Digest, Sha3_256};

/// Compute SHA-256 and return lowercase hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute SHA3-256 and return lowercase hex string.
pub fn sha3_256_hex(data: &[u8]) -> String {
    hex::encode(Sha3_256::digest(data))
}

/// SHA3-256 over `parts` joined with `:`.
///
/// This is the canonical form for every colon-separated ledger digest
/// (`allocation_id:path`, `root_hash:timestamp`, marker payloads, ...).
pub fn sha3_joined<S: AsRef<str>>(parts: &[S]) -> String {
    let joined = parts
        .iter()
        .map(|p| p.as_ref())
        .collect::<Vec<_>>()
        .join(":");
    sha3_256_hex(joined.as_bytes())
}

/// Short prefix form useful for logging (first 12 hex chars).
pub fn short_hash(hash: &str) -> &str {
    hash.get(0..12).unwrap_or(hash)
}
