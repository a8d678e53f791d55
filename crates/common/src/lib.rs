//! # Blobber Common Crate
//!
//! Shared helpers used by the content store and the blobber node.
//!
//! ## Modules
//! - `crypto`: Ed25519 keypairs, signing, verification, client ids
//! - `cid`: Content and ledger hashing (SHA-256 / SHA3-256)
//! - `config`: TOML configuration for the node
//!
//! ## Hash Roles
//! ```text
//! ┌──────────────────┐      ┌───────────────────────────┐
//! │  sha256_hex      │      │  sha3_256_hex              │
//! │  (content bytes) │      │  (refs, roots, client ids, │
//! │                  │      │   marker payloads)         │
//! └──────────────────┘      └───────────────────────────┘
//! ```

pub mod crypto;
pub mod cid;
pub mod config;

pub use config::BlobberConfig;
pub use crypto::{Ed25519Verifier, SignatureVerifier};

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
