//! Client-signed write authorization binding a new allocation root to the
//! previous one.
//!
//! The signed payload is the hex `sha3_256` of the colon-joined fields:
//!
//! ```text
//! allocation_root:previous_allocation_root:allocation_id:blobber_id:client_id:size:timestamp
//! ```

use serde::{Deserialize, Serialize};

use blobber_common::cid::sha3_256_hex;
use blobber_common::crypto::{sign_hex, CryptoError};
use blobber_common::SignatureVerifier;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WriteMarker {
    pub allocation_root: String,
    pub previous_allocation_root: String,
    pub allocation_id: String,
    /// Net byte delta of the committed connection.
    pub size: i64,
    pub blobber_id: String,
    /// Unix seconds.
    pub timestamp: u64,
    pub client_id: String,
    pub signature: String,
}

impl WriteMarker {
    pub fn hash_data(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.allocation_root,
            self.previous_allocation_root,
            self.allocation_id,
            self.blobber_id,
            self.client_id,
            self.size,
            self.timestamp
        )
    }

    pub fn hash(&self) -> String {
        sha3_256_hex(self.hash_data().as_bytes())
    }

    /// Sign with a 64-byte keypair (secret || public).
    pub fn sign(&mut self, keypair: &[u8]) -> Result<(), CryptoError> {
        self.signature = sign_hex(keypair, self.hash().as_bytes())?;
        Ok(())
    }

    pub fn verify_signature(&self, verifier: &dyn SignatureVerifier, client_key: &str) -> bool {
        verifier.verify(client_key, self.hash().as_bytes(), &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobber_common::crypto::{generate_keypair_bytes, public_key_hex_from_keypair};
    use blobber_common::Ed25519Verifier;

    fn marker() -> WriteMarker {
        WriteMarker {
            allocation_root: "new".into(),
            previous_allocation_root: "old".into(),
            allocation_id: "alloc".into(),
            size: -12,
            blobber_id: "blobber".into(),
            timestamp: 1700000000,
            client_id: "client".into(),
            signature: String::new(),
        }
    }

    #[test]
    fn test_hash_data_layout() {
        assert_eq!(marker().hash_data(), "new:old:alloc:blobber:client:-12:1700000000");
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = generate_keypair_bytes();
        let pk = public_key_hex_from_keypair(&kp).expect("pk");
        let mut wm = marker();
        wm.sign(&kp).expect("sign");
        assert!(wm.verify_signature(&Ed25519Verifier, &pk));

        // any field change invalidates the signature
        wm.size = 12;
        assert!(!wm.verify_signature(&Ed25519Verifier, &pk));
    }
}
