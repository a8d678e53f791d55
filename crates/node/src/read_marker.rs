use serde::{Deserialize, Serialize};

use blobber_common::cid::sha3_256_hex;
use blobber_common::crypto::{client_id_from_public_key, sign_hex, CryptoError};
use blobber_common::SignatureVerifier;

/// Client-signed authorization for paid reads. `read_counter` is the total
/// number of blocks the client has read from this blobber for the
/// allocation, including the request it accompanies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReadMarker {
    pub client_id: String,
    pub client_public_key: String,
    pub blobber_id: String,
    pub allocation_id: String,
    pub owner_id: String,
    pub timestamp: u64,
    pub read_counter: u64,
    pub signature: String,
}

impl ReadMarker {
    pub fn hash_data(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.allocation_id,
            self.blobber_id,
            self.client_id,
            self.client_public_key,
            self.owner_id,
            self.read_counter,
            self.timestamp
        )
    }

    pub fn hash(&self) -> String {
        sha3_256_hex(self.hash_data().as_bytes())
    }

    pub fn sign(&mut self, keypair: &[u8]) -> Result<(), CryptoError> {
        self.signature = sign_hex(keypair, self.hash().as_bytes())?;
        Ok(())
    }

    /// Signature is valid and the declared key hashes to `client_id`.
    pub fn verify(&self, verifier: &dyn SignatureVerifier) -> bool {
        match client_id_from_public_key(&self.client_public_key) {
            Ok(id) if id == self.client_id => {}
            _ => return false,
        }
        verifier.verify(&self.client_public_key, self.hash().as_bytes(), &self.signature)
    }
}
