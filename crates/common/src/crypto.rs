//! Crypto helpers: Ed25519 keypair generation, sign, verify, client ids.
//! Compatible with ed25519-dalek v2 + rand_core feature enabled.
//!
//! Combined key format (64 bytes):
//!   [0..32]  = private key bytes
//!   [32..64] = public key bytes
//!
//! Public keys and signatures travel as lowercase hex. A client id is the
//! SHA3-256 hex digest of the raw public key bytes, so a request that claims
//! a client id can always be checked against the key it presents.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

use crate::cid::sha3_256_hex;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, found {found}")]
    InvalidKeyLength { expected: usize, found: usize },

    #[error("invalid signature length: expected 64, found {0}")]
    InvalidSignatureLength(usize),

    #[error("malformed public key")]
    MalformedPublicKey,

    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Generate a new Ed25519 keypair and return concatenated 64-byte (private + public).
pub fn generate_keypair_bytes() -> Vec<u8> {
    let sk = SigningKey::generate(&mut OsRng);
    let vk = sk.verifying_key();

    let mut combined = Vec::with_capacity(64);
    combined.extend_from_slice(&sk.to_bytes());
    combined.extend_from_slice(&vk.to_bytes());
    combined
}

/// Build a SigningKey from combined keypair bytes.
pub fn signing_key_from_bytes(bytes: &[u8]) -> Result<SigningKey, CryptoError> {
    if bytes.len() != 64 {
        return Err(CryptoError::InvalidKeyLength { expected: 64, found: bytes.len() });
    }
    let mut sk_bytes = [0u8; 32];
    sk_bytes.copy_from_slice(&bytes[0..32]);
    Ok(SigningKey::from_bytes(&sk_bytes))
}

/// Hex of the public half of a 64-byte keypair.
pub fn public_key_hex_from_keypair(kp_bytes: &[u8]) -> Result<String, CryptoError> {
    if kp_bytes.len() != 64 {
        return Err(CryptoError::InvalidKeyLength { expected: 64, found: kp_bytes.len() });
    }
    Ok(hex::encode(&kp_bytes[32..64]))
}

/// Client id derived from a hex public key: `sha3_256_hex(raw key bytes)`.
pub fn client_id_from_public_key(pubkey_hex: &str) -> Result<String, CryptoError> {
    let raw = hex::decode(pubkey_hex)?;
    if raw.len() != 32 {
        return Err(CryptoError::InvalidKeyLength { expected: 32, found: raw.len() });
    }
    Ok(sha3_256_hex(&raw))
}

/// Sign a message and return the hex signature.
pub fn sign_hex(kp_bytes: &[u8], message: &[u8]) -> Result<String, CryptoError> {
    let sk = signing_key_from_bytes(kp_bytes)?;
    Ok(hex::encode(sk.sign(message).to_bytes()))
}

/// Verify a hex signature over `message` with a hex public key.
///
/// Malformed input (bad hex, wrong lengths) is an error; a well-formed
/// signature that does not match is `Ok(false)`.
pub fn verify_hex(pubkey_hex: &str, message: &[u8], sig_hex: &str) -> Result<bool, CryptoError> {
    let pk = hex::decode(pubkey_hex)?;
    if pk.len() != 32 {
        return Err(CryptoError::InvalidKeyLength { expected: 32, found: pk.len() });
    }
    let sig = hex::decode(sig_hex)?;
    if sig.len() != 64 {
        return Err(CryptoError::InvalidSignatureLength(sig.len()));
    }

    let mut pk_arr = [0u8; 32];
    pk_arr.copy_from_slice(&pk);
    let vk = VerifyingKey::from_bytes(&pk_arr).map_err(|_| CryptoError::MalformedPublicKey)?;

    let mut sig_arr = [0u8; 64];
    sig_arr.copy_from_slice(&sig);
    let sig = Signature::from_bytes(&sig_arr);

    Ok(vk.verify(message, &sig).is_ok())
}

// ════════════════════════════════════════════════════════════════════════════
// SIGNATURE VERIFIER
// ════════════════════════════════════════════════════════════════════════════

/// Narrow verification contract consumed by the marker engines.
///
/// Returns `false` for anything that does not verify, including malformed
/// keys or signatures; callers only care whether the payload is authorized.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, public_key: &str, payload: &[u8], signature: &str) -> bool;
}

/// Default Ed25519 verifier over hex keys/signatures.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, public_key: &str, payload: &[u8], signature: &str) -> bool {
        verify_hex(public_key, payload, signature).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let kp = generate_keypair_bytes();
        let pk = public_key_hex_from_keypair(&kp).expect("pub hex");
        let sig = sign_hex(&kp, b"hello blobber").expect("sign");
        assert!(verify_hex(&pk, b"hello blobber", &sig).expect("verify"));
        assert!(!verify_hex(&pk, b"hello blobber!", &sig).expect("verify"));
    }

    #[test]
    fn test_verifier_rejects_garbage() {
        let v = Ed25519Verifier;
        assert!(!v.verify("zz", b"x", "00"));
        assert!(!v.verify(&"00".repeat(32), b"x", "abcd"));
    }

    #[test]
    fn test_client_id_is_sha3_of_key() {
        let kp = generate_keypair_bytes();
        let pk = public_key_hex_from_keypair(&kp).expect("pub hex");
        let id = client_id_from_public_key(&pk).expect("client id");
        assert_eq!(id, sha3_256_hex(&kp[32..64]));
        assert_eq!(id.len(), 64);
    }

    #[test]
    fn test_client_id_rejects_short_key() {
        let err = client_id_from_public_key("abcd").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKeyLength { expected: 32, found: 2 }));
    }
}
