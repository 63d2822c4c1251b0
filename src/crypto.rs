//! Node identity material.
//!
//! The node agent authenticates itself on the wire with a P-256 TLS key; its
//! network identifier is derived from the public point the same way the
//! agent derives it: Keccak-256 over the 64-byte uncompressed `X ‖ Y`
//! encoding, last 20 bytes, lowercase hex.

use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use p256::SecretKey;
use rand::rngs::OsRng;
use rand::RngCore;
use sha3::{Digest, Keccak256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid TLS key PEM: {0}")]
    InvalidKey(String),
    #[error("PEM encoding failed: {0}")]
    Encode(String),
}

/// Generate a fresh P-256 keypair. Returns the PKCS#8 PEM encoding of the
/// private key and the node identifier derived from its public point.
pub fn generate_tls_keypair() -> Result<(String, String), CryptoError> {
    let key = SecretKey::random(&mut OsRng);
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Encode(e.to_string()))?;
    let node_id = node_id_from_key(&key);
    Ok((pem.to_string(), node_id))
}

/// Re-derive the node identifier from an existing private key PEM.
pub fn node_id_of(pem: &str) -> Result<String, CryptoError> {
    let key = SecretKey::from_pkcs8_pem(pem).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(node_id_from_key(&key))
}

/// Generate a fresh validator private key as 32 random bytes in hex.
pub fn generate_validator_key_hex() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn node_id_from_key(key: &SecretKey) -> String {
    let point = key.public_key().to_encoded_point(false);
    // Uncompressed SEC1 is 0x04 || X || Y; the id hashes only X || Y.
    let digest = Keccak256::digest(&point.as_bytes()[1..]);
    hex::encode(&digest[12..])
}
