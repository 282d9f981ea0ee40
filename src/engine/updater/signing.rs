//! Publisher Signing
//!
//! Produces the compact recoverable signatures that go into a manifest record.

use k256::ecdsa::SigningKey;
use thiserror::Error;

use super::manifest::{RawSignature, UpdateRecord, COMPACT_SIGNATURE_LEN};
use super::trust::Identity;
use super::verify::update_digest;

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("Invalid signing key: expected 32 hex-encoded bytes")]
    InvalidKey,
    #[error("Signing failed: {0}")]
    Signature(#[from] k256::ecdsa::Error),
}

/// Parse a hex-encoded secp256k1 secret key.
pub fn parse_signing_key(hex_key: &str) -> Result<SigningKey, SigningError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|_| SigningError::InvalidKey)?;
    SigningKey::from_slice(&bytes).map_err(|_| SigningError::InvalidKey)
}

/// The identity a verifier recovers for signatures made with `key`.
pub fn signer_identity(key: &SigningKey) -> Identity {
    Identity::from_compressed_key(key.verifying_key().to_encoded_point(true).as_bytes())
}

/// Sign `package` under `record`'s metadata.
///
/// Any signatures already on the record are not part of what gets signed.
pub fn sign_update(
    record: &UpdateRecord,
    package: &[u8],
    key: &SigningKey,
) -> Result<RawSignature, SigningError> {
    let digest = update_digest(package, record);
    let (signature, recovery_id) = key.sign_prehash_recoverable(&digest)?;

    let mut compact = [0u8; COMPACT_SIGNATURE_LEN];
    // 27 + recovery id, +4 for a compressed key
    compact[0] = 27 + 4 + recovery_id.to_byte();
    compact[1..].copy_from_slice(&signature.to_bytes());
    Ok(RawSignature(compact))
}
