//! Cryptographic Verification
//!
//! Threshold multi-signature verification of a web update. Signatures carry no
//! signer identity: each one is recovered to a public key over the update
//! digest and matched against the trust policy.

use chrono::{DateTime, Utc};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, error};

use super::manifest::{RawSignature, UpdateRecord};
use super::trust::{Identity, TrustPolicy};

/// Header byte offset of compact recoverable signatures.
const COMPACT_HEADER_BASE: u8 = 27;
/// Added to the header when the recovered key is to be compressed.
const COMPACT_HEADER_COMPRESSED: u8 = 4;

/// Why an update was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Fewer raw signatures than the threshold, or fewer signers than the threshold.
    InsufficientSignatureCount,
    /// Published before this build was made.
    StaleUpdate,
    /// Not enough distinct authorized signers recovered.
    ThresholdNotMet,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientSignatureCount => write!(f, "insufficient signatures in manifest"),
            Self::StaleUpdate => write!(f, "timestamp older than build"),
            Self::ThresholdNotMet => write!(f, "signature requirement not met"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    Accepted,
    Rejected(RejectReason),
}

impl VerificationResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Recovers the signer of a compact signature over a 32-byte hash.
///
/// `None` means nothing usable could be recovered; callers treat that as
/// noise, not failure.
pub trait KeyRecovery: Send + Sync {
    fn recover_public_key(&self, signature: &RawSignature, message_hash: &[u8; 32]) -> Option<Identity>;
}

/// secp256k1 public key recovery.
#[derive(Debug, Clone, Copy, Default)]
pub struct Secp256k1Recovery;

impl KeyRecovery for Secp256k1Recovery {
    fn recover_public_key(&self, signature: &RawSignature, message_hash: &[u8; 32]) -> Option<Identity> {
        let bytes = signature.as_bytes();
        let header = bytes[0].checked_sub(COMPACT_HEADER_BASE)?;
        if header >= 2 * COMPACT_HEADER_COMPRESSED {
            return None;
        }
        let recovery_id = RecoveryId::from_byte(header % COMPACT_HEADER_COMPRESSED)?;
        let signature = Signature::from_slice(&bytes[1..]).ok()?;

        let key = VerifyingKey::recover_from_prehash(message_hash, &signature, recovery_id).ok()?;
        Some(Identity::from_compressed_key(key.to_encoded_point(true).as_bytes()))
    }
}

/// The hash every signer signs: package bytes followed by the signable record.
///
/// Binding both together keeps a signature from being replayed onto another
/// package under the same metadata, or the reverse.
pub fn update_digest(package: &[u8], record: &UpdateRecord) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(package);
    hasher.update(record.signable_bytes());
    hasher.finalize().into()
}

/// Verifier for web update packages
pub struct SignatureVerifier<R = Secp256k1Recovery> {
    policy: TrustPolicy,
    recovery: R,
    /// Updates published before this instant are stale.
    build_timestamp: DateTime<Utc>,
}

impl SignatureVerifier<Secp256k1Recovery> {
    pub fn new(policy: TrustPolicy, build_timestamp: DateTime<Utc>) -> Self {
        Self::with_recovery(policy, build_timestamp, Secp256k1Recovery)
    }
}

impl<R: KeyRecovery> SignatureVerifier<R> {
    pub fn with_recovery(policy: TrustPolicy, build_timestamp: DateTime<Utc>, recovery: R) -> Self {
        Self { policy, recovery, build_timestamp }
    }

    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    pub fn build_timestamp(&self) -> DateTime<Utc> {
        self.build_timestamp
    }

    /// Decide whether `package` is authorized under `record`.
    pub fn verify(&self, record: &UpdateRecord, package: &[u8]) -> VerificationResult {
        let threshold = usize::from(self.policy.threshold());

        if record.signatures.len() < threshold || self.policy.signing_identities().len() < threshold {
            error!(
                version = %record.version,
                signatures = record.signatures.len(),
                required = threshold,
                "Rejecting update signature: insufficient signatures in manifest"
            );
            return VerificationResult::Rejected(RejectReason::InsufficientSignatureCount);
        }

        if record.timestamp < self.build_timestamp {
            error!(
                version = %record.version,
                published = %record.timestamp,
                built = %self.build_timestamp,
                "Rejecting update signature: timestamp older than build"
            );
            return VerificationResult::Rejected(RejectReason::StaleUpdate);
        }

        debug!(version = %record.version, package_size = package.len(), "Verifying update package");
        let digest = update_digest(package, record);

        let matched = self.authorized_signers(record, &digest);
        if matched.len() >= threshold {
            debug!(version = %record.version, matched = matched.len(), "Update signature accepted");
            return VerificationResult::Accepted;
        }

        error!(
            version = %record.version,
            matched = matched.len(),
            required = threshold,
            "Rejecting update signature: signature requirement failed"
        );
        VerificationResult::Rejected(RejectReason::ThresholdNotMet)
    }

    /// Distinct authorized identities among the signers of `digest`.
    fn authorized_signers(&self, record: &UpdateRecord, digest: &[u8; 32]) -> BTreeSet<Identity> {
        record
            .signatures
            .iter()
            .filter_map(|signature| self.recovery.recover_public_key(signature, digest))
            .inspect(|identity| debug!(signer = %identity, "Recovered update signer"))
            .filter(|identity| self.policy.is_authorized(identity))
            .collect()
    }
}
