//! Trust Policy
//!
//! The fixed set of signer identities allowed to authorize a web update, and
//! how many of them must agree. Compiled into the binary; rotating keys
//! requires a new build.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Number of distinct authorized signers an update needs.
pub const WEB_UPDATES_SIGNATURE_REQUIREMENT: u8 = 2;

/// Compressed SEC1 public keys (hex) of the authorized update signers.
pub const WEB_UPDATES_SIGNING_KEYS: [&str; 4] = [
    "02738b4686c395a76438f5221c8fc3a90e629f58d60b99a8583dff997af6c79310",
    "0267fd1b3201d3ad4921ae76cc8e3f25d22e90acd6e3bf8a8e53c84feb7842eb82",
    "030a5b6b9bc37399ef696c3776f328938d4ca5702654ef09ec004273cb806ef901",
    "02424338ced863816df9ee64e10e0bf163bf3c8fd3ee89c9e653474c2d245fce75",
];

/// A signer identity: lowercase hex of a 33-byte compressed public key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Identity of a compressed SEC1 encoded public key.
    pub fn from_compressed_key(key: &[u8]) -> Self {
        Self(hex::encode(key))
    }

    /// Parse a hex identity, normalizing case.
    pub fn from_hex(hex_key: &str) -> Result<Self, TrustError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|_| TrustError::InvalidIdentity(hex_key.to_string()))?;
        if bytes.len() != 33 || !matches!(bytes[0], 0x02 | 0x03) {
            return Err(TrustError::InvalidIdentity(hex_key.to_string()));
        }
        Ok(Self::from_compressed_key(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrustError {
    #[error("Invalid signer identity: {0}")]
    InvalidIdentity(String),
    #[error("Threshold {threshold} exceeds the {signers} authorized signers")]
    ThresholdTooHigh { threshold: u8, signers: usize },
    #[error("Threshold must be at least 1")]
    ZeroThreshold,
}

/// Authorized signers and the required signature count.
///
/// Invariant: `1 <= threshold <= signing_identities.len()`.
#[derive(Debug, Clone)]
pub struct TrustPolicy {
    signing_identities: BTreeSet<Identity>,
    threshold: u8,
}

impl TrustPolicy {
    pub fn new(
        signing_identities: impl IntoIterator<Item = Identity>,
        threshold: u8,
    ) -> Result<Self, TrustError> {
        let signing_identities: BTreeSet<Identity> = signing_identities.into_iter().collect();
        if threshold == 0 {
            return Err(TrustError::ZeroThreshold);
        }
        if usize::from(threshold) > signing_identities.len() {
            return Err(TrustError::ThresholdTooHigh {
                threshold,
                signers: signing_identities.len(),
            });
        }
        Ok(Self { signing_identities, threshold })
    }

    /// The policy compiled into this build.
    pub fn builtin() -> Self {
        Self {
            signing_identities: WEB_UPDATES_SIGNING_KEYS
                .iter()
                .map(|key| Identity(key.to_string()))
                .collect(),
            threshold: WEB_UPDATES_SIGNATURE_REQUIREMENT,
        }
    }

    pub fn is_authorized(&self, identity: &Identity) -> bool {
        self.signing_identities.contains(identity)
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn signing_identities(&self) -> &BTreeSet<Identity> {
        &self.signing_identities
    }
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self::builtin()
    }
}
