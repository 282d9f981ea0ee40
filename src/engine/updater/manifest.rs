//! Update Manifest
//!
//! The signed-metadata document listing available web updates, the canonical
//! signable encoding of one record, and selection of the next update for a
//! running build.

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

use super::version::VersionTuple;

/// Length of a compact recoverable signature: header byte, then `r || s`.
pub const COMPACT_SIGNATURE_LEN: usize = 65;

/// Prefix of every signable encoding. Bump the suffix to change the format;
/// signatures issued under one tag never verify under another.
pub const SIGNABLE_ENCODING_TAG: &[u8] = b"webpatch-record-v1\n";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Malformed manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Manifest lists version {0} more than once")]
    DuplicateVersion(VersionTuple),
}

/// A compact, recoverable-form signature. Carries no signer identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawSignature(pub [u8; COMPACT_SIGNATURE_LEN]);

impl RawSignature {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; COMPACT_SIGNATURE_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        Self::from_slice(&hex::decode(s.trim()).ok()?)
    }

    pub fn as_bytes(&self) -> &[u8; COMPACT_SIGNATURE_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for RawSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawSignature({})", self.to_hex())
    }
}

impl Serialize for RawSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RawSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| {
            de::Error::custom(format!(
                "expected {} hex-encoded signature bytes",
                COMPACT_SIGNATURE_LEN
            ))
        })
    }
}

/// One publishable update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireRecord", into = "WireRecord")]
pub struct UpdateRecord {
    pub version: VersionTuple,
    pub signatures: BTreeSet<RawSignature>,
    /// Untrusted, display only.
    pub release_notes: String,
    pub package_url: String,
    pub timestamp: DateTime<Utc>,
}

/// Manifest wire layout of an [`UpdateRecord`].
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord {
    major_version: u8,
    fork_version: u8,
    minor_version: u8,
    patch_version: u8,
    #[serde(default)]
    signatures: BTreeSet<RawSignature>,
    #[serde(default)]
    release_notes: String,
    update_package_url: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    timestamp: DateTime<Utc>,
}

impl From<WireRecord> for UpdateRecord {
    fn from(wire: WireRecord) -> Self {
        Self {
            version: VersionTuple::new(
                wire.major_version,
                wire.fork_version,
                wire.minor_version,
                wire.patch_version,
            ),
            signatures: wire.signatures,
            release_notes: wire.release_notes,
            package_url: wire.update_package_url,
            timestamp: wire.timestamp,
        }
    }
}

impl From<UpdateRecord> for WireRecord {
    fn from(record: UpdateRecord) -> Self {
        Self {
            major_version: record.version.major,
            fork_version: record.version.fork,
            minor_version: record.version.minor,
            patch_version: record.version.patch,
            signatures: record.signatures,
            release_notes: record.release_notes,
            update_package_url: record.package_url,
            timestamp: record.timestamp,
        }
    }
}

impl UpdateRecord {
    /// Canonical encoding of everything but the signatures.
    ///
    /// Frozen: the tag, key order, and number formats must never change for
    /// this tag, or previously issued signatures stop verifying.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let json_str = |s: &str| serde_json::Value::String(s.to_string()).to_string();
        let body = format!(
            "{{\"majorVersion\":{},\"forkVersion\":{},\"minorVersion\":{},\"patchVersion\":{},\
             \"signatures\":[],\"releaseNotes\":{},\"updatePackageUrl\":{},\"timestamp\":{}}}",
            self.version.major,
            self.version.fork,
            self.version.minor,
            self.version.patch,
            json_str(&self.release_notes),
            json_str(&self.package_url),
            self.timestamp.timestamp(),
        );

        let mut bytes = Vec::with_capacity(SIGNABLE_ENCODING_TAG.len() + body.len());
        bytes.extend_from_slice(SIGNABLE_ENCODING_TAG);
        bytes.extend_from_slice(body.as_bytes());
        bytes
    }
}

/// Available updates keyed by version. No two records share a version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    updates: BTreeMap<VersionTuple, UpdateRecord>,
}

#[derive(Serialize, Deserialize)]
struct WireManifest {
    updates: Vec<UpdateRecord>,
}

impl Manifest {
    /// Build a manifest, rejecting duplicate versions outright.
    pub fn from_records(
        records: impl IntoIterator<Item = UpdateRecord>,
    ) -> Result<Self, ManifestError> {
        let mut updates = BTreeMap::new();
        for record in records {
            match updates.entry(record.version) {
                Entry::Occupied(_) => return Err(ManifestError::DuplicateVersion(record.version)),
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
            }
        }
        Ok(Self { updates })
    }

    /// Decode a fetched manifest document.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ManifestError> {
        let wire: WireManifest = serde_json::from_slice(bytes)?;
        Self::from_records(wire.updates)
    }

    pub fn to_json_pretty(&self) -> Result<String, ManifestError> {
        let wire = WireManifest {
            updates: self.updates.values().cloned().collect(),
        };
        Ok(serde_json::to_string_pretty(&wire)?)
    }

    /// Records in ascending version order.
    pub fn records(&self) -> impl Iterator<Item = &UpdateRecord> {
        self.updates.values()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Pick the update a build at `running` should install, if any.
///
/// Only records on the running `major.fork.minor` line are eligible; among
/// those, the greatest patch strictly above the running patch wins.
pub fn select_update<'a>(
    manifest: &'a Manifest,
    running: &VersionTuple,
) -> Option<&'a UpdateRecord> {
    manifest
        .records()
        .filter(|record| record.version.same_line(running))
        .filter(|record| record.version.patch > running.patch)
        .max_by_key(|record| record.version)
}
