//! Web Content Version
//!
//! A four-part version `major.fork.minor-patch` where `patch` is a single
//! printable character (`'a'`..`'z'`), e.g. `0.4.16-b`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Version of the running build or of a published update.
///
/// Ordering is lexicographic on `(major, fork, minor, patch)`; the field
/// order below is what the derived `Ord` relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionTuple {
    pub major: u8,
    pub fork: u8,
    pub minor: u8,
    /// Character ordinal, not a numeric patch level.
    pub patch: u8,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionParseError {
    #[error("Expected version in the form major.fork.minor-patch, got {0:?}")]
    Malformed(String),
    #[error("Invalid version component {0:?}")]
    InvalidComponent(String),
    #[error("Patch must be a single printable character, got {0:?}")]
    InvalidPatch(String),
}

impl VersionTuple {
    pub const fn new(major: u8, fork: u8, minor: u8, patch: u8) -> Self {
        Self { major, fork, minor, patch }
    }

    /// True if both versions belong to the same `major.fork.minor` line.
    pub fn same_line(&self, other: &VersionTuple) -> bool {
        (self.major, self.fork, self.minor) == (other.major, other.fork, other.minor)
    }

    /// Same line, with the given patch.
    pub fn with_patch(self, patch: u8) -> Self {
        Self { patch, ..self }
    }
}

impl fmt::Display for VersionTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}-{}",
            self.major,
            self.fork,
            self.minor,
            char::from(self.patch)
        )
    }
}

impl FromStr for VersionTuple {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (numbers, patch) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| VersionParseError::Malformed(s.to_string()))?;

        let parts: Vec<&str> = numbers.split('.').collect();
        let [major, fork, minor] = parts.as_slice() else {
            return Err(VersionParseError::Malformed(s.to_string()));
        };
        let component = |part: &str| {
            part.parse::<u8>()
                .map_err(|_| VersionParseError::InvalidComponent(part.to_string()))
        };

        let patch = match patch.as_bytes() {
            [c] if c.is_ascii_graphic() => *c,
            _ => return Err(VersionParseError::InvalidPatch(patch.to_string())),
        };

        Ok(Self::new(component(*major)?, component(*fork)?, component(*minor)?, patch))
    }
}
