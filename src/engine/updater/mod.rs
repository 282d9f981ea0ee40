//! Web Content Update System
//!
//! Installs patch updates to the embedded web content without a new binary
//! release. A package is trusted only if enough of the built-in signers signed
//! it, checked against the bytes actually downloaded.
//!
//! Components:
//! - `version` - Version tuple and ordering
//! - `manifest` - Update records, manifest decoding and update selection
//! - `trust` - Built-in signer set and threshold
//! - `verify` - Threshold signature verification
//! - `signing` - Publisher-side signing
//! - `codec` - Package compression and file table
//! - `download` - Manifest and package fetching
//! - `storage` - The persisted update unit
//! - `state` - Cycle state machine and check history
//! - `pipeline` - Check, load and remove flows
//! - `scheduler` - Periodic checks

pub mod codec;
pub mod download;
pub mod error;
pub mod manifest;
pub mod pipeline;
pub mod scheduler;
pub mod signing;
pub mod state;
pub mod storage;
pub mod trust;
pub mod verify;
pub mod version;

use chrono::{DateTime, Utc};

pub use codec::{FileTable, PackageCodec, TarGzCodec};
pub use download::{Fetcher, HttpFetcher, TransportError};
pub use error::UpdateError;
pub use manifest::{select_update, Manifest, RawSignature, UpdateRecord};
pub use pipeline::{
    CheckOptions, Clock, ContentHost, CycleOutcome, LoadOutcome, PipelineSettings, SystemClock,
    UpdateEvent, UpdatePipeline,
};
pub use scheduler::UpdateScheduler;
pub use state::{CycleState, UpdaterState};
pub use storage::{InstalledUnit, UpdateStore};
pub use trust::{Identity, TrustPolicy};
pub use verify::{RejectReason, SignatureVerifier, VerificationResult};
pub use version::VersionTuple;

/// Version of the web content built into this binary.
pub const BUILD_VERSION: VersionTuple = VersionTuple::new(0, 4, 16, b'a');

/// Unix time this binary was built from, set by the build script.
pub const BUILD_TIMESTAMP_SECS: &str = env!("WEBPATCH_BUILD_TIMESTAMP");

/// Updates published before this instant are stale.
pub fn build_timestamp() -> DateTime<Utc> {
    BUILD_TIMESTAMP_SECS
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_default()
}
