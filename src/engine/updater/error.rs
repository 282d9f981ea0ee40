//! Updater Error Types

use thiserror::Error;

use super::codec::CodecError;
use super::download::TransportError;
use super::storage::StoreError;

/// Failures local to one check cycle or startup load.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
}
