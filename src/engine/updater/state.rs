//! Update State Machine
//!
//! Tracks where the current check cycle is, and keeps a small persisted
//! history (last check, last outcome, installed version) for status reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use super::version::VersionTuple;

pub const STATE_FILE: &str = "updater-state.json";

/// Step of a check cycle (or startup load).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CycleState {
    /// No cycle in progress
    #[default]
    Idle,
    FetchingManifest,
    SelectingUpdate,
    FetchingPackage { version: VersionTuple },
    Verifying { version: VersionTuple },
    Persisting { version: VersionTuple },
    Decompressing { version: VersionTuple },
    Decoding { version: VersionTuple },
    Applying { version: VersionTuple },
    /// Cycle ended early
    Aborted { reason: String },
}

impl CycleState {
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle | Self::Aborted { .. })
    }
}

/// Updater state persisted to disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdaterState {
    pub cycle: CycleState,
    /// Last time a check cycle started
    pub last_check: Option<DateTime<Utc>>,
    /// Human-readable outcome of the last cycle
    pub last_outcome: Option<String>,
    /// Version of the web content currently applied, if an update is installed
    pub installed_version: Option<VersionTuple>,
}

impl UpdaterState {
    /// Load state from disk, or create default if not exists
    pub fn load(state_path: &Path) -> Result<Self, StateError> {
        if state_path.exists() {
            let content = fs::read_to_string(state_path)
                .map_err(|e| StateError::ReadError(e.to_string()))?;
            serde_json::from_str(&content).map_err(|e| StateError::ParseError(e.to_string()))
        } else {
            Ok(Self::default())
        }
    }

    /// Save state to disk atomically
    pub fn save(&self, state_path: &Path) -> Result<(), StateError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| StateError::SerializeError(e.to_string()))?;

        let temp_path = state_path.with_extension("tmp");
        fs::write(&temp_path, &content).map_err(|e| StateError::WriteError(e.to_string()))?;
        fs::rename(&temp_path, state_path).map_err(|e| StateError::WriteError(e.to_string()))?;

        Ok(())
    }

    /// Start a new cycle
    pub fn start_checking(&mut self, now: DateTime<Utc>) {
        self.cycle = CycleState::FetchingManifest;
        self.last_check = Some(now);
    }

    pub fn advance(&mut self, next: CycleState) {
        self.cycle = next;
    }

    /// Mark the web content at `version` as applied
    pub fn mark_installed(&mut self, version: VersionTuple) {
        self.installed_version = Some(version);
    }

    /// Back to built-in content
    pub fn mark_removed(&mut self) {
        self.installed_version = None;
    }

    /// End the cycle, normally or not
    pub fn finish(&mut self, outcome: String, aborted: bool) {
        self.cycle = if aborted {
            CycleState::Aborted { reason: outcome.clone() }
        } else {
            CycleState::Idle
        };
        self.last_outcome = Some(outcome);
    }
}

/// State persistence errors
#[derive(Error, Debug, Clone)]
pub enum StateError {
    #[error("Failed to read state: {0}")]
    ReadError(String),
    #[error("Failed to write state: {0}")]
    WriteError(String),
    #[error("Failed to parse state: {0}")]
    ParseError(String),
    #[error("Failed to serialize state: {0}")]
    SerializeError(String),
}
