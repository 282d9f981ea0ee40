//! Installed Update Storage
//!
//! Persists the installed update as one unit of two files in the data
//! directory: `web.json` (the record) and `web.dat` (the raw package). A unit
//! with only one of the two files is corrupt and is removed on sight.
//!
//! Write order: both files are written to `.tmp` siblings and synced first.
//! Only then is the old description removed, the payload renamed into place
//! and the description renamed last. The description is the commit marker, so
//! a failed write leaves the previous unit untouched and a crash during the
//! renames leaves either nothing or a lone payload.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{error, info, warn};

use super::manifest::UpdateRecord;

pub const DESCRIPTION_FILE: &str = "web.json";
pub const PAYLOAD_FILE: &str = "web.dat";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to serialize update description: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A persisted update: its record and the package bytes it was verified against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledUnit {
    pub record: UpdateRecord,
    pub package: Vec<u8>,
}

/// What is on disk, without reading contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitPresence {
    Absent,
    Complete,
    /// Exactly one of the two files exists.
    Partial,
}

/// Store for the installed update unit.
///
/// All mutations and reads go through one lock so a check cycle and a manual
/// removal never interleave their file operations.
pub struct UpdateStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl UpdateStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn description_path(&self) -> PathBuf {
        self.dir.join(DESCRIPTION_FILE)
    }

    pub fn payload_path(&self) -> PathBuf {
        self.dir.join(PAYLOAD_FILE)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn presence(&self) -> UnitPresence {
        let _guard = self.guard();
        self.presence_unlocked()
    }

    fn presence_unlocked(&self) -> UnitPresence {
        match (self.description_path().exists(), self.payload_path().exists()) {
            (false, false) => UnitPresence::Absent,
            (true, true) => UnitPresence::Complete,
            _ => UnitPresence::Partial,
        }
    }

    /// Persist `record` and `package` as one unit, replacing any previous unit.
    pub fn write_unit(&self, record: &UpdateRecord, package: &[u8]) -> Result<(), StoreError> {
        let _guard = self.guard();
        fs::create_dir_all(&self.dir)?;

        let description = serde_json::to_vec_pretty(record)?;
        let payload_temp = temp_path(&self.payload_path());
        let description_temp = temp_path(&self.description_path());

        let staged = write_synced(&payload_temp, package)
            .and_then(|_| write_synced(&description_temp, &description));
        if let Err(e) = staged {
            let _ = fs::remove_file(&payload_temp);
            let _ = fs::remove_file(&description_temp);
            return Err(e.into());
        }

        remove_if_exists(&self.description_path())?;
        fs::rename(&payload_temp, self.payload_path())?;
        fs::rename(&description_temp, self.description_path())?;

        info!(version = %record.version, bytes = package.len(), "Persisted web update package");
        Ok(())
    }

    /// Read the persisted unit. A half unit or unreadable description is
    /// removed and reported as absent.
    pub fn read_unit(&self) -> Result<Option<InstalledUnit>, StoreError> {
        let _guard = self.guard();

        match self.presence_unlocked() {
            UnitPresence::Absent => return Ok(None),
            UnitPresence::Partial => {
                self.discard_corrupt("found only one of the update files")?;
                return Ok(None);
            }
            UnitPresence::Complete => {}
        }

        let description = fs::read(self.description_path())?;
        let record: UpdateRecord = match serde_json::from_slice(&description) {
            Ok(record) => record,
            Err(e) => {
                self.discard_corrupt(&format!("unreadable description: {}", e))?;
                return Ok(None);
            }
        };
        let package = fs::read(self.payload_path())?;

        Ok(Some(InstalledUnit { record, package }))
    }

    /// Remove both files. Missing files are fine.
    pub fn delete_unit(&self) -> Result<(), StoreError> {
        let _guard = self.guard();
        self.delete_unlocked()
    }

    /// Remove a half unit left behind by an interrupted write. Returns true if
    /// anything was removed.
    pub fn heal(&self) -> Result<bool, StoreError> {
        let _guard = self.guard();
        remove_if_exists(&temp_path(&self.payload_path()))?;
        remove_if_exists(&temp_path(&self.description_path()))?;

        if self.presence_unlocked() == UnitPresence::Partial {
            self.discard_corrupt("found only one of the update files")?;
            return Ok(true);
        }
        Ok(false)
    }

    fn discard_corrupt(&self, why: &str) -> Result<(), StoreError> {
        error!(dir = %self.dir.display(), "Corrupt persisted web update ({}). Removing it.", why);
        self.delete_unlocked()
    }

    fn delete_unlocked(&self) -> Result<(), StoreError> {
        // description first: a lone payload is already treated as absent
        remove_if_exists(&self.description_path())?;
        remove_if_exists(&self.payload_path())?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_synced(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(path = %path.display(), "Failed to remove file: {}", e);
            Err(e)
        }
    }
}
