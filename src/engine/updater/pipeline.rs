//! Update Pipeline
//!
//! Drives one check cycle: fetch manifest, select, fetch package, verify,
//! persist, decompress, decode, apply. Also the startup load of a persisted
//! update and its removal.
//!
//! Nothing below the selection step is fatal to the caller. Every cycle ends in
//! a [`CycleOutcome`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

use super::codec::{FileTable, PackageCodec, TarGzCodec};
use super::download::{Fetcher, TransportError};
use super::error::UpdateError;
use super::manifest::{select_update, Manifest, UpdateRecord};
use super::state::{CycleState, UpdaterState};
use super::storage::{InstalledUnit, UpdateStore};
use super::verify::{KeyRecovery, RejectReason, Secp256k1Recovery, SignatureVerifier, VerificationResult};
use super::version::VersionTuple;

/// The application hosting the web content.
pub trait ContentHost: Send + Sync {
    /// Lock the wallet (or whatever else is sensitive) before content changes.
    /// A no-op if the host is not up yet.
    fn lock_sensitive_state(&self);

    /// Serve `files` as the web content and reload it.
    fn apply_content(&self, files: FileTable);

    /// Go back to the content built into the binary and reload it.
    fn revert_to_default(&self);

    /// Asked after a package verified and before it is persisted.
    fn confirm_install(&self, _record: &UpdateRecord) -> bool {
        true
    }

    fn emit(&self, event: UpdateEvent);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Notifications for the host UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "detail", rename_all = "snake_case")]
pub enum UpdateEvent {
    NoUpdateAvailable,
    UpdateRejected(RejectReason),
    UpdateInstalled(VersionTuple),
    UpdateRemoved,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CheckOptions {
    /// Also tell the host when nothing was found or an update was rejected.
    pub verbose: bool,
}

/// How a check cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    NoUpdateAvailable,
    Rejected(RejectReason),
    Declined(VersionTuple),
    Installed(VersionTuple),
    Failed(UpdateError),
    /// Another cycle was in flight; nothing was done.
    AlreadyRunning,
}

impl CycleOutcome {
    pub fn is_aborted(&self) -> bool {
        !matches!(self, Self::Installed(_))
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoUpdateAvailable => write!(f, "no update available"),
            Self::Rejected(reason) => write!(f, "update rejected: {}", reason),
            Self::Declined(version) => write!(f, "update {} declined", version),
            Self::Installed(version) => write!(f, "installed {}", version),
            Self::Failed(e) => write!(f, "update failed: {}", e),
            Self::AlreadyRunning => write!(f, "check already in progress"),
        }
    }
}

/// How loading the persisted update ended.
#[derive(Debug)]
pub enum LoadOutcome {
    NotInstalled,
    Applied(VersionTuple),
    /// The persisted unit no longer verifies and was removed.
    Rejected(RejectReason),
    Failed(UpdateError),
}

impl fmt::Display for LoadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInstalled => write!(f, "no update installed"),
            Self::Applied(version) => write!(f, "loaded {}", version),
            Self::Rejected(reason) => write!(f, "installed update rejected: {}", reason),
            Self::Failed(e) => write!(f, "failed to load installed update: {}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub manifest_url: String,
    pub installation_id: String,
    pub platform: String,
    /// Version of the web content built into the binary.
    pub build_version: VersionTuple,
}

/// Operating system name reported with manifest requests.
pub const fn os_name() -> &'static str {
    if cfg!(target_os = "linux") {
        "linux"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "mac"
    } else {
        "unknown"
    }
}

/// Holds the "cycle active" flag until dropped.
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct UpdatePipeline<F, R = Secp256k1Recovery> {
    settings: PipelineSettings,
    fetcher: F,
    verifier: SignatureVerifier<R>,
    codec: Box<dyn PackageCodec>,
    store: UpdateStore,
    host: Arc<dyn ContentHost>,
    clock: Arc<dyn Clock>,
    running: Mutex<VersionTuple>,
    state: Mutex<UpdaterState>,
    state_path: Option<PathBuf>,
    cycle_active: AtomicBool,
}

impl<F: Fetcher, R: KeyRecovery> UpdatePipeline<F, R> {
    pub fn new(
        settings: PipelineSettings,
        fetcher: F,
        verifier: SignatureVerifier<R>,
        store: UpdateStore,
        host: Arc<dyn ContentHost>,
    ) -> Self {
        let running = settings.build_version;
        Self {
            settings,
            fetcher,
            verifier,
            codec: Box::new(TarGzCodec::default()),
            store,
            host,
            clock: Arc::new(SystemClock),
            running: Mutex::new(running),
            state: Mutex::new(UpdaterState::default()),
            state_path: None,
            cycle_active: AtomicBool::new(false),
        }
    }

    pub fn with_codec(mut self, codec: impl PackageCodec + 'static) -> Self {
        self.codec = Box::new(codec);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Keep the check history in `path`, starting from what is already there.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        match UpdaterState::load(&path) {
            Ok(mut state) => {
                if state.cycle.is_active() {
                    state.cycle = CycleState::Aborted {
                        reason: "interrupted".to_string(),
                    };
                }
                self.state = Mutex::new(state);
            }
            Err(e) => warn!(path = %path.display(), "Ignoring unreadable updater state: {}", e),
        }
        self.state_path = Some(path);
        self
    }

    pub fn store(&self) -> &UpdateStore {
        &self.store
    }

    /// Version of the content currently served: the build version, or the
    /// applied update.
    pub fn running_version(&self) -> VersionTuple {
        *self.running_guard()
    }

    pub fn state(&self) -> UpdaterState {
        self.state_guard().clone()
    }

    pub fn is_checking(&self) -> bool {
        self.cycle_active.load(Ordering::Acquire)
    }

    /// Manifest URL with the installation id, running version, and platform.
    pub fn manifest_request_url(&self, running: &VersionTuple) -> Result<String, UpdateError> {
        let version = running.to_string();
        let url = reqwest::Url::parse_with_params(
            &self.settings.manifest_url,
            &[
                ("uuid", self.settings.installation_id.as_str()),
                ("version", version.as_str()),
                ("platform", self.settings.platform.as_str()),
                ("os", os_name()),
            ],
        )
        .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        Ok(url.to_string())
    }

    /// Run one check cycle. Returns [`CycleOutcome::AlreadyRunning`] if a
    /// cycle is already in flight.
    pub async fn check_for_update(&self, options: CheckOptions) -> CycleOutcome {
        let Some(_active) = CycleGuard::acquire(&self.cycle_active) else {
            debug!("Update check already in progress");
            return CycleOutcome::AlreadyRunning;
        };

        let now = self.clock.now();
        self.state_guard().start_checking(now);

        let outcome = self.run_cycle().await;
        self.report(&outcome, options);
        self.finish(outcome.to_string(), outcome.is_aborted());
        outcome
    }

    async fn run_cycle(&self) -> CycleOutcome {
        match self.store.heal() {
            Ok(true) => warn!("Removed a partially written web update package"),
            Ok(false) => {}
            Err(e) => warn!("Failed to inspect persisted web update: {}", e),
        }

        let running = self.running_version();
        let manifest_url = match self.manifest_request_url(&running) {
            Ok(url) => url,
            Err(e) => {
                error!(url = %self.settings.manifest_url, "Invalid manifest URL: {}", e);
                return CycleOutcome::Failed(e);
            }
        };

        let Some(record) = self.fetch_candidate(&manifest_url, &running).await else {
            return CycleOutcome::NoUpdateAvailable;
        };
        let version = record.version;

        self.advance(CycleState::FetchingPackage { version });
        info!(version = %version, url = %record.package_url, "Downloading web update package");
        let package = match self.fetcher.fetch(&record.package_url).await {
            Ok(package) => package,
            Err(e) => {
                error!(version = %version, "Failed to download web update package: {}", e);
                return CycleOutcome::Failed(e.into());
            }
        };

        self.advance(CycleState::Verifying { version });
        if let VerificationResult::Rejected(reason) = self.verifier.verify(&record, &package) {
            return CycleOutcome::Rejected(reason);
        }

        if !self.host.confirm_install(&record) {
            warn!(version = %version, "User rejected web update package");
            return CycleOutcome::Declined(version);
        }

        self.advance(CycleState::Persisting { version });
        if let Err(e) = self.store.write_unit(&record, &package) {
            error!(version = %version, "Failed to persist web update package: {}", e);
            return CycleOutcome::Failed(e.into());
        }

        let files = match self.unpack(version, &package) {
            Ok(files) => files,
            Err(e) => {
                self.discard_installed(version);
                return CycleOutcome::Failed(e);
            }
        };

        self.apply(version, files);
        CycleOutcome::Installed(version)
    }

    /// Fetch and decode the manifest, then pick the record to install.
    /// Every failure here means "no update".
    async fn fetch_candidate(&self, url: &str, running: &VersionTuple) -> Option<UpdateRecord> {
        self.advance(CycleState::FetchingManifest);
        info!(url = %url, running = %running, "Checking for web updates");

        let bytes = match self.fetcher.fetch(url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to fetch update manifest: {}", e);
                return None;
            }
        };
        let manifest = match Manifest::from_json(&bytes) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Error during update checking: {}", e);
                return None;
            }
        };

        self.advance(CycleState::SelectingUpdate);
        let Some(record) = select_update(&manifest, running) else {
            info!(running = %running, updates = manifest.len(), "No web update available");
            return None;
        };

        let threshold = usize::from(self.verifier.policy().threshold());
        if record.signatures.len() < threshold {
            info!(
                version = %record.version,
                signatures = record.signatures.len(),
                required = threshold,
                "Ignoring under-signed web update"
            );
            return None;
        }

        Some(record.clone())
    }

    fn unpack(&self, version: VersionTuple, package: &[u8]) -> Result<FileTable, UpdateError> {
        self.advance(CycleState::Decompressing { version });
        let raw = self.codec.decompress(package).inspect_err(|e| {
            error!(version = %version, "Failed to decompress web update package: {}", e)
        })?;

        self.advance(CycleState::Decoding { version });
        let files = self.codec.decode_file_table(&raw).inspect_err(|e| {
            error!(version = %version, "Failed to deserialize web update package: {}", e)
        })?;

        debug!(version = %version, files = files.len(), "Decoded web update package");
        Ok(files)
    }

    fn apply(&self, version: VersionTuple, files: FileTable) {
        self.advance(CycleState::Applying { version });
        self.host.lock_sensitive_state();
        self.host.apply_content(files);

        *self.running_guard() = version;
        self.state_guard().mark_installed(version);
        info!(version = %version, "Applied web update");
    }

    /// Drop a persisted unit that can't be used. With nothing left on disk
    /// the running version falls back to the build.
    fn discard_installed(&self, version: VersionTuple) {
        warn!(version = %version, "Removing unusable web update package");
        if let Err(e) = self.store.delete_unit() {
            error!(version = %version, "Failed to remove web update package: {}", e);
        }
        *self.running_guard() = self.settings.build_version;
        self.state_guard().mark_removed();
    }

    fn report(&self, outcome: &CycleOutcome, options: CheckOptions) {
        match outcome {
            CycleOutcome::NoUpdateAvailable if options.verbose => {
                self.host.emit(UpdateEvent::NoUpdateAvailable)
            }
            CycleOutcome::Rejected(reason) if options.verbose => {
                self.host.emit(UpdateEvent::UpdateRejected(*reason))
            }
            CycleOutcome::Installed(version) => self.host.emit(UpdateEvent::UpdateInstalled(*version)),
            _ => {}
        }
    }

    /// Verify, decode and apply the persisted update, if any. Runs at startup.
    ///
    /// The persisted package is verified again every time: the trust policy or
    /// the build may have changed since it was installed.
    pub fn load_installed_update(&self) -> LoadOutcome {
        let unit = match self.store.read_unit() {
            Ok(Some(unit)) => unit,
            Ok(None) => {
                info!("No web update package found");
                self.state_guard().mark_removed();
                self.persist_state();
                return LoadOutcome::NotInstalled;
            }
            Err(e) => {
                error!("Failed to read persisted web update: {}", e);
                return LoadOutcome::Failed(e.into());
            }
        };

        let outcome = self.reload(unit);
        self.finish(outcome.to_string(), !matches!(outcome, LoadOutcome::Applied(_)));
        outcome
    }

    fn reload(&self, unit: InstalledUnit) -> LoadOutcome {
        let InstalledUnit { record, package } = unit;
        let version = record.version;

        self.advance(CycleState::Verifying { version });
        if let VerificationResult::Rejected(reason) = self.verifier.verify(&record, &package) {
            error!(version = %version, "Persisted web update package failed verification");
            self.discard_installed(version);
            return LoadOutcome::Rejected(reason);
        }

        match self.unpack(version, &package) {
            Ok(files) => {
                self.apply(version, files);
                LoadOutcome::Applied(version)
            }
            Err(e) => {
                self.discard_installed(version);
                LoadOutcome::Failed(e)
            }
        }
    }

    /// Delete the persisted update and go back to the built-in content.
    pub fn remove_installed_update(&self) -> Result<(), UpdateError> {
        warn!("User uninstalls web update package");
        self.store.delete_unit()?;

        self.host.lock_sensitive_state();
        self.host.revert_to_default();

        *self.running_guard() = self.settings.build_version;
        self.state_guard().mark_removed();
        self.persist_state();

        self.host.emit(UpdateEvent::UpdateRemoved);
        Ok(())
    }

    fn advance(&self, next: CycleState) {
        debug!(state = ?next, "Update pipeline transition");
        self.state_guard().advance(next);
    }

    fn finish(&self, outcome: String, aborted: bool) {
        self.state_guard().finish(outcome, aborted);
        self.persist_state();
    }

    fn persist_state(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let snapshot = self.state();
        if let Err(e) = snapshot.save(path) {
            warn!(path = %path.display(), "Failed to save updater state: {}", e);
        }
    }

    fn running_guard(&self) -> MutexGuard<'_, VersionTuple> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_guard(&self) -> MutexGuard<'_, UpdaterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::updater::codec::pack_file_table;
    use crate::engine::updater::signing::sign_update;
    use crate::engine::updater::storage::UnitPresence;
    use crate::engine::updater::trust::{Identity, TrustPolicy};
    use chrono::TimeZone;
    use k256::ecdsa::SigningKey;
    use std::collections::{BTreeSet, HashMap};
    use tempfile::{tempdir, TempDir};

    const MANIFEST_URL: &str = "https://updates.example.org/manifest.json";
    const BUILD: VersionTuple = VersionTuple::new(1, 4, 16, b'a');

    #[derive(Default)]
    struct MockFetcher {
        responses: HashMap<String, Vec<u8>>,
        requests: Mutex<Vec<String>>,
    }

    impl MockFetcher {
        fn serve(mut self, url: &str, body: Vec<u8>) -> Self {
            self.responses.insert(url.to_string(), body);
            self
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Fetcher for MockFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, TransportError> {
            self.requests.lock().unwrap().push(url.to_string());
            let base = url.split('?').next().unwrap_or(url);
            self.responses
                .get(base)
                .cloned()
                .ok_or_else(|| TransportError::InvalidResponse("HTTP 404 Not Found".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        calls: Mutex<Vec<String>>,
        events: Mutex<Vec<UpdateEvent>>,
        applied: Mutex<Option<FileTable>>,
        decline: bool,
    }

    impl RecordingHost {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn events(&self) -> Vec<UpdateEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ContentHost for RecordingHost {
        fn lock_sensitive_state(&self) {
            self.calls.lock().unwrap().push("lock".to_string());
        }

        fn apply_content(&self, files: FileTable) {
            self.calls.lock().unwrap().push("apply".to_string());
            *self.applied.lock().unwrap() = Some(files);
        }

        fn revert_to_default(&self) {
            self.calls.lock().unwrap().push("revert".to_string());
        }

        fn confirm_install(&self, _record: &UpdateRecord) -> bool {
            !self.decline
        }

        fn emit(&self, event: UpdateEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_slice(&[seed; 32]).unwrap()
    }

    fn verifier() -> SignatureVerifier {
        let signers = (1..=3).map(|s| {
            Identity::from_compressed_key(key(s).verifying_key().to_encoded_point(true).as_bytes())
        });
        let policy = TrustPolicy::new(signers, 2).unwrap();
        SignatureVerifier::new(policy, Utc.timestamp_opt(1_600_000_000, 0).unwrap())
    }

    fn content(tag: &str) -> FileTable {
        let mut table = FileTable::new();
        table.insert("index.html".to_string(), format!("<html>{}</html>", tag).into_bytes());
        table
    }

    fn package_url(version: VersionTuple) -> String {
        format!("https://updates.example.org/{}.pak", version)
    }

    fn signed_record(version: VersionTuple, package: &[u8], seeds: &[u8]) -> UpdateRecord {
        let mut record = UpdateRecord {
            version,
            signatures: BTreeSet::new(),
            release_notes: "Fixes".to_string(),
            package_url: package_url(version),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        };
        for seed in seeds {
            record.signatures.insert(sign_update(&record, package, &key(*seed)).unwrap());
        }
        record
    }

    fn manifest_json(records: Vec<UpdateRecord>) -> Vec<u8> {
        Manifest::from_records(records)
            .unwrap()
            .to_json_pretty()
            .unwrap()
            .into_bytes()
    }

    /// A fetcher serving one valid update at `version`.
    fn serving(version: VersionTuple, seeds: &[u8]) -> MockFetcher {
        let package = pack_file_table(&content("v2")).unwrap();
        let record = signed_record(version, &package, seeds);
        MockFetcher::default()
            .serve(MANIFEST_URL, manifest_json(vec![record]))
            .serve(&package_url(version), package)
    }

    fn pipeline(
        dir: &TempDir,
        fetcher: MockFetcher,
        host: Arc<RecordingHost>,
    ) -> UpdatePipeline<MockFetcher> {
        let settings = PipelineSettings {
            manifest_url: MANIFEST_URL.to_string(),
            installation_id: "3f1c2a9e-0000-4000-8000-000000000001".to_string(),
            platform: "test".to_string(),
            build_version: BUILD,
        };
        UpdatePipeline::new(settings, fetcher, verifier(), UpdateStore::new(dir.path()), host)
            .with_state_file(dir.path().join("updater-state.json"))
    }

    const VERBOSE: CheckOptions = CheckOptions { verbose: true };

    #[tokio::test]
    async fn test_installs_valid_update() {
        let dir = tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let target = BUILD.with_patch(b'b');
        let p = pipeline(&dir, serving(target, &[1, 2]), host.clone());

        let outcome = p.check_for_update(CheckOptions::default()).await;
        assert!(matches!(outcome, CycleOutcome::Installed(v) if v == target));

        assert_eq!(host.calls(), vec!["lock", "apply"]);
        assert_eq!(host.applied.lock().unwrap().clone(), Some(content("v2")));
        assert_eq!(host.events(), vec![UpdateEvent::UpdateInstalled(target)]);
        assert_eq!(p.store().presence(), UnitPresence::Complete);
        assert_eq!(p.running_version(), target);

        let state = p.state();
        assert_eq!(state.cycle, CycleState::Idle);
        assert_eq!(state.installed_version, Some(target));
        assert!(state.last_check.is_some());
        assert!(!p.is_checking());

        let saved = UpdaterState::load(&dir.path().join("updater-state.json")).unwrap();
        assert_eq!(saved.installed_version, Some(target));
    }

    #[tokio::test]
    async fn test_next_check_looks_past_installed_version() {
        let dir = tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let p = pipeline(&dir, serving(BUILD.with_patch(b'b'), &[1, 2]), host.clone());

        assert!(matches!(p.check_for_update(VERBOSE).await, CycleOutcome::Installed(_)));
        assert!(matches!(
            p.check_for_update(VERBOSE).await,
            CycleOutcome::NoUpdateAvailable
        ));
        assert_eq!(host.events().last(), Some(&UpdateEvent::NoUpdateAvailable));
    }

    #[tokio::test]
    async fn test_manifest_failure_is_no_update() {
        let dir = tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let p = pipeline(&dir, MockFetcher::default(), host.clone());

        let outcome = p.check_for_update(CheckOptions::default()).await;
        assert!(matches!(outcome, CycleOutcome::NoUpdateAvailable));
        // quiet unless verbose
        assert!(host.events().is_empty());
        assert!(matches!(p.state().cycle, CycleState::Aborted { .. }));

        p.check_for_update(VERBOSE).await;
        assert_eq!(host.events(), vec![UpdateEvent::NoUpdateAvailable]);
    }

    #[tokio::test]
    async fn test_malformed_manifest_is_no_update() {
        let dir = tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let fetcher = MockFetcher::default().serve(MANIFEST_URL, b"<html>502</html>".to_vec());
        let p = pipeline(&dir, fetcher, host.clone());

        assert!(matches!(
            p.check_for_update(VERBOSE).await,
            CycleOutcome::NoUpdateAvailable
        ));
        assert_eq!(p.store().presence(), UnitPresence::Absent);
    }

    #[tokio::test]
    async fn test_duplicate_versions_are_no_update() {
        let dir = tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let target = BUILD.with_patch(b'b');
        let package = pack_file_table(&content("v2")).unwrap();
        let record = signed_record(target, &package, &[1, 2]);
        let wire = format!(
            "{{\"updates\":[{0},{0}]}}",
            serde_json::to_string(&record).unwrap()
        );
        let fetcher = MockFetcher::default()
            .serve(MANIFEST_URL, wire.into_bytes())
            .serve(&package_url(target), package);
        let p = pipeline(&dir, fetcher, host);

        assert!(matches!(
            p.check_for_update(CheckOptions::default()).await,
            CycleOutcome::NoUpdateAvailable
        ));
        assert_eq!(p.fetcher.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_under_signed_update_is_not_downloaded() {
        let dir = tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let p = pipeline(&dir, serving(BUILD.with_patch(b'b'), &[1]), host);

        assert!(matches!(
            p.check_for_update(CheckOptions::default()).await,
            CycleOutcome::NoUpdateAvailable
        ));
        assert_eq!(p.fetcher.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_package_is_not_persisted() {
        let dir = tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let target = BUILD.with_patch(b'b');
        let package = pack_file_table(&content("v2")).unwrap();
        let record = signed_record(target, &package, &[1, 2]);
        let fetcher = MockFetcher::default()
            .serve(MANIFEST_URL, manifest_json(vec![record]))
            .serve(&package_url(target), pack_file_table(&content("evil")).unwrap());
        let p = pipeline(&dir, fetcher, host.clone());

        let outcome = p.check_for_update(VERBOSE).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Rejected(RejectReason::ThresholdNotMet)
        ));
        assert_eq!(p.store().presence(), UnitPresence::Absent);
        assert!(host.calls().is_empty());
        assert_eq!(
            host.events(),
            vec![UpdateEvent::UpdateRejected(RejectReason::ThresholdNotMet)]
        );
        assert_eq!(p.running_version(), BUILD);
    }

    #[tokio::test]
    async fn test_undecodable_package_is_removed() {
        let dir = tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let target = BUILD.with_patch(b'b');
        // properly signed, but not a package
        let package = b"signed garbage".to_vec();
        let record = signed_record(target, &package, &[1, 2]);
        let fetcher = MockFetcher::default()
            .serve(MANIFEST_URL, manifest_json(vec![record]))
            .serve(&package_url(target), package);
        let p = pipeline(&dir, fetcher, host.clone());

        let outcome = p.check_for_update(CheckOptions::default()).await;
        assert!(matches!(outcome, CycleOutcome::Failed(UpdateError::Codec(_))));
        assert_eq!(p.store().presence(), UnitPresence::Absent);
        assert!(host.calls().is_empty());
        assert_eq!(p.state().installed_version, None);
    }

    #[tokio::test]
    async fn test_undecodable_update_after_load_falls_back_to_build() {
        let dir = tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let target = BUILD.with_patch(b'c');
        let garbage = b"signed garbage".to_vec();
        let record = signed_record(target, &garbage, &[1, 2]);
        let fetcher = MockFetcher::default()
            .serve(MANIFEST_URL, manifest_json(vec![record]))
            .serve(&package_url(target), garbage);
        let p = pipeline(&dir, fetcher, host.clone());

        let package = pack_file_table(&content("v1")).unwrap();
        let installed = signed_record(BUILD.with_patch(b'b'), &package, &[1, 2]);
        p.store().write_unit(&installed, &package).unwrap();
        assert!(matches!(p.load_installed_update(), LoadOutcome::Applied(_)));
        assert_eq!(p.running_version(), BUILD.with_patch(b'b'));

        let outcome = p.check_for_update(CheckOptions::default()).await;
        assert!(matches!(outcome, CycleOutcome::Failed(UpdateError::Codec(_))));
        assert_eq!(p.store().presence(), UnitPresence::Absent);
        assert_eq!(p.running_version(), BUILD);
        assert_eq!(p.state().installed_version, None);
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_previous_unit() {
        let dir = tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let p = pipeline(&dir, serving(BUILD.with_patch(b'c'), &[1, 2]), host.clone());

        let package = pack_file_table(&content("v1")).unwrap();
        let previous = signed_record(BUILD.with_patch(b'b'), &package, &[1, 2]);
        p.store().write_unit(&previous, &package).unwrap();
        // the staged payload can't be created
        std::fs::create_dir(dir.path().join("web.dat.tmp")).unwrap();

        let outcome = p.check_for_update(VERBOSE).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Failed(UpdateError::Persistence(_))
        ));
        assert!(host.calls().is_empty());
        assert!(host.events().is_empty());
        assert_eq!(p.running_version(), BUILD);
        assert!(matches!(p.state().cycle, CycleState::Aborted { .. }));

        let unit = p.store().read_unit().unwrap().unwrap();
        assert_eq!(unit.record, previous);
        assert_eq!(unit.package, package);
    }

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[tokio::test]
    async fn test_last_check_comes_from_clock() {
        let dir = tempdir().unwrap();
        let at = Utc.timestamp_opt(1_750_000_000, 0).unwrap();
        let p = pipeline(&dir, MockFetcher::default(), Arc::new(RecordingHost::default()))
            .with_clock(Arc::new(FixedClock(at)));

        p.check_for_update(CheckOptions::default()).await;
        assert_eq!(p.state().last_check, Some(at));

        let saved = UpdaterState::load(&dir.path().join("updater-state.json")).unwrap();
        assert_eq!(saved.last_check, Some(at));
    }

    #[tokio::test]
    async fn test_declined_update_is_not_persisted() {
        let dir = tempdir().unwrap();
        let host = Arc::new(RecordingHost {
            decline: true,
            ..Default::default()
        });
        let target = BUILD.with_patch(b'b');
        let p = pipeline(&dir, serving(target, &[1, 2]), host.clone());

        let outcome = p.check_for_update(CheckOptions::default()).await;
        assert!(matches!(outcome, CycleOutcome::Declined(v) if v == target));
        assert_eq!(p.store().presence(), UnitPresence::Absent);
        assert!(host.events().is_empty());
    }

    #[tokio::test]
    async fn test_check_while_active() {
        let dir = tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let p = pipeline(&dir, serving(BUILD.with_patch(b'b'), &[1, 2]), host);

        p.cycle_active.store(true, Ordering::Release);
        assert!(matches!(
            p.check_for_update(CheckOptions::default()).await,
            CycleOutcome::AlreadyRunning
        ));
        assert!(p.fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn test_check_heals_half_unit() {
        let dir = tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let p = pipeline(&dir, MockFetcher::default(), host);
        std::fs::write(p.store().payload_path(), b"orphan").unwrap();

        p.check_for_update(CheckOptions::default()).await;
        assert_eq!(p.store().presence(), UnitPresence::Absent);
    }

    #[tokio::test]
    async fn test_load_reapplies_without_fetching() {
        let dir = tempdir().unwrap();
        let target = BUILD.with_patch(b'c');
        {
            let host = Arc::new(RecordingHost::default());
            let p = pipeline(&dir, serving(target, &[2, 3]), host);
            assert!(matches!(
                p.check_for_update(CheckOptions::default()).await,
                CycleOutcome::Installed(_)
            ));
        }

        let host = Arc::new(RecordingHost::default());
        let p = pipeline(&dir, MockFetcher::default(), host.clone());
        let outcome = p.load_installed_update();

        assert!(matches!(outcome, LoadOutcome::Applied(v) if v == target));
        assert_eq!(host.calls(), vec!["lock", "apply"]);
        assert_eq!(host.applied.lock().unwrap().clone(), Some(content("v2")));
        assert_eq!(p.running_version(), target);
        assert!(p.fetcher.requests().is_empty());
    }

    #[test]
    fn test_load_discards_tampered_unit() {
        let dir = tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let p = pipeline(&dir, MockFetcher::default(), host.clone());

        let package = pack_file_table(&content("v2")).unwrap();
        let record = signed_record(BUILD.with_patch(b'b'), &package, &[1, 2]);
        p.store().write_unit(&record, b"swapped on disk").unwrap();

        let outcome = p.load_installed_update();
        assert!(matches!(
            outcome,
            LoadOutcome::Rejected(RejectReason::ThresholdNotMet)
        ));
        assert_eq!(p.store().presence(), UnitPresence::Absent);
        assert!(host.calls().is_empty());
        assert_eq!(p.running_version(), BUILD);
    }

    #[test]
    fn test_load_nothing_installed() {
        let dir = tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let p = pipeline(&dir, MockFetcher::default(), host.clone());
        assert!(matches!(p.load_installed_update(), LoadOutcome::NotInstalled));
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_remove_installed_update() {
        let dir = tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let p = pipeline(&dir, serving(BUILD.with_patch(b'b'), &[1, 2]), host.clone());
        p.check_for_update(CheckOptions::default()).await;

        p.remove_installed_update().unwrap();

        assert_eq!(p.store().presence(), UnitPresence::Absent);
        assert_eq!(p.running_version(), BUILD);
        assert_eq!(host.calls(), vec!["lock", "apply", "lock", "revert"]);
        assert_eq!(host.events().last(), Some(&UpdateEvent::UpdateRemoved));
        assert_eq!(p.state().installed_version, None);
    }

    #[test]
    fn test_manifest_request_url() {
        let dir = tempdir().unwrap();
        let p = pipeline(&dir, MockFetcher::default(), Arc::new(RecordingHost::default()));

        let url = p.manifest_request_url(&BUILD).unwrap();
        let parsed = reqwest::Url::parse(&url).unwrap();
        let query: HashMap<_, _> = parsed.query_pairs().into_owned().collect();

        assert!(url.starts_with(MANIFEST_URL));
        assert_eq!(query["uuid"], "3f1c2a9e-0000-4000-8000-000000000001");
        assert_eq!(query["version"], "1.4.16-a");
        assert_eq!(query["platform"], "test");
        assert_eq!(query["os"], os_name());
    }

    #[test]
    fn test_interrupted_state_is_not_active() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("updater-state.json");
        let mut state = UpdaterState::default();
        state.advance(CycleState::Persisting {
            version: BUILD.with_patch(b'b'),
        });
        state.save(&path).unwrap();

        let p = pipeline(&dir, MockFetcher::default(), Arc::new(RecordingHost::default()));
        assert!(!p.state().cycle.is_active());
    }
}
