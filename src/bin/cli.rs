//! Webpatch CLI - Main entry point for CLI binary
//!
//! Checks for, installs and removes web content updates in a data directory,
//! and packs and signs updates for publishers. Applied content is written to
//! `<data-dir>/web`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use webpatch_lib::engine::cli::formatter::{format_duration, format_since, format_size, CliFormatter};
use webpatch_lib::engine::cli::{Cli, Commands, OutputFormat};
use webpatch_lib::engine::config::UpdaterConfig;
use webpatch_lib::engine::updater::codec::{pack_directory, FileTable};
use webpatch_lib::engine::updater::pipeline::{
    CheckOptions, ContentHost, CycleOutcome, LoadOutcome, UpdateEvent,
};
use webpatch_lib::engine::updater::scheduler::UpdateScheduler;
use webpatch_lib::engine::updater::signing::{parse_signing_key, sign_update, signer_identity};
use webpatch_lib::engine::updater::storage::UnitPresence;
use webpatch_lib::engine::updater::{
    build_timestamp, SignatureVerifier, TrustPolicy, UpdateRecord, VerificationResult,
    BUILD_VERSION,
};
use webpatch_lib::open_pipeline;

const CONTENT_DIR: &str = "web";

/// Serves applied content from a directory and talks to the terminal.
struct CliHost {
    content_dir: PathBuf,
    assume_yes: bool,
    json: bool,
}

impl CliHost {
    fn write_content(&self, files: &FileTable) -> std::io::Result<()> {
        let staging = self.content_dir.with_extension("staging");
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        for (path, contents) in files {
            let target = staging.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(target, contents)?;
        }
        fs::create_dir_all(&staging)?;

        if self.content_dir.exists() {
            fs::remove_dir_all(&self.content_dir)?;
        }
        fs::rename(&staging, &self.content_dir)
    }
}

impl ContentHost for CliHost {
    fn lock_sensitive_state(&self) {
        info!("Locking sensitive state before content change");
    }

    fn apply_content(&self, files: FileTable) {
        let total: usize = files.values().map(Vec::len).sum();
        match self.write_content(&files) {
            Ok(()) => info!(
                dir = %self.content_dir.display(),
                files = files.len(),
                bytes = total,
                "Web content replaced"
            ),
            Err(e) => error!(dir = %self.content_dir.display(), "Failed to write web content: {}", e),
        }
    }

    fn revert_to_default(&self) {
        if let Err(e) = fs::remove_dir_all(&self.content_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(dir = %self.content_dir.display(), "Failed to remove web content: {}", e);
            }
        }
    }

    fn confirm_install(&self, record: &UpdateRecord) -> bool {
        if self.assume_yes {
            return true;
        }
        if self.json {
            // no prompts in machine output
            return false;
        }

        CliFormatter::header(&format!("Web update {} available", record.version));
        if !record.release_notes.is_empty() {
            CliFormatter::quote(&record.release_notes);
        }
        CliFormatter::confirm("Install it now?", true).unwrap_or(false)
    }

    fn emit(&self, event: UpdateEvent) {
        if self.json {
            if let Ok(line) = serde_json::to_string(&event) {
                eprintln!("{}", line);
            }
            return;
        }
        match event {
            UpdateEvent::NoUpdateAvailable => CliFormatter::info("No update available"),
            UpdateEvent::UpdateRejected(reason) => {
                CliFormatter::warning(&format!("Update rejected: {}", reason))
            }
            UpdateEvent::UpdateInstalled(version) => {
                CliFormatter::success(&format!("Installed web update {}", version))
            }
            UpdateEvent::UpdateRemoved => CliFormatter::success("Removed installed web update"),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run_cli(cli).await {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_cli(cli: Cli) -> Result<()> {
    let data_dir = cli.get_data_dir();
    let json = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Check { yes } => cmd_check(&data_dir, yes, json).await,
        Commands::Load => cmd_load(&data_dir, json),
        Commands::Remove { yes } => cmd_remove(&data_dir, yes, json),
        Commands::Status => cmd_status(&data_dir, json),
        Commands::Watch { now, report_all } => cmd_watch(&data_dir, now, report_all, json).await,
        Commands::Pack { dir, out } => cmd_pack(&dir, &out, json),
        Commands::Sign { key, record, package } => cmd_sign(&key, &record, &package, json),
        Commands::Verify { record, package } => cmd_verify(&record, &package, json),
    }
}

fn host(data_dir: &Path, assume_yes: bool, json: bool) -> Arc<CliHost> {
    Arc::new(CliHost {
        content_dir: data_dir.join(CONTENT_DIR),
        assume_yes,
        json,
    })
}

fn load_config(data_dir: &Path) -> Result<UpdaterConfig> {
    UpdaterConfig::load_or_create(data_dir)
        .with_context(|| format!("loading config from {}", data_dir.display()))
}

async fn cmd_check(data_dir: &Path, yes: bool, json: bool) -> Result<()> {
    let config = load_config(data_dir)?;
    let pipeline = open_pipeline(&config, data_dir, host(data_dir, yes, json))?;

    // look for patches above what is installed, not above the build
    pipeline.load_installed_update();
    let outcome = pipeline.check_for_update(CheckOptions { verbose: true }).await;

    if json {
        println!("{}", cycle_json(&outcome));
    } else if let CycleOutcome::Declined(version) = &outcome {
        CliFormatter::info(&format!("Skipped {}. Run `webpatch check` to install it later.", version));
    }

    match outcome {
        CycleOutcome::Failed(e) => Err(e.into()),
        _ => Ok(()),
    }
}

fn cycle_json(outcome: &CycleOutcome) -> serde_json::Value {
    match outcome {
        CycleOutcome::NoUpdateAvailable => serde_json::json!({ "outcome": "no_update_available" }),
        CycleOutcome::Rejected(reason) => serde_json::json!({ "outcome": "rejected", "reason": reason }),
        CycleOutcome::Declined(version) => {
            serde_json::json!({ "outcome": "declined", "version": version.to_string() })
        }
        CycleOutcome::Installed(version) => {
            serde_json::json!({ "outcome": "installed", "version": version.to_string() })
        }
        CycleOutcome::Failed(e) => serde_json::json!({ "outcome": "failed", "error": e.to_string() }),
        CycleOutcome::AlreadyRunning => serde_json::json!({ "outcome": "already_running" }),
    }
}

fn cmd_load(data_dir: &Path, json: bool) -> Result<()> {
    let config = load_config(data_dir)?;
    let pipeline = open_pipeline(&config, data_dir, host(data_dir, true, json))?;

    let outcome = pipeline.load_installed_update();
    if json {
        let value = match &outcome {
            LoadOutcome::NotInstalled => serde_json::json!({ "outcome": "not_installed" }),
            LoadOutcome::Applied(version) => {
                serde_json::json!({ "outcome": "applied", "version": version.to_string() })
            }
            LoadOutcome::Rejected(reason) => serde_json::json!({ "outcome": "rejected", "reason": reason }),
            LoadOutcome::Failed(e) => serde_json::json!({ "outcome": "failed", "error": e.to_string() }),
        };
        println!("{}", value);
    } else {
        match &outcome {
            LoadOutcome::NotInstalled => CliFormatter::info("No web update installed"),
            LoadOutcome::Applied(version) => CliFormatter::success(&format!("Loaded web update {}", version)),
            LoadOutcome::Rejected(reason) => {
                CliFormatter::warning(&format!("Installed update rejected and removed: {}", reason))
            }
            LoadOutcome::Failed(_) => {}
        }
    }

    match outcome {
        LoadOutcome::Failed(e) => Err(e.into()),
        _ => Ok(()),
    }
}

fn cmd_remove(data_dir: &Path, yes: bool, json: bool) -> Result<()> {
    if !yes {
        if json {
            bail!("refusing to remove without --yes in json mode");
        }
        if !CliFormatter::confirm("Are you sure you want to remove all installed updates?", false)? {
            return Ok(());
        }
    }

    let config = load_config(data_dir)?;
    let pipeline = open_pipeline(&config, data_dir, host(data_dir, yes, json))?;
    pipeline.remove_installed_update()?;

    if json {
        println!("{}", serde_json::json!({ "removed": true }));
    }
    Ok(())
}

fn cmd_status(data_dir: &Path, json: bool) -> Result<()> {
    let config = load_config(data_dir)?;
    let pipeline = open_pipeline(&config, data_dir, host(data_dir, true, json))?;
    let state = pipeline.state();
    let presence = pipeline.store().presence();
    let policy = TrustPolicy::builtin();

    if json {
        println!(
            "{}",
            serde_json::json!({
                "data_dir": data_dir.display().to_string(),
                "build_version": BUILD_VERSION.to_string(),
                "build_timestamp": build_timestamp().timestamp(),
                "installed_version": state.installed_version.map(|v| v.to_string()),
                "persisted_unit": format!("{:?}", presence).to_lowercase(),
                "cycle": state.cycle,
                "last_check": state.last_check.map(|t| t.timestamp()),
                "last_outcome": state.last_outcome,
                "check_interval_secs": config.check_interval_secs,
                "signers": policy.signing_identities().len(),
                "threshold": policy.threshold(),
            })
        );
        return Ok(());
    }

    CliFormatter::header("Web Update Status");
    CliFormatter::kv("Data dir", &data_dir.display().to_string());
    CliFormatter::kv("Build version", &BUILD_VERSION.to_string());
    CliFormatter::kv("Build time", &build_timestamp().format("%Y-%m-%d %H:%M:%S UTC").to_string());
    let installed = match (state.installed_version, presence) {
        (Some(version), UnitPresence::Complete) => version.to_string(),
        (_, UnitPresence::Complete) => "present, not loaded".to_string(),
        (_, UnitPresence::Partial) => "incomplete (removed on next check)".to_string(),
        (_, UnitPresence::Absent) => "none".to_string(),
    };
    CliFormatter::kv("Installed update", &installed);
    if presence == UnitPresence::Complete {
        let size = fs::metadata(pipeline.store().payload_path())
            .map(|m| m.len())
            .unwrap_or(0);
        CliFormatter::kv("Package size", &format_size(size));
    }
    let last_check = state
        .last_check
        .map(|at| format_since(at, chrono::Utc::now()))
        .unwrap_or_else(|| "never".to_string());
    CliFormatter::kv("Last check", &last_check);
    if let Some(outcome) = &state.last_outcome {
        CliFormatter::kv("Last outcome", outcome);
    }
    CliFormatter::kv("Check interval", &format_duration(config.check_interval_secs));
    CliFormatter::kv(
        "Signers",
        &format!("{} of {} required", policy.threshold(), policy.signing_identities().len()),
    );
    Ok(())
}

async fn cmd_watch(data_dir: &Path, now: bool, report_all: bool, json: bool) -> Result<()> {
    let config = load_config(data_dir)?;
    let pipeline = Arc::new(open_pipeline(&config, data_dir, host(data_dir, true, json))?);
    pipeline.load_installed_update();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = UpdateScheduler::new(pipeline, config.check_interval())
        .check_on_start(now)
        .with_options(CheckOptions { verbose: report_all })
        .spawn(shutdown_rx);

    if !json {
        CliFormatter::info(&format!(
            "Checking every {}. Press Ctrl-C to stop.",
            format_duration(config.check_interval_secs)
        ));
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    // receiver may already be gone if the scheduler exited
    let _ = shutdown_tx.send(true);
    let cycles = scheduler.await.context("update scheduler panicked")?;

    if json {
        println!("{}", serde_json::json!({ "cycles": cycles }));
    }
    Ok(())
}

fn cmd_pack(dir: &Path, out: &Path, json: bool) -> Result<()> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let package = pack_directory(dir).with_context(|| format!("packing {}", dir.display()))?;
    fs::write(out, &package).with_context(|| format!("writing {}", out.display()))?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "package": out.display().to_string(), "bytes": package.len() })
        );
    } else {
        CliFormatter::success(&format!(
            "Wrote {} ({})",
            out.display(),
            format_size(package.len() as u64)
        ));
    }
    Ok(())
}

fn read_record(path: &Path) -> Result<UpdateRecord> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing update record {}", path.display()))
}

fn cmd_sign(key: &str, record: &Path, package: &Path, json: bool) -> Result<()> {
    let key = parse_signing_key(key)?;
    let record = read_record(record)?;
    let package = fs::read(package).with_context(|| format!("reading {}", package.display()))?;

    let signature = sign_update(&record, &package, &key)?;
    let signer = signer_identity(&key);
    let authorized = TrustPolicy::builtin().is_authorized(&signer);

    if json {
        println!(
            "{}",
            serde_json::json!({
                "version": record.version.to_string(),
                "signature": signature.to_hex(),
                "signer": signer.as_str(),
                "authorized": authorized,
            })
        );
    } else {
        CliFormatter::kv("Version", &record.version.to_string());
        CliFormatter::kv("Signer", signer.as_str());
        CliFormatter::kv("Signature", &signature.to_hex());
        if !authorized {
            CliFormatter::warning("Signer is not one of the built-in update signers");
        }
    }
    Ok(())
}

fn cmd_verify(record: &Path, package: &Path, json: bool) -> Result<()> {
    let record = read_record(record)?;
    let package = fs::read(package).with_context(|| format!("reading {}", package.display()))?;

    let verifier = SignatureVerifier::new(TrustPolicy::builtin(), build_timestamp());
    let result = verifier.verify(&record, &package);

    if json {
        let value = match &result {
            VerificationResult::Accepted => serde_json::json!({ "accepted": true }),
            VerificationResult::Rejected(reason) => {
                serde_json::json!({ "accepted": false, "reason": reason })
            }
        };
        println!("{}", value);
    }

    match result {
        VerificationResult::Accepted => {
            if !json {
                CliFormatter::success(&format!("Update {} verifies", record.version));
            }
            Ok(())
        }
        VerificationResult::Rejected(reason) => bail!("update {} rejected: {}", record.version, reason),
    }
}
