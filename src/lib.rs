//! Webpatch - Signed web content updates
//! Library behind the `webpatch` binary and embedding hosts

pub mod engine;

use engine::config::UpdaterConfig;
use engine::updater::codec::TarGzCodec;
use engine::updater::download::HttpFetcher;
use engine::updater::error::UpdateError;
use engine::updater::pipeline::{ContentHost, PipelineSettings, UpdatePipeline};
use engine::updater::state::STATE_FILE;
use engine::updater::storage::UpdateStore;
use engine::updater::trust::TrustPolicy;
use engine::updater::verify::SignatureVerifier;
use engine::updater::{build_timestamp, BUILD_VERSION};
use std::path::Path;
use std::sync::Arc;

/// Pipeline for the installation in `data_dir`, with the built-in trust
/// policy and build constants.
pub fn open_pipeline(
    config: &UpdaterConfig,
    data_dir: &Path,
    host: Arc<dyn ContentHost>,
) -> Result<UpdatePipeline<HttpFetcher>, UpdateError> {
    let fetcher = HttpFetcher::new(config.request_timeout(), config.max_download_bytes)?;
    let verifier = SignatureVerifier::new(TrustPolicy::builtin(), build_timestamp());
    let settings = PipelineSettings {
        manifest_url: config.manifest_url.clone(),
        installation_id: config.installation_id.to_string(),
        platform: config.platform.clone(),
        build_version: BUILD_VERSION,
    };

    Ok(
        UpdatePipeline::new(settings, fetcher, verifier, UpdateStore::new(data_dir), host)
            .with_codec(TarGzCodec::new(config.max_unpacked_bytes))
            .with_state_file(data_dir.join(STATE_FILE)),
    )
}
