// Webpatch Engine - Core module structure
pub mod cli;
pub mod config;
pub mod updater;

pub use config::UpdaterConfig;
pub use updater::UpdatePipeline;
